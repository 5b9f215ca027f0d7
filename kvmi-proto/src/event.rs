//! Event bodies and the replies the introspector sends back.
//!
//! An event body is a common section (`size`, `vcpu`, `event`, register
//! snapshot) followed by a kind-specific payload starting at offset `size`.
//! A reply body is `[vcpu header][action, event][kind-specific reply]`.

use crate::arch::EventArch;
use crate::codec::{Decode, Encode, Reader, Writer};
use crate::error::{Error, Result};
use crate::message::{Action, EventKind};
use crate::page::Access;

/// Maximum context bytes a page-fault reply may carry.
pub const PF_CTX_MAX: usize = 256;

/// Size of the common section this crate emits.
pub const EVENT_COMMON_SIZE: usize = 8 + EventArch::SIZE;

/// An event received from the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Sequence number the reply must echo.
    pub seq: u32,
    /// Vcpu that raised the event.
    pub vcpu: u16,
    /// Register snapshot at the time of the event.
    pub arch: EventArch,
    /// Kind-specific data.
    pub payload: EventPayload,
}

/// Kind-specific event data.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum EventPayload {
    Unhook,
    Cr(CrEvent),
    Msr(MsrEvent),
    Xsetbv(XsetbvEvent),
    Breakpoint(BreakpointEvent),
    Hypercall,
    PageFault(PageFaultEvent),
    Trap(TrapEvent),
    Descriptor(DescriptorEvent),
    CreateVcpu,
    PauseVcpu,
    SingleStep(SingleStepEvent),
}

impl EventPayload {
    /// The event kind this payload belongs to.
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Unhook => EventKind::Unhook,
            Self::Cr(_) => EventKind::Cr,
            Self::Msr(_) => EventKind::Msr,
            Self::Xsetbv(_) => EventKind::Xsetbv,
            Self::Breakpoint(_) => EventKind::Breakpoint,
            Self::Hypercall => EventKind::Hypercall,
            Self::PageFault(_) => EventKind::PageFault,
            Self::Trap(_) => EventKind::Trap,
            Self::Descriptor(_) => EventKind::Descriptor,
            Self::CreateVcpu => EventKind::CreateVcpu,
            Self::PauseVcpu => EventKind::PauseVcpu,
            Self::SingleStep(_) => EventKind::SingleStep,
        }
    }

    /// Parses the payload for `kind`.
    fn decode(kind: EventKind, r: &mut Reader<'_>) -> Result<Self> {
        Ok(match kind {
            EventKind::Unhook => Self::Unhook,
            EventKind::Cr => Self::Cr(r.get()?),
            EventKind::Msr => Self::Msr(r.get()?),
            EventKind::Xsetbv => Self::Xsetbv(r.get()?),
            EventKind::Breakpoint => Self::Breakpoint(r.get()?),
            EventKind::Hypercall => Self::Hypercall,
            EventKind::PageFault => Self::PageFault(r.get()?),
            EventKind::Trap => Self::Trap(r.get()?),
            EventKind::Descriptor => Self::Descriptor(r.get()?),
            EventKind::CreateVcpu => Self::CreateVcpu,
            EventKind::PauseVcpu => Self::PauseVcpu,
            EventKind::SingleStep => Self::SingleStep(r.get()?),
        })
    }
}

impl Encode for EventPayload {
    fn encode(&self, w: &mut Writer) {
        match self {
            Self::Unhook | Self::Hypercall | Self::CreateVcpu | Self::PauseVcpu => {}
            Self::Cr(e) => e.encode(w),
            Self::Msr(e) => e.encode(w),
            Self::Xsetbv(e) => e.encode(w),
            Self::Breakpoint(e) => e.encode(w),
            Self::PageFault(e) => e.encode(w),
            Self::Trap(e) => e.encode(w),
            Self::Descriptor(e) => e.encode(w),
            Self::SingleStep(e) => e.encode(w),
        }
    }
}

impl Event {
    /// Event kind.
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Parses an event body that arrived under `seq`.
    pub fn parse(seq: u32, body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let size = usize::from(r.u16()?);
        let vcpu = r.u16()?;
        let kind = EventKind::try_from(u16::from(r.u8()?))?;
        r.skip(3)?;
        if size < EVENT_COMMON_SIZE {
            return Err(Error::Invalid("event common size"));
        }
        let arch = r.get()?;
        // Newer hypervisors may append fields to the common section.
        r.skip(size - EVENT_COMMON_SIZE)?;
        let payload = EventPayload::decode(kind, &mut r)?;
        Ok(Self {
            seq,
            vcpu,
            arch,
            payload,
        })
    }

    /// Starts a reply with `action` and the default payload for this kind.
    ///
    /// Register events default to accepting the value the guest wrote.
    pub fn reply(&self, action: Action) -> EventReply {
        let payload = match &self.payload {
            EventPayload::Cr(cr) => ReplyPayload::Cr {
                new_value: cr.new_value,
            },
            EventPayload::Msr(msr) => ReplyPayload::Msr {
                new_value: msr.new_value,
            },
            EventPayload::PageFault(_) => ReplyPayload::PageFault(PageFaultReply::default()),
            _ => ReplyPayload::None,
        };
        EventReply { action, payload }
    }
}

impl Encode for Event {
    fn encode(&self, w: &mut Writer) {
        #[allow(clippy::cast_possible_truncation)]
        w.u16(EVENT_COMMON_SIZE as u16)
            .u16(self.vcpu)
            .u8(self.kind() as u8)
            .pad(3)
            .put(&self.arch)
            .put(&self.payload);
    }
}

/// Control register write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CrEvent {
    pub cr: u16,
    pub old_value: u64,
    pub new_value: u64,
}

impl Encode for CrEvent {
    fn encode(&self, w: &mut Writer) {
        w.u16(self.cr).pad(6).u64(self.old_value).u64(self.new_value);
    }
}

impl Decode for CrEvent {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let cr = r.u16()?;
        r.skip(6)?;
        Ok(Self {
            cr,
            old_value: r.u64()?,
            new_value: r.u64()?,
        })
    }
}

/// Model-specific register write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MsrEvent {
    pub msr: u32,
    pub old_value: u64,
    pub new_value: u64,
}

impl Encode for MsrEvent {
    fn encode(&self, w: &mut Writer) {
        w.u32(self.msr).pad(4).u64(self.old_value).u64(self.new_value);
    }
}

impl Decode for MsrEvent {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let msr = r.u32()?;
        r.skip(4)?;
        Ok(Self {
            msr,
            old_value: r.u64()?,
            new_value: r.u64()?,
        })
    }
}

/// Extended control register write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct XsetbvEvent {
    pub xcr: u8,
    pub old_value: u64,
    pub new_value: u64,
}

impl Encode for XsetbvEvent {
    fn encode(&self, w: &mut Writer) {
        w.u8(self.xcr).pad(7).u64(self.old_value).u64(self.new_value);
    }
}

impl Decode for XsetbvEvent {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let xcr = r.u8()?;
        r.skip(7)?;
        Ok(Self {
            xcr,
            old_value: r.u64()?,
            new_value: r.u64()?,
        })
    }
}

/// Breakpoint hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct BreakpointEvent {
    pub gpa: u64,
    pub insn_len: u8,
}

impl Encode for BreakpointEvent {
    fn encode(&self, w: &mut Writer) {
        w.u64(self.gpa).u8(self.insn_len).pad(7);
    }
}

impl Decode for BreakpointEvent {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let gpa = r.u64()?;
        let insn_len = r.u8()?;
        r.skip(7)?;
        Ok(Self { gpa, insn_len })
    }
}

/// EPT violation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageFaultEvent {
    /// Faulting guest virtual address.
    pub gva: u64,
    /// Faulting guest physical address.
    pub gpa: u64,
    /// Access that triggered the fault.
    pub access: Access,
    /// EPT view the fault happened in.
    pub view: u16,
}

impl Encode for PageFaultEvent {
    fn encode(&self, w: &mut Writer) {
        w.u64(self.gva)
            .u64(self.gpa)
            .u8(self.access.bits())
            .pad(1)
            .u16(self.view)
            .pad(4);
    }
}

impl Decode for PageFaultEvent {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let gva = r.u64()?;
        let gpa = r.u64()?;
        let access = Access::from_bits(r.u8()?)?;
        r.skip(1)?;
        let view = r.u16()?;
        r.skip(4)?;
        Ok(Self {
            gva,
            gpa,
            access,
            view,
        })
    }
}

/// Exception delivered to the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TrapEvent {
    pub vector: u32,
    pub type_: u32,
    pub error_code: u32,
    pub cr2: u64,
}

impl Encode for TrapEvent {
    fn encode(&self, w: &mut Writer) {
        w.u32(self.vector)
            .u32(self.type_)
            .u32(self.error_code)
            .pad(4)
            .u64(self.cr2);
    }
}

impl Decode for TrapEvent {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let vector = r.u32()?;
        let type_ = r.u32()?;
        let error_code = r.u32()?;
        r.skip(4)?;
        Ok(Self {
            vector,
            type_,
            error_code,
            cr2: r.u64()?,
        })
    }
}

/// Descriptor table register access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorEvent {
    /// Which register (IDTR, GDTR, LDTR, TR).
    pub descriptor: u8,
    /// Non-zero for stores.
    pub write: u8,
}

impl Encode for DescriptorEvent {
    fn encode(&self, w: &mut Writer) {
        w.u8(self.descriptor).u8(self.write).pad(6);
    }
}

impl Decode for DescriptorEvent {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let descriptor = r.u8()?;
        let write = r.u8()?;
        r.skip(6)?;
        Ok(Self { descriptor, write })
    }
}

/// Single-step completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SingleStepEvent {
    /// Set when the step could not be performed.
    pub failed: bool,
}

impl Encode for SingleStepEvent {
    fn encode(&self, w: &mut Writer) {
        w.u8(u8::from(self.failed)).pad(7);
    }
}

impl Decode for SingleStepEvent {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let failed = r.u8()? != 0;
        r.skip(7)?;
        Ok(Self { failed })
    }
}

/// Reply to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReply {
    /// What the vcpu does next.
    pub action: Action,
    /// Kind-specific reply data.
    pub payload: ReplyPayload,
}

/// Kind-specific reply data.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplyPayload {
    /// Kinds without reply data.
    None,
    /// Value the control register ends up holding.
    Cr {
        /// Value to write.
        new_value: u64,
    },
    /// Value the MSR ends up holding.
    Msr {
        /// Value to write.
        new_value: u64,
    },
    /// Page-fault emulation hints.
    PageFault(PageFaultReply),
}

impl ReplyPayload {
    /// Whether this payload is the reply shape `kind` requires.
    pub const fn fits(&self, kind: EventKind) -> bool {
        matches!(
            (self, kind),
            (Self::Cr { .. }, EventKind::Cr)
                | (Self::Msr { .. }, EventKind::Msr)
                | (Self::PageFault(_), EventKind::PageFault)
        ) || matches!(self, Self::None)
            && !matches!(kind, EventKind::Cr | EventKind::Msr | EventKind::PageFault)
    }
}

/// Page-fault reply data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageFaultReply {
    /// Guest address the context bytes stand in for.
    pub ctx_addr: u64,
    /// Re-execute with single-step enabled.
    pub singlestep: bool,
    /// Complete a `rep`-prefixed instruction in one go.
    pub rep_complete: bool,
    /// Data returned to the emulator instead of guest memory.
    pub ctx_data: Vec<u8>,
}

impl PageFaultReply {
    /// Size on the wire.
    pub const SIZE: usize = 16 + PF_CTX_MAX;
}

/// Encodes a reply to an event of `kind` raised on `vcpu`.
pub fn reply_body(vcpu: u16, kind: EventKind, reply: &EventReply) -> Result<Vec<u8>> {
    if !reply.payload.fits(kind) {
        return Err(Error::Invalid("reply payload for event kind"));
    }
    let mut w = Writer::new();
    w.u16(vcpu).pad(6);
    w.u8(reply.action as u8).u8(kind as u8).pad(6);
    match &reply.payload {
        ReplyPayload::None => {}
        ReplyPayload::Cr { new_value } | ReplyPayload::Msr { new_value } => {
            w.u64(*new_value);
        }
        ReplyPayload::PageFault(pf) => {
            if pf.ctx_data.len() > PF_CTX_MAX {
                return Err(Error::Invalid("page fault context size"));
            }
            #[allow(clippy::cast_possible_truncation)]
            w.u64(pf.ctx_addr)
                .u32(pf.ctx_data.len() as u32)
                .u8(u8::from(pf.singlestep))
                .u8(u8::from(pf.rep_complete))
                .pad(2)
                .bytes(&pf.ctx_data)
                .pad(PF_CTX_MAX - pf.ctx_data.len());
        }
    }
    Ok(w.into_inner())
}

/// Parses a reply body; the inverse of [`reply_body`].
pub fn parse_reply_body(body: &[u8]) -> Result<(u16, EventKind, EventReply)> {
    let mut r = Reader::new(body);
    let vcpu = r.u16()?;
    r.skip(6)?;
    let action = Action::try_from(r.u8()?)?;
    let kind = EventKind::try_from(u16::from(r.u8()?))?;
    r.skip(6)?;
    let payload = match kind {
        EventKind::Cr => ReplyPayload::Cr {
            new_value: r.u64()?,
        },
        EventKind::Msr => ReplyPayload::Msr {
            new_value: r.u64()?,
        },
        EventKind::PageFault => {
            let ctx_addr = r.u64()?;
            let ctx_size = r.u32()? as usize;
            let singlestep = r.u8()? != 0;
            let rep_complete = r.u8()? != 0;
            r.skip(2)?;
            let data = r.bytes(PF_CTX_MAX)?;
            let ctx_data = data
                .get(..ctx_size)
                .ok_or(Error::Invalid("page fault context size"))?
                .to_vec();
            ReplyPayload::PageFault(PageFaultReply {
                ctx_addr,
                singlestep,
                rep_complete,
                ctx_data,
            })
        }
        _ => ReplyPayload::None,
    };
    Ok((vcpu, kind, EventReply { action, payload }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cr_event() -> Event {
        Event {
            seq: 77,
            vcpu: 0,
            arch: EventArch::default(),
            payload: EventPayload::Cr(CrEvent {
                cr: 3,
                old_value: 0x0,
                new_value: 0x8,
            }),
        }
    }

    #[test]
    fn cr_event_roundtrip() {
        let ev = cr_event();
        let body = ev.to_body();
        assert_eq!(body.len(), EVENT_COMMON_SIZE + 24);
        assert_eq!(Event::parse(77, &body).unwrap(), ev);
    }

    #[test]
    fn parse_skips_extended_common_section() {
        let ev = cr_event();
        let mut body = ev.to_body();
        // Grow the common section by 8 bytes as a newer peer would.
        #[allow(clippy::cast_possible_truncation)]
        let grown = (EVENT_COMMON_SIZE + 8) as u16;
        body[0..2].copy_from_slice(&grown.to_le_bytes());
        body.splice(EVENT_COMMON_SIZE..EVENT_COMMON_SIZE, [0xee; 8]);
        assert_eq!(Event::parse(77, &body).unwrap(), ev);
    }

    #[test]
    fn parse_rejects_unknown_kind_and_short_body() {
        let mut body = cr_event().to_body();
        body[4] = 42;
        assert!(matches!(
            Event::parse(1, &body),
            Err(Error::UnknownEvent(42))
        ));

        let body = cr_event().to_body();
        assert!(matches!(
            Event::parse(1, &body[..body.len() - 4]),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn default_reply_follows_kind() {
        let ev = cr_event();
        let reply = ev.reply(Action::Continue);
        assert_eq!(reply.payload, ReplyPayload::Cr { new_value: 0x8 });

        let pause = Event {
            payload: EventPayload::PauseVcpu,
            ..cr_event()
        };
        assert_eq!(pause.reply(Action::Continue).payload, ReplyPayload::None);
    }

    #[test]
    fn reply_shape_must_match_kind() {
        let none = ReplyPayload::None;
        assert!(none.fits(EventKind::PauseVcpu));
        assert!(!none.fits(EventKind::Cr));
        assert!(ReplyPayload::Msr { new_value: 1 }.fits(EventKind::Msr));
        assert!(!ReplyPayload::Msr { new_value: 1 }.fits(EventKind::Cr));

        let reply = EventReply {
            action: Action::Continue,
            payload: ReplyPayload::Msr { new_value: 1 },
        };
        assert!(reply_body(0, EventKind::Cr, &reply).is_err());
    }

    #[test]
    fn page_fault_reply_is_fixed_size() {
        let reply = EventReply {
            action: Action::Retry,
            payload: ReplyPayload::PageFault(PageFaultReply {
                ctx_addr: 0x1000,
                singlestep: true,
                rep_complete: false,
                ctx_data: vec![1, 2, 3],
            }),
        };
        let body = reply_body(1, EventKind::PageFault, &reply).unwrap();
        assert_eq!(body.len(), 16 + PageFaultReply::SIZE);

        let (vcpu, kind, back) = parse_reply_body(&body).unwrap();
        assert_eq!((vcpu, kind), (1, EventKind::PageFault));
        assert_eq!(back, reply);
    }

    #[test]
    fn oversized_context_is_rejected() {
        let reply = EventReply {
            action: Action::Continue,
            payload: ReplyPayload::PageFault(PageFaultReply {
                ctx_data: vec![0; PF_CTX_MAX + 1],
                ..PageFaultReply::default()
            }),
        };
        assert!(matches!(
            reply_body(0, EventKind::PageFault, &reply),
            Err(Error::Invalid(_))
        ));
    }
}
