//! Command bodies and their reply shapes.
//!
//! Every reply body begins with an [`ErrorCode`]; the reply data follows
//! only when the code is zero.

use crate::arch::{MsrEntry, Regs, SRegs};
use crate::codec::{Decode, Encode, MAX_BODY_SIZE, Reader, Writer};
use crate::error::{Error, Result};
use crate::message::{ErrorCode, EventKind, MessageId};

/// A request the introspector sends and the hypervisor answers.
pub trait Command: Encode {
    /// Header id for this command and its reply.
    const ID: MessageId;

    /// Parsed reply data.
    type Reply;

    /// Parses the reply data following the error code.
    fn decode_reply(&self, r: &mut Reader<'_>) -> Result<Self::Reply>;
}

/// Implements [`Command`] for a body whose reply is a plain [`Decode`] type.
macro_rules! command {
    ($ty:ty => $id:ident, $reply:ty) => {
        impl Command for $ty {
            const ID: MessageId = MessageId::$id;
            type Reply = $reply;

            fn decode_reply(&self, r: &mut Reader<'_>) -> Result<Self::Reply> {
                r.get()
            }
        }
    };
}

/// Encodes the per-vcpu header that prefixes vcpu-scoped commands.
fn vcpu_hdr(w: &mut Writer, vcpu: u16) {
    w.u16(vcpu).pad(6);
}

/// Feature flags reported by [`GetVersion`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    /// Sub-page write protection.
    pub spp: bool,
    /// VMFUNC view switching.
    pub vmfunc: bool,
    /// EPTP switching.
    pub eptp: bool,
    /// Virtualization exceptions.
    pub ve: bool,
}

impl Decode for Features {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let [spp, vmfunc, eptp, ve, ..] = r.array::<8>()?;
        Ok(Self {
            spp: spp != 0,
            vmfunc: vmfunc != 0,
            eptp: eptp != 0,
            ve: ve != 0,
        })
    }
}

impl Encode for Features {
    fn encode(&self, w: &mut Writer) {
        for flag in [self.spp, self.vmfunc, self.eptp, self.ve] {
            w.u8(u8::from(flag));
        }
        w.pad(4);
    }
}

/// Protocol version query.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetVersion;

/// Reply to [`GetVersion`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version {
    /// Protocol version.
    pub version: u32,
    /// Optional features.
    pub features: Features,
}

impl Encode for GetVersion {
    fn encode(&self, _w: &mut Writer) {}
}

impl Decode for Version {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.u32()?;
        r.skip(4)?;
        Ok(Self {
            version,
            features: r.get()?,
        })
    }
}

impl Encode for Version {
    fn encode(&self, w: &mut Writer) {
        w.u32(self.version).pad(4).put(&self.features);
    }
}

command!(GetVersion => GetVersion, Version);

/// Asks whether a command is supported.
#[derive(Debug, Clone, Copy)]
pub struct CheckCommand {
    /// Command to probe.
    pub id: MessageId,
}

impl Encode for CheckCommand {
    fn encode(&self, w: &mut Writer) {
        w.u16(self.id as u16).pad(6);
    }
}

command!(CheckCommand => CheckCommand, ());

/// Asks whether an event is supported.
#[derive(Debug, Clone, Copy)]
pub struct CheckEvent {
    /// Event to probe.
    pub kind: EventKind,
}

impl Encode for CheckEvent {
    fn encode(&self, w: &mut Writer) {
        w.u16(self.kind as u16).pad(6);
    }
}

command!(CheckEvent => CheckEvent, ());

/// Guest-wide information query.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetGuestInfo;

/// Reply to [`GetGuestInfo`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestInfo {
    /// Number of vcpus.
    pub vcpu_count: u32,
}

impl Encode for GetGuestInfo {
    fn encode(&self, _w: &mut Writer) {}
}

impl Decode for GuestInfo {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let vcpu_count = r.u32()?;
        r.skip(12)?;
        Ok(Self { vcpu_count })
    }
}

impl Encode for GuestInfo {
    fn encode(&self, w: &mut Writer) {
        w.u32(self.vcpu_count).pad(12);
    }
}

command!(GetGuestInfo => GetGuestInfo, GuestInfo);

/// Per-vcpu information query; the reply is the TSC frequency in Hz.
#[derive(Debug, Clone, Copy)]
pub struct GetVcpuInfo {
    /// Target vcpu.
    pub vcpu: u16,
}

impl Encode for GetVcpuInfo {
    fn encode(&self, w: &mut Writer) {
        vcpu_hdr(w, self.vcpu);
    }
}

command!(GetVcpuInfo => GetVcpuInfo, u64);

/// Requests a pause event from one vcpu.
#[derive(Debug, Clone, Copy)]
pub struct PauseVcpu {
    /// Target vcpu.
    pub vcpu: u16,
    /// Wait until the vcpu has actually stopped before replying.
    pub wait: bool,
}

impl Encode for PauseVcpu {
    fn encode(&self, w: &mut Writer) {
        vcpu_hdr(w, self.vcpu);
        w.u8(u8::from(self.wait)).pad(7);
    }
}

command!(PauseVcpu => PauseVcpu, ());

/// Enables or disables a VM-scoped event.
#[derive(Debug, Clone, Copy)]
pub struct ControlVmEvents {
    /// Event to toggle.
    pub kind: EventKind,
    /// New state.
    pub enable: bool,
}

impl Encode for ControlVmEvents {
    fn encode(&self, w: &mut Writer) {
        w.u16(self.kind as u16).u8(u8::from(self.enable)).pad(5);
    }
}

command!(ControlVmEvents => ControlVmEvents, ());

/// Enables or disables an event on one vcpu.
#[derive(Debug, Clone, Copy)]
pub struct ControlEvents {
    /// Target vcpu.
    pub vcpu: u16,
    /// Event to toggle.
    pub kind: EventKind,
    /// New state.
    pub enable: bool,
}

impl Encode for ControlEvents {
    fn encode(&self, w: &mut Writer) {
        vcpu_hdr(w, self.vcpu);
        w.u16(self.kind as u16).u8(u8::from(self.enable)).pad(5);
    }
}

command!(ControlEvents => ControlEvents, ());

/// Enables or disables write events for one control register.
#[derive(Debug, Clone, Copy)]
pub struct ControlCr {
    /// Target vcpu.
    pub vcpu: u16,
    /// Control register number.
    pub cr: u32,
    /// New state.
    pub enable: bool,
}

impl Encode for ControlCr {
    fn encode(&self, w: &mut Writer) {
        vcpu_hdr(w, self.vcpu);
        w.u8(u8::from(self.enable)).pad(3).u32(self.cr);
    }
}

command!(ControlCr => ControlCr, ());

/// Enables or disables write events for one MSR.
#[derive(Debug, Clone, Copy)]
pub struct ControlMsr {
    /// Target vcpu.
    pub vcpu: u16,
    /// MSR index.
    pub msr: u32,
    /// New state.
    pub enable: bool,
}

impl Encode for ControlMsr {
    fn encode(&self, w: &mut Writer) {
        vcpu_hdr(w, self.vcpu);
        w.u8(u8::from(self.enable)).pad(3).u32(self.msr);
    }
}

command!(ControlMsr => ControlMsr, ());

/// Reads vcpu registers plus the requested MSRs.
#[derive(Debug, Clone)]
pub struct GetRegisters {
    /// Target vcpu.
    pub vcpu: u16,
    /// MSR indices to sample.
    pub msrs: Vec<u32>,
}

/// Reply to [`GetRegisters`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registers {
    /// CPU mode in bytes: 2, 4 or 8.
    pub mode: u32,
    /// General purpose registers.
    pub regs: Regs,
    /// Special registers.
    pub sregs: SRegs,
    /// Sampled MSRs, in request order.
    pub msrs: Vec<MsrEntry>,
}

impl GetRegisters {
    /// Most MSRs one request can ask for while the reply still fits a frame.
    pub const MAX_MSRS: usize =
        (MAX_BODY_SIZE - 8 - 8 - Regs::SIZE - SRegs::SIZE - 8) / MsrEntry::SIZE;
}

impl Encode for GetRegisters {
    fn encode(&self, w: &mut Writer) {
        vcpu_hdr(w, self.vcpu);
        #[allow(clippy::cast_possible_truncation)]
        w.u16(self.msrs.len() as u16).pad(6);
        for msr in &self.msrs {
            w.u32(*msr);
        }
    }
}

impl Decode for Registers {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let mode = r.u32()?;
        r.skip(4)?;
        let regs = r.get()?;
        let sregs = r.get()?;
        let nmsrs = r.u32()? as usize;
        r.skip(4)?;
        if nmsrs > GetRegisters::MAX_MSRS {
            return Err(Error::Invalid("msr count"));
        }
        let msrs = (0..nmsrs).map(|_| r.get()).collect::<Result<_>>()?;
        Ok(Self {
            mode,
            regs,
            sregs,
            msrs,
        })
    }
}

impl Encode for Registers {
    fn encode(&self, w: &mut Writer) {
        w.u32(self.mode).pad(4).put(&self.regs).put(&self.sregs);
        #[allow(clippy::cast_possible_truncation)]
        w.u32(self.msrs.len() as u32).pad(4);
        for msr in &self.msrs {
            w.put(msr);
        }
    }
}

command!(GetRegisters => GetRegisters, Registers);

/// Overwrites the general purpose registers of a paused vcpu.
#[derive(Debug, Clone, Copy)]
pub struct SetRegisters {
    /// Target vcpu.
    pub vcpu: u16,
    /// New register values.
    pub regs: Regs,
}

impl Encode for SetRegisters {
    fn encode(&self, w: &mut Writer) {
        vcpu_hdr(w, self.vcpu);
        w.put(&self.regs);
    }
}

command!(SetRegisters => SetRegisters, ());

/// Injects an exception into a vcpu.
#[derive(Debug, Clone, Copy)]
pub struct InjectException {
    /// Target vcpu.
    pub vcpu: u16,
    /// Exception vector.
    pub nr: u8,
    /// Error code pushed with the exception.
    pub error_code: u32,
    /// Faulting address (CR2 for #PF).
    pub address: u64,
}

impl Encode for InjectException {
    fn encode(&self, w: &mut Writer) {
        vcpu_hdr(w, self.vcpu);
        w.u8(self.nr).pad(3).u32(self.error_code).u64(self.address);
    }
}

command!(InjectException => InjectException, ());

/// Reads guest physical memory.
#[derive(Debug, Clone, Copy)]
pub struct ReadPhysical {
    /// Start address.
    pub gpa: u64,
    /// Byte count; at most [`ReadPhysical::MAX_SIZE`].
    pub size: u64,
}

impl ReadPhysical {
    /// Largest read whose reply fits a frame.
    pub const MAX_SIZE: usize = MAX_BODY_SIZE - 8;
}

impl Encode for ReadPhysical {
    fn encode(&self, w: &mut Writer) {
        w.u64(self.gpa).u64(self.size);
    }
}

impl Command for ReadPhysical {
    const ID: MessageId = MessageId::ReadPhysical;
    type Reply = Vec<u8>;

    fn decode_reply(&self, r: &mut Reader<'_>) -> Result<Self::Reply> {
        let len = usize::try_from(self.size).map_err(|_| Error::Invalid("read size"))?;
        r.bytes(len).map(<[u8]>::to_vec)
    }
}

/// Writes guest physical memory.
#[derive(Debug, Clone)]
pub struct WritePhysical {
    /// Start address.
    pub gpa: u64,
    /// Bytes to write; at most [`WritePhysical::MAX_SIZE`].
    pub data: Vec<u8>,
}

impl WritePhysical {
    /// Largest write that fits a frame.
    pub const MAX_SIZE: usize = MAX_BODY_SIZE - 16;
}

impl Encode for WritePhysical {
    fn encode(&self, w: &mut Writer) {
        w.u64(self.gpa).u64(self.data.len() as u64).bytes(&self.data);
    }
}

command!(WritePhysical => WritePhysical, ());

/// Token for the physical memory mapping device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemToken(pub [u64; 4]);

impl Decode for MemToken {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self([r.u64()?, r.u64()?, r.u64()?, r.u64()?]))
    }
}

impl Encode for MemToken {
    fn encode(&self, w: &mut Writer) {
        for v in self.0 {
            w.u64(v);
        }
    }
}

/// Requests a [`MemToken`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetMapToken;

impl Encode for GetMapToken {
    fn encode(&self, _w: &mut Writer) {}
}

command!(GetMapToken => GetMapToken, MemToken);

/// Memory type of a guest physical page.
#[derive(Debug, Clone, Copy)]
pub struct GetMtrrType {
    /// Page address.
    pub gpa: u64,
}

impl Encode for GetMtrrType {
    fn encode(&self, w: &mut Writer) {
        w.u64(self.gpa);
    }
}

impl Command for GetMtrrType {
    const ID: MessageId = MessageId::GetMtrrType;
    type Reply = u8;

    fn decode_reply(&self, r: &mut Reader<'_>) -> Result<Self::Reply> {
        let ty = r.u8()?;
        r.skip(7)?;
        Ok(ty)
    }
}

/// Turns sub-page write protection on or off.
#[derive(Debug, Clone, Copy)]
pub struct ControlSpp {
    /// New state.
    pub enable: bool,
}

impl Encode for ControlSpp {
    fn encode(&self, w: &mut Writer) {
        w.u8(u8::from(self.enable)).pad(7);
    }
}

command!(ControlSpp => ControlSpp, ());

/// Switches command replies on or off.
#[derive(Debug, Clone, Copy)]
pub struct ControlCmdResponse {
    /// Whether subsequent commands are answered.
    pub enable: bool,
    /// Apply before replying to this very command.
    pub now: bool,
}

impl Encode for ControlCmdResponse {
    fn encode(&self, w: &mut Writer) {
        w.u8(u8::from(self.enable)).u8(u8::from(self.now)).pad(6);
    }
}

command!(ControlCmdResponse => ControlCmdResponse, ());

/// Highest guest frame number.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetMaxGfn;

impl Encode for GetMaxGfn {
    fn encode(&self, _w: &mut Writer) {}
}

command!(GetMaxGfn => GetMaxGfn, u64);

/// Translates a guest virtual address through the vcpu's page tables.
#[derive(Debug, Clone, Copy)]
pub struct TranslateGva {
    /// Target vcpu.
    pub vcpu: u16,
    /// Address to translate.
    pub gva: u64,
}

impl Encode for TranslateGva {
    fn encode(&self, w: &mut Writer) {
        vcpu_hdr(w, self.vcpu);
        w.u64(self.gva);
    }
}

command!(TranslateGva => VcpuTranslateGva, u64);

/// Enables or disables single-stepping.
#[derive(Debug, Clone, Copy)]
pub struct ControlSingleStep {
    /// Target vcpu.
    pub vcpu: u16,
    /// New state.
    pub enable: bool,
}

impl Encode for ControlSingleStep {
    fn encode(&self, w: &mut Writer) {
        vcpu_hdr(w, self.vcpu);
        w.u8(u8::from(self.enable)).pad(7);
    }
}

command!(ControlSingleStep => VcpuControlSingleStep, ());

/// Reads an extended control register.
#[derive(Debug, Clone, Copy)]
pub struct GetXcr {
    /// Target vcpu.
    pub vcpu: u16,
    /// XCR number.
    pub xcr: u8,
}

impl Encode for GetXcr {
    fn encode(&self, w: &mut Writer) {
        vcpu_hdr(w, self.vcpu);
        w.u8(self.xcr).pad(7);
    }
}

command!(GetXcr => VcpuGetXcr, u64);

/// Makes `view` the active EPT view of a vcpu.
#[derive(Debug, Clone, Copy)]
pub struct SwitchEptView {
    /// Target vcpu.
    pub vcpu: u16,
    /// View to activate.
    pub view: u16,
}

impl Encode for SwitchEptView {
    fn encode(&self, w: &mut Writer) {
        vcpu_hdr(w, self.vcpu);
        w.u16(self.view).pad(6);
    }
}

command!(SwitchEptView => SwitchEptView, ());

/// Active EPT view of a vcpu.
#[derive(Debug, Clone, Copy)]
pub struct GetEptView {
    /// Target vcpu.
    pub vcpu: u16,
}

impl Encode for GetEptView {
    fn encode(&self, w: &mut Writer) {
        vcpu_hdr(w, self.vcpu);
    }
}

impl Command for GetEptView {
    const ID: MessageId = MessageId::GetEptView;
    type Reply = u16;

    fn decode_reply(&self, r: &mut Reader<'_>) -> Result<Self::Reply> {
        let view = r.u16()?;
        r.skip(6)?;
        Ok(view)
    }
}

/// Sets whether an EPT view is reachable through VMFUNC.
#[derive(Debug, Clone, Copy)]
pub struct ControlEptView {
    /// Target vcpu.
    pub vcpu: u16,
    /// View to change.
    pub view: u16,
    /// New visibility.
    pub visible: bool,
}

impl Encode for ControlEptView {
    fn encode(&self, w: &mut Writer) {
        vcpu_hdr(w, self.vcpu);
        w.u16(self.view).u8(u8::from(self.visible)).pad(5);
    }
}

command!(ControlEptView => ControlEptView, ());

/// Splits a reply body into its error code and the data that follows.
pub fn split_reply(body: &[u8]) -> Result<(ErrorCode, Reader<'_>)> {
    let mut r = Reader::new(body);
    let code = r.get()?;
    Ok((code, r))
}
