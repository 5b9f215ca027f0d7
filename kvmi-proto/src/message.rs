//! Message and event identifiers, reply actions and the remote error table.

use crate::codec::{Decode, Reader};
use crate::error::{Error, Result};

/// Protocol version this crate speaks.
pub const KVMI_VERSION: u32 = 1;

/// Default vsock port the hypervisor connects to.
pub const DEFAULT_VSOCK_PORT: u32 = 1234;

/// Message identifiers carried in [`Header::id`](crate::Header::id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u16)]
#[allow(missing_docs)]
pub enum MessageId {
    /// Introspector's reply to an event.
    EventReply = 0,
    /// Unsolicited event from the hypervisor.
    Event = 1,
    GetVersion = 2,
    CheckCommand = 3,
    CheckEvent = 4,
    GetGuestInfo = 5,
    GetVcpuInfo = 6,
    PauseVcpu = 7,
    ControlVmEvents = 8,
    ControlEvents = 9,
    ControlCr = 10,
    ControlMsr = 11,
    ControlVe = 12,
    GetRegisters = 13,
    SetRegisters = 14,
    GetCpuid = 15,
    GetXsave = 16,
    ReadPhysical = 17,
    WritePhysical = 18,
    InjectException = 19,
    GetPageAccess = 20,
    SetPageAccess = 21,
    GetMapToken = 22,
    GetMtrrType = 23,
    ControlSpp = 24,
    GetPageWriteBitmap = 25,
    SetPageWriteBitmap = 26,
    ControlCmdResponse = 27,
    SetVeInfoPage = 28,
    GetMaxGfn = 29,
    SetEptPageConv = 30,
    GetEptPageConv = 31,
    SwitchEptView = 32,
    DisableVe = 33,
    GetEptView = 34,
    VcpuTranslateGva = 35,
    ControlEptView = 36,
    VcpuGetXcr = 37,
    VcpuSetXsave = 38,
    VcpuControlSingleStep = 63,
}

impl TryFrom<u16> for MessageId {
    type Error = Error;

    fn try_from(v: u16) -> Result<Self> {
        Ok(match v {
            0 => Self::EventReply,
            1 => Self::Event,
            2 => Self::GetVersion,
            3 => Self::CheckCommand,
            4 => Self::CheckEvent,
            5 => Self::GetGuestInfo,
            6 => Self::GetVcpuInfo,
            7 => Self::PauseVcpu,
            8 => Self::ControlVmEvents,
            9 => Self::ControlEvents,
            10 => Self::ControlCr,
            11 => Self::ControlMsr,
            12 => Self::ControlVe,
            13 => Self::GetRegisters,
            14 => Self::SetRegisters,
            15 => Self::GetCpuid,
            16 => Self::GetXsave,
            17 => Self::ReadPhysical,
            18 => Self::WritePhysical,
            19 => Self::InjectException,
            20 => Self::GetPageAccess,
            21 => Self::SetPageAccess,
            22 => Self::GetMapToken,
            23 => Self::GetMtrrType,
            24 => Self::ControlSpp,
            25 => Self::GetPageWriteBitmap,
            26 => Self::SetPageWriteBitmap,
            27 => Self::ControlCmdResponse,
            28 => Self::SetVeInfoPage,
            29 => Self::GetMaxGfn,
            30 => Self::SetEptPageConv,
            31 => Self::GetEptPageConv,
            32 => Self::SwitchEptView,
            33 => Self::DisableVe,
            34 => Self::GetEptView,
            35 => Self::VcpuTranslateGva,
            36 => Self::ControlEptView,
            37 => Self::VcpuGetXcr,
            38 => Self::VcpuSetXsave,
            63 => Self::VcpuControlSingleStep,
            other => return Err(Error::UnknownMessage(other)),
        })
    }
}

/// Event identifiers carried inside an [`MessageId::Event`] body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
#[repr(u16)]
pub enum EventKind {
    /// The hypervisor is detaching the introspector.
    Unhook = 0,
    /// Control register write.
    Cr = 1,
    /// Model-specific register write.
    Msr = 2,
    /// Extended control register write.
    Xsetbv = 3,
    /// Guest breakpoint (`int3`).
    Breakpoint = 4,
    /// Guest hypercall.
    Hypercall = 5,
    /// EPT violation on a tracked page.
    PageFault = 6,
    /// Exception injection completed.
    Trap = 7,
    /// Descriptor table register access.
    Descriptor = 8,
    /// A vcpu was created.
    CreateVcpu = 9,
    /// A vcpu stopped in response to a pause command.
    PauseVcpu = 10,
    /// Single-step completed.
    SingleStep = 11,
}

impl EventKind {
    /// Every event kind, in id order.
    pub const ALL: [Self; 12] = [
        Self::Unhook,
        Self::Cr,
        Self::Msr,
        Self::Xsetbv,
        Self::Breakpoint,
        Self::Hypercall,
        Self::PageFault,
        Self::Trap,
        Self::Descriptor,
        Self::CreateVcpu,
        Self::PauseVcpu,
        Self::SingleStep,
    ];

    /// Bit for this kind in a per-vcpu enablement mask.
    pub const fn bit(self) -> u32 {
        1 << self as u16
    }
}

impl TryFrom<u16> for EventKind {
    type Error = Error;

    fn try_from(v: u16) -> Result<Self> {
        Self::ALL
            .get(usize::from(v))
            .copied()
            .ok_or(Error::UnknownEvent(v))
    }
}

/// What the hypervisor should do after an event reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
#[repr(u8)]
pub enum Action {
    /// Resume the vcpu.
    #[default]
    Continue = 0,
    /// Re-execute the faulting instruction.
    Retry = 1,
    /// Crash the guest.
    Crash = 2,
}

impl TryFrom<u8> for Action {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Continue),
            1 => Ok(Self::Retry),
            2 => Ok(Self::Crash),
            _ => Err(Error::Invalid("event action")),
        }
    }
}

/// Kernel error codes returned in place of a reply, mapped to names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RemoteErrno {
    /// `EPERM`: the command is disallowed for this guest.
    PermissionDenied,
    /// `ENOENT`: no such vcpu, page or register.
    NotFound,
    /// `E2BIG`: the request exceeds a kernel limit.
    TooBig,
    /// `EAGAIN`: transient, retry later.
    TryAgain,
    /// `ENOMEM`.
    OutOfMemory,
    /// `EFAULT`: a guest address could not be accessed.
    BadAddress,
    /// `EBUSY`: the resource is in use.
    Busy,
    /// `EINVAL`.
    InvalidArgument,
    /// `EOPNOTSUPP`: the hypervisor lacks the feature.
    NotSupported,
    /// `KVM_ENOSYS`: unknown command.
    NotImplemented,
    /// Any other code, kept verbatim (positive errno).
    Other(i32),
}

impl RemoteErrno {
    /// Maps a positive errno value through the kernel compatibility table.
    pub const fn from_errno(code: i32) -> Self {
        match code {
            1 => Self::PermissionDenied,
            2 => Self::NotFound,
            7 => Self::TooBig,
            11 => Self::TryAgain,
            12 => Self::OutOfMemory,
            14 => Self::BadAddress,
            16 => Self::Busy,
            22 => Self::InvalidArgument,
            95 => Self::NotSupported,
            1000 => Self::NotImplemented,
            other => Self::Other(other),
        }
    }

    /// Positive errno value this variant stands for.
    pub const fn errno(self) -> i32 {
        match self {
            Self::PermissionDenied => 1,
            Self::NotFound => 2,
            Self::TooBig => 7,
            Self::TryAgain => 11,
            Self::OutOfMemory => 12,
            Self::BadAddress => 14,
            Self::Busy => 16,
            Self::InvalidArgument => 22,
            Self::NotSupported => 95,
            Self::NotImplemented => 1000,
            Self::Other(code) => code,
        }
    }
}

impl std::fmt::Display for RemoteErrno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied => f.write_str("operation not permitted"),
            Self::NotFound => f.write_str("not found"),
            Self::TooBig => f.write_str("argument list too long"),
            Self::TryAgain => f.write_str("try again"),
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::BadAddress => f.write_str("bad address"),
            Self::Busy => f.write_str("resource busy"),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::NotSupported => f.write_str("not supported"),
            Self::NotImplemented => f.write_str("command not implemented"),
            Self::Other(code) => write!(f, "errno {code}"),
        }
    }
}

/// Leading `{err: i32, padding: u32}` of every command reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    /// Size on the wire.
    pub const SIZE: usize = 8;

    /// `Ok(())` for zero, the mapped remote error otherwise.
    ///
    /// The kernel sends negative errno values; positive ones are accepted
    /// as-is.
    pub const fn check(self) -> std::result::Result<(), RemoteErrno> {
        match self.0 {
            0 => Ok(()),
            code => Err(RemoteErrno::from_errno(code.saturating_abs())),
        }
    }
}

impl Decode for ErrorCode {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let err = r.i32()?;
        r.skip(4)?;
        Ok(Self(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_roundtrip() {
        for raw in (0..=38).chain([63]) {
            let id = MessageId::try_from(raw).unwrap();
            assert_eq!(id as u16, raw);
        }
        assert!(matches!(
            MessageId::try_from(39),
            Err(Error::UnknownMessage(39))
        ));
    }

    #[test]
    fn event_kinds_roundtrip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::try_from(kind as u16).unwrap(), kind);
        }
        assert!(matches!(
            EventKind::try_from(12),
            Err(Error::UnknownEvent(12))
        ));
        assert_eq!(EventKind::Cr.bit(), 0b10);
    }

    #[test]
    fn error_code_maps_through_table() {
        assert_eq!(ErrorCode(0).check(), Ok(()));
        assert_eq!(ErrorCode(-16).check(), Err(RemoteErrno::Busy));
        assert_eq!(ErrorCode(-2).check(), Err(RemoteErrno::NotFound));
        assert_eq!(ErrorCode(-12).check(), Err(RemoteErrno::OutOfMemory));
        assert_eq!(ErrorCode(-22).check(), Err(RemoteErrno::InvalidArgument));
        assert_eq!(ErrorCode(-95).check(), Err(RemoteErrno::NotSupported));
        assert_eq!(ErrorCode(-11).check(), Err(RemoteErrno::TryAgain));
        assert_eq!(ErrorCode(-77).check(), Err(RemoteErrno::Other(77)));
        assert_eq!(RemoteErrno::Busy.errno(), 16);
    }
}
