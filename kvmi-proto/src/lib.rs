//! Wire protocol for KVM introspection (KVMI).
//!
//! Every message is an 8-byte little-endian header followed by a body
//! whose layout is fixed per message id. Bodies are encoded and parsed
//! field by field through [`Writer`] and [`Reader`]; nothing here depends
//! on host struct layout.

mod arch;
mod codec;
mod command;
mod error;
mod event;
mod handshake;
mod message;
mod page;

pub use arch::{DTable, EventArch, EventMsrs, MsrEntry, Regs, SRegs, Segment};
pub use codec::{
    Decode, Encode, Frame, HEADER_SIZE, Header, MAX_BODY_SIZE, MAX_FRAME_SIZE, Reader, Writer,
    decode, encode, recv, send,
};
pub use command::{
    CheckCommand, CheckEvent, Command, ControlCmdResponse, ControlCr, ControlEptView,
    ControlEvents, ControlMsr, ControlSingleStep, ControlSpp, ControlVmEvents, Features,
    GetEptView, GetGuestInfo, GetMapToken, GetMaxGfn, GetMtrrType, GetRegisters, GetVcpuInfo,
    GetVersion, GetXcr, GuestInfo, InjectException, MemToken, PauseVcpu, ReadPhysical, Registers,
    SetRegisters, SwitchEptView, TranslateGva, Version, WritePhysical, split_reply,
};
pub use error::{Error, Result};
pub use event::{
    BreakpointEvent, CrEvent, DescriptorEvent, EVENT_COMMON_SIZE, Event, EventPayload,
    EventReply, MsrEvent, PF_CTX_MAX, PageFaultEvent, PageFaultReply, ReplyPayload,
    SingleStepEvent, TrapEvent, XsetbvEvent, parse_reply_body, reply_body,
};
pub use handshake::{COOKIE_HASH_LEN, Handshake, HandshakeReply, NAME_LEN};
pub use message::{
    Action, DEFAULT_VSOCK_PORT, ErrorCode, EventKind, KVMI_VERSION, MessageId, RemoteErrno,
};
pub use page::{
    Access, BATCH_HEADER_SIZE, Batch, BatchBody, GetPageAccess, GetPageWriteBitmap,
    PageAccessEntry, SetPageAccess, SetPageWriteBitmap, WriteBitmapEntry, batch_capacity,
};
