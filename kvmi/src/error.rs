//! Error types for introspection sessions.

use std::io;

use kvmi_proto::{EventKind, RemoteErrno};

/// Alias for `Result<T, kvmi::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by session and domain operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The socket failed or reached end-of-stream. Fatal to the connection.
    #[error("transport: {0}")]
    Transport(#[source] io::Error),

    /// The peer violated the wire protocol. Fatal to the connection.
    #[error("protocol: {0}")]
    Protocol(#[source] kvmi_proto::Error),

    /// The hypervisor answered with an error code. The connection stays usable.
    #[error("remote error: {0}")]
    Remote(RemoteErrno),

    /// No reply arrived within the configured wait.
    #[error("timed out waiting for reply")]
    Timeout,

    /// The connection closed before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// No event is queued.
    #[error("event queue is empty")]
    Empty,

    /// The caller misused the API; nothing was sent.
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// The handshake handler refused the guest.
    #[error("handshake rejected")]
    HandshakeRejected,

    /// A configuration file could not be parsed.
    #[error("config: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error tears down the connection it happened on.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<kvmi_proto::Error> for Error {
    fn from(e: kvmi_proto::Error) -> Self {
        match e {
            kvmi_proto::Error::Io(io) => Self::Transport(io),
            other => Self::Protocol(other),
        }
    }
}

/// API misuse detected before anything reached the wire.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum UsageError {
    /// `seq` is not an event that was popped and still awaits its reply.
    #[error("event seq {0} is not awaiting a reply")]
    NotPending(u32),

    /// The reply payload does not have the shape the event kind requires.
    #[error("reply does not match {kind:?} event seq {seq}")]
    ReplyMismatch {
        /// Event sequence number.
        seq: u32,
        /// Kind of the event being answered.
        kind: EventKind,
    },

    /// A single batch element does not fit in one frame.
    #[error("{size} byte element cannot fit in one frame")]
    EntryTooLarge {
        /// Encoded size of the element.
        size: usize,
    },

    /// A command was issued while another was still in flight.
    #[error("another command is already outstanding")]
    CommandOverlap,

    /// Page-fault reply context exceeds the protocol limit.
    #[error("page fault context of {0} bytes exceeds limit")]
    ContextTooLarge(usize),
}
