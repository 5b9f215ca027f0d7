//! Wire-level error type.

use std::io;

use crate::codec::{HEADER_SIZE, MAX_FRAME_SIZE};

/// Alias for `Result<T, kvmi_proto::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while framing or parsing KVMI messages.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Encoding would produce a frame larger than [`MAX_FRAME_SIZE`].
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    /// The header `size` field is outside `[HEADER_SIZE, MAX_FRAME_SIZE]`.
    #[error("header size {0} outside [{HEADER_SIZE}, {MAX_FRAME_SIZE}]")]
    BadSize(u16),

    /// Fewer bytes are available than the structure requires.
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// The header carries an id outside the message enumeration.
    #[error("unknown message id {0}")]
    UnknownMessage(u16),

    /// An event body carries an id outside the event enumeration.
    #[error("unknown event id {0}")]
    UnknownEvent(u16),

    /// A field holds a value the protocol does not allow.
    #[error("invalid {0}")]
    Invalid(&'static str),

    /// The underlying stream failed or ended early.
    #[error(transparent)]
    Io(#[from] io::Error),
}
