//! Connection handshake blobs.
//!
//! These are not framed: each side sends a structure whose first `u32` is
//! its own size, so a newer peer may append fields.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{Encode, Reader, Writer};
use crate::error::{Error, Result};

/// Length of the guest name field.
pub const NAME_LEN: usize = 64;

/// Length of the cookie hash the introspector returns.
pub const COOKIE_HASH_LEN: usize = 20;

/// Smallest hypervisor hello this crate understands.
pub const HELLO_MIN_SIZE: usize = 4 + 16 + 4 + 8 + NAME_LEN;

/// Largest hypervisor hello accepted.
pub const HELLO_MAX_SIZE: usize = 4096;

/// Guest identity sent by the hypervisor when it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Guest UUID.
    pub uuid: [u8; 16],
    /// Guest start time, seconds since the epoch.
    pub start_time: i64,
    /// Guest name.
    pub name: String,
}

impl Handshake {
    /// Reads the hypervisor hello from `r`.
    pub async fn read(r: &mut (impl AsyncRead + Unpin)) -> Result<Self> {
        let size = r.read_u32_le().await? as usize;
        if !(HELLO_MIN_SIZE..=HELLO_MAX_SIZE).contains(&size) {
            return Err(Error::Invalid("handshake size"));
        }
        let mut rest = vec![0u8; size - 4];
        r.read_exact(&mut rest).await?;
        Self::parse(&rest)
    }

    /// Parses the hello after its size field; trailing bytes are ignored.
    fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let uuid = r.array()?;
        r.skip(4)?;
        let start_time = r.i64()?;
        let raw = r.bytes(NAME_LEN)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        let name = String::from_utf8_lossy(&raw[..end]).into_owned();
        Ok(Self {
            uuid,
            start_time,
            name,
        })
    }
}

impl Encode for Handshake {
    fn encode(&self, w: &mut Writer) {
        #[allow(clippy::cast_possible_truncation)]
        w.u32(HELLO_MIN_SIZE as u32).bytes(&self.uuid).pad(4).i64(self.start_time);
        let name = self.name.as_bytes();
        let len = name.len().min(NAME_LEN - 1);
        w.bytes(&name[..len]).pad(NAME_LEN - len);
    }
}

/// Data the introspector echoes back when it accepts a guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeReply {
    /// Hash proving knowledge of the guest's cookie.
    pub cookie_hash: [u8; COOKIE_HASH_LEN],
}

impl HandshakeReply {
    /// Size on the wire.
    pub const SIZE: usize = 4 + COOKIE_HASH_LEN;

    /// Writes the reply to `w`.
    pub async fn write(&self, w: &mut (impl AsyncWrite + Unpin)) -> Result<()> {
        w.write_all(&self.to_body()).await?;
        w.flush().await?;
        Ok(())
    }

    /// Reads a reply from `r`.
    pub async fn read(r: &mut (impl AsyncRead + Unpin)) -> Result<Self> {
        let size = r.read_u32_le().await? as usize;
        if size < Self::SIZE || size > HELLO_MAX_SIZE {
            return Err(Error::Invalid("handshake reply size"));
        }
        let mut rest = vec![0u8; size - 4];
        r.read_exact(&mut rest).await?;
        let cookie_hash = Reader::new(&rest).array()?;
        Ok(Self { cookie_hash })
    }
}

impl Encode for HandshakeReply {
    fn encode(&self, w: &mut Writer) {
        #[allow(clippy::cast_possible_truncation)]
        w.u32(Self::SIZE as u32).bytes(&self.cookie_hash);
    }
}
