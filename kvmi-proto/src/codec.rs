//! Fixed-header frame codec.
//!
//! Each frame is `[id: u16][size: u16][seq: u32][body]`, all little-endian.
//! `size` counts the whole frame, header included.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::message::MessageId;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest frame the peer accepts, header included.
pub const MAX_FRAME_SIZE: usize = 2 * 4096 - HEADER_SIZE;

/// Largest body that fits in one frame.
pub const MAX_BODY_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message identifier (see [`MessageId`]).
    pub id: u16,
    /// Total frame length in bytes, header included.
    pub size: u16,
    /// Sequence number used to pair commands with replies.
    pub seq: u32,
}

impl Header {
    /// Parses and validates a raw header.
    pub fn parse(raw: [u8; HEADER_SIZE]) -> Result<Self> {
        let hdr = Self {
            id: u16::from_le_bytes([raw[0], raw[1]]),
            size: u16::from_le_bytes([raw[2], raw[3]]),
            seq: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        };
        let size = usize::from(hdr.size);
        if !(HEADER_SIZE..=MAX_FRAME_SIZE).contains(&size) {
            return Err(Error::BadSize(hdr.size));
        }
        MessageId::try_from(hdr.id)?;
        Ok(hdr)
    }

    /// Body length implied by `size`.
    pub fn body_len(&self) -> usize {
        usize::from(self.size).saturating_sub(HEADER_SIZE)
    }

    /// Serializes the header.
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.id.to_le_bytes());
        out[2..4].copy_from_slice(&self.size.to_le_bytes());
        out[4..8].copy_from_slice(&self.seq.to_le_bytes());
        out
    }
}

/// A complete frame read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Validated header.
    pub header: Header,
    /// Body bytes (`header.size - HEADER_SIZE` of them).
    pub body: Vec<u8>,
}

/// Builds a frame from `id`, `seq` and an already-encoded body.
pub fn encode(id: MessageId, seq: u32, body: &[u8]) -> Result<Vec<u8>> {
    let total = HEADER_SIZE + body.len();
    if total > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(total));
    }
    #[allow(clippy::cast_possible_truncation)]
    let header = Header {
        id: id as u16,
        size: total as u16,
        seq,
    };
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Splits a buffer holding at least one frame into header and body.
pub fn decode(buf: &[u8]) -> Result<(Header, &[u8])> {
    let raw: [u8; HEADER_SIZE] = buf
        .get(..HEADER_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or(Error::Truncated {
            needed: HEADER_SIZE,
            available: buf.len(),
        })?;
    let header = Header::parse(raw)?;
    let size = usize::from(header.size);
    let body = buf.get(HEADER_SIZE..size).ok_or(Error::Truncated {
        needed: size,
        available: buf.len(),
    })?;
    Ok((header, body))
}

/// Reads one frame from `r`, waiting for partial reads to complete.
pub async fn recv(r: &mut (impl AsyncRead + Unpin)) -> Result<Frame> {
    let mut raw = [0u8; HEADER_SIZE];
    r.read_exact(&mut raw).await?;
    let header = Header::parse(raw)?;
    let mut body = vec![0u8; header.body_len()];
    r.read_exact(&mut body).await?;
    Ok(Frame { header, body })
}

/// Writes pre-encoded frame bytes to `w` and flushes.
pub async fn send(w: &mut (impl AsyncWrite + Unpin), bytes: &[u8]) -> io::Result<()> {
    w.write_all(bytes).await?;
    w.flush().await
}

/// Types with a fixed little-endian wire encoding.
pub trait Encode {
    /// Appends the encoding of `self` to `w`.
    fn encode(&self, w: &mut Writer);

    /// Encodes into a fresh buffer.
    fn to_body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.into_inner()
    }
}

/// Types that can be parsed from a wire body.
pub trait Decode: Sized {
    /// Parses `Self` from the front of `r`.
    fn decode(r: &mut Reader<'_>) -> Result<Self>;
}

impl Decode for () {
    fn decode(_r: &mut Reader<'_>) -> Result<Self> {
        Ok(())
    }
}

impl Decode for u64 {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        r.u64()
    }
}

/// Little-endian append-only buffer.
#[derive(Debug, Default)]
pub struct Writer {
    /// Encoded bytes so far.
    buf: Vec<u8>,
}

impl Writer {
    /// Creates an empty writer.
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Appends a `u8`.
    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    /// Appends a `u16`.
    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Appends a `u32`.
    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Appends a `u64`.
    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Appends an `i32`.
    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Appends an `i64`.
    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Appends raw bytes.
    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Appends `n` zero bytes.
    pub fn pad(&mut self, n: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + n, 0);
        self
    }

    /// Appends any encodable value.
    pub fn put(&mut self, v: &impl Encode) -> &mut Self {
        v.encode(self);
        self
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the writer.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Little-endian cursor over a borrowed body.
#[derive(Debug)]
pub struct Reader<'a> {
    /// Whole input.
    buf: &'a [u8],
    /// Read offset into `buf`.
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Starts reading at the beginning of `buf`.
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Takes the next `n` bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        let Some(end) = end else {
            return Err(Error::Truncated {
                needed: self.pos.saturating_add(n),
                available: self.buf.len(),
            });
        };
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Takes the next `N` bytes as an array.
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Skips `n` padding bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    /// Reads a `u8`.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    /// Reads a `u16`.
    pub fn u16(&mut self) -> Result<u16> {
        self.array().map(u16::from_le_bytes)
    }

    /// Reads a `u32`.
    pub fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_le_bytes)
    }

    /// Reads a `u64`.
    pub fn u64(&mut self) -> Result<u64> {
        self.array().map(u64::from_le_bytes)
    }

    /// Reads an `i32`.
    pub fn i32(&mut self) -> Result<i32> {
        self.array().map(i32::from_le_bytes)
    }

    /// Reads an `i64`.
    pub fn i64(&mut self) -> Result<i64> {
        self.array().map(i64::from_le_bytes)
    }

    /// Parses any decodable value.
    pub fn get<T: Decode>(&mut self) -> Result<T> {
        T::decode(self)
    }

    /// Current offset.
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Unread bytes.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_frame() {
        let body = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let bytes = encode(MessageId::GetGuestInfo, 42, &body).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + body.len());

        let (hdr, decoded) = decode(&bytes).unwrap();
        assert_eq!(hdr.id, MessageId::GetGuestInfo as u16);
        assert_eq!(usize::from(hdr.size), bytes.len());
        assert_eq!(hdr.seq, 42);
        assert_eq!(decoded, body);
    }

    #[test]
    fn empty_body_is_valid() {
        let bytes = encode(MessageId::GetMaxGfn, 7, &[]).unwrap();
        let (hdr, body) = decode(&bytes).unwrap();
        assert_eq!(usize::from(hdr.size), HEADER_SIZE);
        assert!(body.is_empty());
    }

    #[test]
    fn rejects_oversized_body() {
        let body = vec![0u8; MAX_BODY_SIZE + 1];
        assert!(matches!(
            encode(MessageId::SetPageAccess, 1, &body),
            Err(Error::FrameTooLarge(_))
        ));
        assert!(encode(MessageId::SetPageAccess, 1, &body[..MAX_BODY_SIZE]).is_ok());
    }

    #[test]
    fn rejects_size_out_of_bounds() {
        let small = Header {
            id: MessageId::GetVersion as u16,
            size: 4,
            seq: 0,
        };
        assert!(matches!(decode(&small.to_bytes()), Err(Error::BadSize(4))));

        #[allow(clippy::cast_possible_truncation)]
        let big = Header {
            id: MessageId::GetVersion as u16,
            size: (MAX_FRAME_SIZE + 1) as u16,
            seq: 0,
        };
        assert!(matches!(decode(&big.to_bytes()), Err(Error::BadSize(_))));
    }

    #[test]
    fn rejects_short_buffer() {
        let mut bytes = encode(MessageId::GetVersion, 1, &[0u8; 16]).unwrap();
        bytes.truncate(HEADER_SIZE + 10);
        assert!(matches!(
            decode(&bytes),
            Err(Error::Truncated {
                needed: 24,
                available: 18
            })
        ));
        assert!(matches!(decode(&bytes[..3]), Err(Error::Truncated { .. })));
    }

    #[test]
    fn rejects_unknown_id() {
        let hdr = Header {
            id: 200,
            size: 8,
            seq: 0,
        };
        assert!(matches!(
            decode(&hdr.to_bytes()),
            Err(Error::UnknownMessage(200))
        ));
    }

    #[tokio::test]
    async fn recv_reassembles_partial_reads() {
        let frame = encode(MessageId::GetMaxGfn, 9, &[0xaa; 24]).unwrap();
        let (mut tx, mut rx) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            for chunk in frame.chunks(3) {
                tx.write_all(chunk).await.unwrap();
            }
        });

        let got = recv(&mut rx).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got.header.seq, 9);
        assert_eq!(got.body, vec![0xaa; 24]);
    }

    #[tokio::test]
    async fn recv_reports_eof_as_io() {
        let frame = encode(MessageId::GetMaxGfn, 9, &[0u8; 8]).unwrap();
        let mut cursor = &frame[..12];
        let err = recv(&mut cursor).await.unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn reader_reports_truncation() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert_eq!(r.u16().unwrap(), 0x0201);
        assert!(matches!(r.u32(), Err(Error::Truncated { .. })));
        assert_eq!(r.rest(), &[3]);
    }
}
