//! Page-access and sub-page write-bitmap batches.
//!
//! Batch bodies are `[view: u16][count: u16][pad: u32][count × element]`.
//! The element count is always written explicitly and bounded by what fits
//! in one frame.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::codec::{Encode, MAX_BODY_SIZE, Reader, Writer};
use crate::command::Command;
use crate::error::{Error, Result};
use crate::message::MessageId;

/// Size of the `{view, count, padding}` prefix of every batch body.
pub const BATCH_HEADER_SIZE: usize = 8;

/// Most elements of `elem_size` bytes that fit in one batch frame.
///
/// Zero means a single element cannot be sent at all.
pub const fn batch_capacity(elem_size: usize) -> usize {
    if elem_size == 0 || elem_size > MAX_BODY_SIZE - BATCH_HEADER_SIZE {
        return 0;
    }
    let n = (MAX_BODY_SIZE - BATCH_HEADER_SIZE) / elem_size;
    if n > u16::MAX as usize {
        u16::MAX as usize
    } else {
        n
    }
}

/// EPT permission bits for one page.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Access(u8);

impl Access {
    /// No access.
    pub const NONE: Self = Self(0);
    /// Readable.
    pub const R: Self = Self(1 << 0);
    /// Writable.
    pub const W: Self = Self(1 << 1);
    /// Executable.
    pub const X: Self = Self(1 << 2);
    /// Exempt from shadow-view (#VE) conversion.
    pub const SVE: Self = Self(1 << 3);
    /// Full access.
    pub const RWX: Self = Self(0b111);

    /// All defined bits.
    const MASK: u8 = 0b1111;

    /// Raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Validates raw bits.
    pub const fn from_bits(bits: u8) -> Result<Self> {
        if bits & !Self::MASK == 0 {
            Ok(Self(bits))
        } else {
            Err(Error::Invalid("page access bits"))
        }
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Access {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Access {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Access({self})")
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: Self, c: char| if self.contains(bit) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Self::R, 'r'),
            flag(Self::W, 'w'),
            flag(Self::X, 'x')
        )?;
        if self.contains(Self::SVE) {
            f.write_str("+sve")?;
        }
        Ok(())
    }
}

/// Permission change for one guest page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAccessEntry {
    /// Guest physical address of the page.
    pub gpa: u64,
    /// New permissions.
    pub access: Access,
}

impl PageAccessEntry {
    /// Size on the wire.
    pub const SIZE: usize = 16;
}

impl Encode for PageAccessEntry {
    fn encode(&self, w: &mut Writer) {
        w.u64(self.gpa).u8(self.access.bits()).pad(7);
    }
}

/// Sub-page write permissions for one guest page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBitmapEntry {
    /// Guest physical address of the page.
    pub gpa: u64,
    /// One bit per 128-byte sub-page; set means writable.
    pub bitmap: u32,
}

impl WriteBitmapEntry {
    /// Size on the wire.
    pub const SIZE: usize = 16;
}

impl Encode for WriteBitmapEntry {
    fn encode(&self, w: &mut Writer) {
        w.u64(self.gpa).u32(self.bitmap).pad(4);
    }
}

/// A command whose body is a view-scoped, count-prefixed batch.
pub trait Batch: Command {
    /// Element type.
    type Item: Clone;

    /// Encoded size of one element.
    const ITEM_SIZE: usize;

    /// Most elements per frame.
    const CAPACITY: usize = batch_capacity(Self::ITEM_SIZE);

    /// Builds one frame's worth of the batch.
    fn with_items(view: u16, items: Vec<Self::Item>) -> Self;
}

/// Writes the batch prefix.
fn batch_header(w: &mut Writer, view: u16, count: usize) {
    #[allow(clippy::cast_possible_truncation)]
    w.u16(view).u16(count as u16).pad(4);
}

/// Sets EPT permissions for a batch of pages.
#[derive(Debug, Clone)]
pub struct SetPageAccess {
    /// EPT view.
    pub view: u16,
    /// Pages and permissions.
    pub entries: Vec<PageAccessEntry>,
}

impl Encode for SetPageAccess {
    fn encode(&self, w: &mut Writer) {
        batch_header(w, self.view, self.entries.len());
        for e in &self.entries {
            w.put(e);
        }
    }
}

impl Command for SetPageAccess {
    const ID: MessageId = MessageId::SetPageAccess;
    type Reply = ();

    fn decode_reply(&self, _r: &mut Reader<'_>) -> Result<Self::Reply> {
        Ok(())
    }
}

impl Batch for SetPageAccess {
    type Item = PageAccessEntry;
    const ITEM_SIZE: usize = PageAccessEntry::SIZE;

    fn with_items(view: u16, entries: Vec<PageAccessEntry>) -> Self {
        Self { view, entries }
    }
}

/// Reads EPT permissions for a batch of pages.
#[derive(Debug, Clone)]
pub struct GetPageAccess {
    /// EPT view.
    pub view: u16,
    /// Page addresses.
    pub gpas: Vec<u64>,
}

impl Encode for GetPageAccess {
    fn encode(&self, w: &mut Writer) {
        batch_header(w, self.view, self.gpas.len());
        for gpa in &self.gpas {
            w.u64(*gpa);
        }
    }
}

impl Command for GetPageAccess {
    const ID: MessageId = MessageId::GetPageAccess;
    type Reply = Vec<Access>;

    fn decode_reply(&self, r: &mut Reader<'_>) -> Result<Self::Reply> {
        r.bytes(self.gpas.len())?
            .iter()
            .map(|&b| Access::from_bits(b))
            .collect()
    }
}

impl Batch for GetPageAccess {
    type Item = u64;
    const ITEM_SIZE: usize = 8;

    fn with_items(view: u16, gpas: Vec<u64>) -> Self {
        Self { view, gpas }
    }
}

/// Sets sub-page write bitmaps for a batch of pages.
#[derive(Debug, Clone)]
pub struct SetPageWriteBitmap {
    /// EPT view.
    pub view: u16,
    /// Pages and bitmaps.
    pub entries: Vec<WriteBitmapEntry>,
}

impl Encode for SetPageWriteBitmap {
    fn encode(&self, w: &mut Writer) {
        batch_header(w, self.view, self.entries.len());
        for e in &self.entries {
            w.put(e);
        }
    }
}

impl Command for SetPageWriteBitmap {
    const ID: MessageId = MessageId::SetPageWriteBitmap;
    type Reply = ();

    fn decode_reply(&self, _r: &mut Reader<'_>) -> Result<Self::Reply> {
        Ok(())
    }
}

impl Batch for SetPageWriteBitmap {
    type Item = WriteBitmapEntry;
    const ITEM_SIZE: usize = WriteBitmapEntry::SIZE;

    fn with_items(view: u16, entries: Vec<WriteBitmapEntry>) -> Self {
        Self { view, entries }
    }
}

/// Reads sub-page write bitmaps for a batch of pages.
#[derive(Debug, Clone)]
pub struct GetPageWriteBitmap {
    /// EPT view.
    pub view: u16,
    /// Page addresses.
    pub gpas: Vec<u64>,
}

impl Encode for GetPageWriteBitmap {
    fn encode(&self, w: &mut Writer) {
        batch_header(w, self.view, self.gpas.len());
        for gpa in &self.gpas {
            w.u64(*gpa);
        }
    }
}

impl Command for GetPageWriteBitmap {
    const ID: MessageId = MessageId::GetPageWriteBitmap;
    type Reply = Vec<u32>;

    fn decode_reply(&self, r: &mut Reader<'_>) -> Result<Self::Reply> {
        (0..self.gpas.len()).map(|_| r.u32()).collect()
    }
}

impl Batch for GetPageWriteBitmap {
    type Item = u64;
    const ITEM_SIZE: usize = 8;

    fn with_items(view: u16, gpas: Vec<u64>) -> Self {
        Self { view, gpas }
    }
}

/// Parsed batch body, as the hypervisor sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchBody<'a> {
    /// EPT view.
    pub view: u16,
    /// Declared element count.
    pub count: u16,
    /// Raw elements, `count × element size` bytes.
    pub elements: &'a [u8],
}

impl<'a> BatchBody<'a> {
    /// Splits a batch body, checking the declared count against `elem_size`.
    pub fn parse(body: &'a [u8], elem_size: usize) -> Result<Self> {
        let mut r = Reader::new(body);
        let view = r.u16()?;
        let count = r.u16()?;
        r.skip(4)?;
        let elements = r.bytes(usize::from(count) * elem_size)?;
        Ok(Self {
            view,
            count,
            elements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacities() {
        assert_eq!(SetPageAccess::CAPACITY, 510);
        assert_eq!(GetPageAccess::CAPACITY, 1021);
        assert_eq!(SetPageWriteBitmap::CAPACITY, 510);
        assert_eq!(GetPageWriteBitmap::CAPACITY, 1021);
        assert_eq!(batch_capacity(MAX_BODY_SIZE), 0);
        assert_eq!(batch_capacity(0), 0);
    }

    #[test]
    fn full_batch_fits_one_frame() {
        let entries = vec![
            PageAccessEntry {
                gpa: 0,
                access: Access::RWX,
            };
            SetPageAccess::CAPACITY
        ];
        let body = SetPageAccess { view: 0, entries }.to_body();
        assert!(body.len() <= MAX_BODY_SIZE);
        assert!(crate::codec::encode(MessageId::SetPageAccess, 0, &body).is_ok());
    }

    #[test]
    fn set_page_access_layout() {
        let body = SetPageAccess {
            view: 0,
            entries: vec![PageAccessEntry {
                gpa: 0x1000,
                access: Access::R | Access::X,
            }],
        }
        .to_body();

        let batch = BatchBody::parse(&body, PageAccessEntry::SIZE).unwrap();
        assert_eq!(batch.view, 0);
        assert_eq!(batch.count, 1);
        let mut r = Reader::new(batch.elements);
        assert_eq!(r.u64().unwrap(), 0x1000);
        assert_eq!(r.u8().unwrap(), 0b101);
    }

    #[test]
    fn access_bits_are_validated() {
        assert_eq!(Access::from_bits(0b1011).unwrap(), Access::R | Access::W | Access::SVE);
        assert!(Access::from_bits(0x10).is_err());
        assert_eq!((Access::R | Access::X).to_string(), "r-x");
        assert_eq!((Access::RWX | Access::SVE).to_string(), "rwx+sve");
    }

    #[test]
    fn get_replies_use_request_count() {
        let cmd = GetPageWriteBitmap {
            view: 1,
            gpas: vec![0x1000, 0x2000],
        };
        let mut w = Writer::new();
        w.u32(0xffff_0000).u32(0x0000_ffff);
        let body = w.into_inner();
        let got = cmd.decode_reply(&mut Reader::new(&body)).unwrap();
        assert_eq!(got, vec![0xffff_0000, 0x0000_ffff]);

        let cmd = GetPageAccess {
            view: 0,
            gpas: vec![0x1000, 0x2000, 0x3000],
        };
        assert!(cmd.decode_reply(&mut Reader::new(&[1, 7])).is_err());
    }
}
