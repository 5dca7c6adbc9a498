//! # Minidump Metadata Page
//!
//! The first page of the payload describes the remaining sections so the
//! offline reader can find them. Fields sit at fixed offsets, little-endian,
//! with no implicit padding:
//!
//! | offset | size | field |
//! |-------:|-----:|-------|
//! | 0  | 24 | magic (NUL padded) |
//! | 24 | 4  | version |
//! | 28 | 4  | message buffer bytes |
//! | 32 | 4  | bitmap bytes |
//! | 36 | 4  | `dump_avail` table bytes |
//! | 40 | 8  | page-table section bytes |
//! | 48 | 8  | kernel VA base |
//! | 56 | 8  | kernel VA end |
//! | 64 | 8  | direct map base (0 if none) |
//! | 72 | 8  | direct map end (0 if none) |
//!
//! The rest of the page is zero. Every section size is stored unrounded;
//! on disk each section starts on a page boundary.

use crate::PAGE_SIZE;
use crate::addresses::round_page;
use crate::error::HeaderError;

/// Size of the magic field.
pub const META_MAGIC_LEN: usize = 24;

/// Bytes of the page actually used by the encoded fields.
pub const META_ENCODED_LEN: usize = 80;

/// Decoded contents of the metadata page.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MiniDumpMeta {
    pub magic: [u8; META_MAGIC_LEN],
    pub version: u32,
    pub msgbuf_size: u32,
    pub bitmap_size: u32,
    pub dumpavail_size: u32,
    pub pmap_size: u64,
    pub kernbase: u64,
    pub kernend: u64,
    pub dmapbase: u64,
    pub dmapend: u64,
}

impl MiniDumpMeta {
    /// Build the magic field from a string, truncating silently.
    #[must_use]
    pub fn magic_from_str(magic: &str) -> [u8; META_MAGIC_LEN] {
        let mut out = [0u8; META_MAGIC_LEN];
        let n = magic.len().min(META_MAGIC_LEN - 1);
        out[..n].copy_from_slice(&magic.as_bytes()[..n]);
        out
    }

    /// Whether the stored magic equals `magic` (up to the field width).
    #[must_use]
    pub fn has_magic(&self, magic: &str) -> bool {
        self.magic == Self::magic_from_str(magic)
    }

    /// Encode into a zeroed page.
    pub fn encode_page(&self, page: &mut [u8; PAGE_SIZE]) {
        page.fill(0);
        page[0..24].copy_from_slice(&self.magic);
        page[24..28].copy_from_slice(&self.version.to_le_bytes());
        page[28..32].copy_from_slice(&self.msgbuf_size.to_le_bytes());
        page[32..36].copy_from_slice(&self.bitmap_size.to_le_bytes());
        page[36..40].copy_from_slice(&self.dumpavail_size.to_le_bytes());
        page[40..48].copy_from_slice(&self.pmap_size.to_le_bytes());
        page[48..56].copy_from_slice(&self.kernbase.to_le_bytes());
        page[56..64].copy_from_slice(&self.kernend.to_le_bytes());
        page[64..72].copy_from_slice(&self.dmapbase.to_le_bytes());
        page[72..80].copy_from_slice(&self.dmapend.to_le_bytes());
    }

    /// Decode from the first bytes of the metadata page.
    ///
    /// # Errors
    /// [`HeaderError::TooShort`] if fewer than [`META_ENCODED_LEN`] bytes are given.
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        let b = bytes.get(..META_ENCODED_LEN).ok_or(HeaderError::TooShort)?;
        let mut magic = [0u8; META_MAGIC_LEN];
        magic.copy_from_slice(&b[0..24]);
        Ok(Self {
            magic,
            version: le_u32(b, 24),
            msgbuf_size: le_u32(b, 28),
            bitmap_size: le_u32(b, 32),
            dumpavail_size: le_u32(b, 36),
            pmap_size: le_u64(b, 40),
            kernbase: le_u64(b, 48),
            kernend: le_u64(b, 56),
            dmapbase: le_u64(b, 64),
            dmapend: le_u64(b, 72),
        })
    }
}

/// Unrounded byte sizes of the variable-length sections.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SectionSizes {
    pub msgbuf: u64,
    pub dumpavail: u64,
    pub bitmap: u64,
    pub pmap: u64,
}

impl SectionSizes {
    /// Bytes of everything in front of the memory pages: the metadata page
    /// and each section rounded up to a whole page.
    #[must_use]
    pub const fn header_sections_len(&self) -> u64 {
        PAGE_SIZE as u64
            + round_page(self.msgbuf)
            + round_page(self.dumpavail)
            + round_page(self.bitmap)
            + round_page(self.pmap)
    }

    /// Whether the sizes stored as `u32` in the metadata page fit.
    #[must_use]
    pub const fn fits_metadata(&self) -> bool {
        (self.msgbuf | self.dumpavail | self.bitmap) >> 32 == 0
    }

    /// Total payload bytes when `pages` memory pages follow the sections.
    #[must_use]
    pub const fn payload_len(&self, pages: u64) -> u64 {
        self.header_sections_len() + pages * PAGE_SIZE as u64
    }
}

#[inline]
fn le_u32(b: &[u8], off: usize) -> u32 {
    let mut v = [0u8; 4];
    v.copy_from_slice(&b[off..off + 4]);
    u32::from_le_bytes(v)
}

#[inline]
fn le_u64(b: &[u8], off: usize) -> u64 {
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(v)
}
