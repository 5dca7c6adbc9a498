//! # Offline Reader
//!
//! Validates a dump image and gives access to its sections. The image is the
//! dump region of the device starting at the leader header. A dump whose
//! trailer is missing (for instance because it was cancelled) is rejected.

use crate::addresses::{PhysicalAddress, round_page};
use crate::arch::ArchDumpFormat;
use crate::avail::{self, PhysRange};
use crate::error::HeaderError;
use crate::header::DumpHeader;
use crate::meta::MiniDumpMeta;
use crate::{DUMP_HEADER_SIZE, PAGE_SHIFT, PAGE_SIZE};
use core::ops::Range;

/// A validated minidump image.
#[derive(Debug)]
pub struct MiniDump<'a> {
    payload: &'a [u8],
    header: DumpHeader,
    meta: MiniDumpMeta,
    msgbuf: Range<usize>,
    avail: Range<usize>,
    bitmap: Range<usize>,
    pmap: Range<usize>,
    pages: Range<usize>,
}

impl<'a> MiniDump<'a> {
    /// Validate `image` as a dump written by architecture `A`.
    ///
    /// # Errors
    /// - Leader damage, see [`DumpHeader::parse`].
    /// - [`HeaderError::Truncated`] if no valid trailer follows the payload.
    /// - [`HeaderError::Mismatch`] if leader and trailer differ.
    /// - [`HeaderError::BadMetadata`] if the metadata page does not describe
    ///   the payload.
    pub fn parse<A: ArchDumpFormat>(image: &'a [u8]) -> Result<Self, HeaderError> {
        let header = DumpHeader::parse(image)?;
        let len = usize::try_from(header.dump_length()).map_err(|_| HeaderError::Truncated)?;

        let trailer_at = DUMP_HEADER_SIZE
            .checked_add(len)
            .ok_or(HeaderError::Truncated)?;
        let trailer = image
            .get(trailer_at..trailer_at.saturating_add(DUMP_HEADER_SIZE))
            .ok_or(HeaderError::Truncated)
            .and_then(|bytes| DumpHeader::parse(bytes).map_err(|_| HeaderError::Truncated))?;
        DumpHeader::validate_pair(&header, &trailer)?;

        if header.arch()? != A::ARCH_NAME {
            return Err(HeaderError::BadMetadata("architecture mismatch"));
        }

        let payload = &image[DUMP_HEADER_SIZE..trailer_at];
        let meta = MiniDumpMeta::decode(payload)?;
        if !meta.has_magic(A::META_MAGIC) {
            return Err(HeaderError::BadMetadata("bad metadata magic"));
        }
        if meta.version != A::META_VERSION {
            return Err(HeaderError::BadMetadata("unsupported metadata version"));
        }
        if meta.pmap_size % PAGE_SIZE as u64 != 0 {
            return Err(HeaderError::BadMetadata("page-table section not page-aligned"));
        }
        if meta.bitmap_size % 8 != 0 {
            return Err(HeaderError::BadMetadata("bitmap is not whole words"));
        }

        let mut cursor = PAGE_SIZE;
        let mut section = |size: u64| -> Result<Range<usize>, HeaderError> {
            let start = cursor;
            let (Ok(size), Ok(padded)) = (usize::try_from(size), usize::try_from(round_page(size)))
            else {
                return Err(HeaderError::BadMetadata("section exceeds dump"));
            };
            cursor = start
                .checked_add(padded)
                .filter(|&end| end <= len)
                .ok_or(HeaderError::BadMetadata("section exceeds dump"))?;
            Ok(start..start + size)
        };
        let msgbuf = section(u64::from(meta.msgbuf_size))?;
        let avail = section(u64::from(meta.dumpavail_size))?;
        let bitmap = section(u64::from(meta.bitmap_size))?;
        let pmap = section(meta.pmap_size)?;
        let pages = cursor..len;

        let dump = Self {
            payload,
            header,
            meta,
            msgbuf,
            avail,
            bitmap,
            pmap,
            pages,
        };
        let expected = dump.bitmap_words().map(|w| u64::from(w.count_ones())).sum::<u64>();
        if dump.page_count() != expected || dump.pages.len() % PAGE_SIZE != 0 {
            return Err(HeaderError::BadMetadata("page count does not match bitmap"));
        }
        Ok(dump)
    }

    #[must_use]
    pub const fn header(&self) -> &DumpHeader {
        &self.header
    }

    #[must_use]
    pub const fn meta(&self) -> &MiniDumpMeta {
        &self.meta
    }

    /// Kernel message buffer contents.
    #[must_use]
    pub fn msgbuf(&self) -> &'a [u8] {
        &self.payload[self.msgbuf.clone()]
    }

    /// The recorded physical availability table.
    pub fn dump_avail(&self) -> impl Iterator<Item = PhysRange> + 'a {
        avail::decode(&self.payload[self.avail.clone()])
    }

    /// Whether the page containing `pa` was dumped.
    #[must_use]
    pub fn bitmap_contains(&self, pa: PhysicalAddress) -> bool {
        let index = pa.as_u64() >> PAGE_SHIFT;
        usize::try_from(index / 64)
            .ok()
            .and_then(|w| self.bitmap_word(w))
            .is_some_and(|word| word & (1 << (index % 64)) != 0)
    }

    /// Contents of the dumped page containing `pa`.
    #[must_use]
    pub fn page(&self, pa: PhysicalAddress) -> Option<&'a [u8]> {
        if !self.bitmap_contains(pa) {
            return None;
        }
        let index = pa.as_u64() >> PAGE_SHIFT;
        let word = usize::try_from(index / 64).ok()?;
        let below = (1u64 << (index % 64)) - 1;
        let rank = self
            .bitmap_words()
            .take(word)
            .map(|w| w.count_ones() as usize)
            .sum::<usize>()
            + (self.bitmap_word(word)? & below).count_ones() as usize;

        let start = self.pages.start + rank * PAGE_SIZE;
        self.payload.get(start..start + PAGE_SIZE)
    }

    /// The page-table pages, in walk order.
    pub fn page_tables(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.payload[self.pmap.clone()].chunks_exact(PAGE_SIZE)
    }

    /// Number of memory pages in the dump.
    #[must_use]
    pub fn page_count(&self) -> u64 {
        (self.pages.len() / PAGE_SIZE) as u64
    }

    fn bitmap_words(&self) -> impl Iterator<Item = u64> + 'a {
        self.payload[self.bitmap.clone()]
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
    }

    fn bitmap_word(&self, index: usize) -> Option<u64> {
        let start = self.bitmap.start.checked_add(index.checked_mul(8)?)?;
        if start + 8 > self.bitmap.end {
            return None;
        }
        let c = &self.payload[start..start + 8];
        Some(u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
    }
}
