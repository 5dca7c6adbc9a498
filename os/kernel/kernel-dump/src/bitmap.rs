//! # Page Bitmap
//!
//! One bit per physical page, indexed by page frame number. A set bit means
//! "write this page into the minidump". The storage is owned by the caller
//! (statically reserved by the kernel at boot, sized from the highest
//! `dump_avail` address) because nothing on the dump path may allocate.
//!
//! Besides the crash-time scan, the kernel maintains a second bitmap while
//! running: pages handed out from the direct map are announced with
//! [`PageBitmap::add_page`] and withdrawn with [`PageBitmap::drop_page`].
//! The page-table walk never sees those pages, so every dump attempt starts
//! from that runtime set (see [`DumpContext::with_runtime_set`]).
//!
//! [`DumpContext::with_runtime_set`]: crate::dump::DumpContext::with_runtime_set

use crate::PAGE_SHIFT;
use crate::addresses::{PhysicalAddress, PhysicalPage};

/// Bit-per-page set over caller-provided words.
pub struct PageBitmap<'a> {
    words: &'a mut [u64],
}

impl<'a> PageBitmap<'a> {
    /// Number of `u64` words needed to cover physical memory up to `last_pa`.
    #[must_use]
    pub const fn words_for(last_pa: u64) -> usize {
        let pages = last_pa.div_ceil(1 << PAGE_SHIFT);
        #[allow(clippy::cast_possible_truncation)]
        let words = pages.div_ceil(64) as usize;
        words
    }

    /// Wrap existing storage. The contents are kept as-is.
    #[must_use]
    pub const fn new(words: &'a mut [u64]) -> Self {
        Self { words }
    }

    /// Number of pages the bitmap can describe.
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.words.len() as u64 * 64
    }

    /// Size of the bitmap section in bytes (before page rounding).
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.words.len() * 8
    }

    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Replace the contents with those of `other`. Pages beyond this
    /// bitmap's capacity are ignored.
    pub fn copy_from(&mut self, other: &PageBitmap<'_>) {
        let n = self.words.len().min(other.words.len());
        self.words[..n].copy_from_slice(&other.words[..n]);
        self.words[n..].fill(0);
    }

    #[inline]
    const fn slot(pa: PhysicalAddress) -> (usize, u64) {
        let idx = PhysicalPage::containing(pa).index();
        #[allow(clippy::cast_possible_truncation)]
        ((idx / 64) as usize, 1 << (idx % 64))
    }

    /// Include the page holding `pa` in the dump. Out-of-range pages are ignored.
    pub fn add_page(&mut self, pa: PhysicalAddress) {
        let (word, mask) = Self::slot(pa);
        if let Some(w) = self.words.get_mut(word) {
            *w |= mask;
        }
    }

    /// Exclude the page holding `pa` from the dump.
    pub fn drop_page(&mut self, pa: PhysicalAddress) {
        let (word, mask) = Self::slot(pa);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !mask;
        }
    }

    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        let (word, mask) = Self::slot(pa);
        self.words.get(word).is_some_and(|w| w & mask != 0)
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Set pages in ascending physical order.
    #[must_use]
    pub fn iter(&self) -> Pages<'_> {
        Pages {
            words: &*self.words,
            word: 0,
            bits: self.words.first().copied().unwrap_or(0),
        }
    }

    /// Drop every set page for which `keep` returns `false`; returns the
    /// number of pages still set.
    pub fn retain<F>(&mut self, mut keep: F) -> u64
    where
        F: FnMut(PhysicalPage) -> bool,
    {
        let mut kept = 0;
        for (i, w) in self.words.iter_mut().enumerate() {
            let mut bits = *w;
            while bits != 0 {
                let bit = bits.trailing_zeros();
                bits &= bits - 1;
                let page = PhysicalPage::from_index(i as u64 * 64 + u64::from(bit));
                if keep(page) {
                    kept += 1;
                } else {
                    *w &= !(1 << bit);
                }
            }
        }
        kept
    }

    /// Serialize the words little-endian into `out`; returns bytes written.
    pub fn encode_into(&self, out: &mut [u8]) -> usize {
        let mut n = 0;
        for (w, slot) in self.words.iter().zip(out.chunks_exact_mut(8)) {
            slot.copy_from_slice(&w.to_le_bytes());
            n += 8;
        }
        n
    }

    /// Raw words, in bitmap order.
    #[must_use]
    pub const fn words(&self) -> &[u64] {
        &*self.words
    }
}

/// Iterator over the set pages of a [`PageBitmap`].
pub struct Pages<'b> {
    words: &'b [u64],
    word: usize,
    bits: u64,
}

impl Iterator for Pages<'_> {
    type Item = PhysicalPage;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.bits != 0 {
                let bit = self.bits.trailing_zeros();
                self.bits &= self.bits - 1;
                return Some(PhysicalPage::from_index(
                    self.word as u64 * 64 + u64::from(bit),
                ));
            }
            self.word += 1;
            self.bits = *self.words.get(self.word)?;
        }
    }
}

impl core::iter::FusedIterator for Pages<'_> {}
