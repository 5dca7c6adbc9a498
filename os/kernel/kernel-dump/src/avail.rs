//! # Dumpable Physical Ranges
//!
//! The `dump_avail` table lists the physical ranges that may be persisted in
//! a crash dump. Device- or firmware-reserved memory is simply absent from
//! it, so a page is dumpable exactly when it lies inside one of the ranges.
//!
//! The table is also written into the dump itself so that an offline reader
//! can tell "not dumped" apart from "not RAM". On disk it is a sequence of
//! little-endian `(start, end)` `u64` pairs terminated by a `(0, 0)` pair.

use crate::addresses::PhysicalAddress;

/// Half-open physical range `[start, end)`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PhysRange {
    pub start: u64,
    pub end: u64,
}

impl PhysRange {
    #[inline]
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: u64) -> bool {
        self.start <= pa && pa < self.end
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Answers "may this physical page be dumped?".
///
/// The kernel keeps its own view of physical memory; an implementation may
/// change its answers while the dump is being prepared (memory hot-remove,
/// late firmware reservations), which is why the dump driver asks again
/// right before sizing and right before writing each page.
pub trait DumpOracle {
    /// Whether the page holding `pa` may be written to the dump.
    fn is_dumpable(&self, pa: PhysicalAddress) -> bool;

    /// The sorted ranges the answer is derived from.
    fn ranges(&self) -> &[PhysRange];
}

/// A sorted, non-overlapping `dump_avail` table.
#[derive(Copy, Clone, Debug)]
pub struct DumpAvail<'a> {
    ranges: &'a [PhysRange],
}

impl<'a> DumpAvail<'a> {
    /// Wrap a table. The ranges must be sorted by `start` and must not overlap.
    #[must_use]
    pub fn new(ranges: &'a [PhysRange]) -> Self {
        debug_assert!(
            ranges.windows(2).all(|w| w[0].end <= w[1].start),
            "dump_avail must be sorted and non-overlapping"
        );
        Self { ranges }
    }

    /// Highest address covered by any range, i.e. the bitmap's upper bound.
    #[must_use]
    pub fn last_address(&self) -> u64 {
        self.ranges.iter().map(|r| r.end).max().unwrap_or(0)
    }

    /// Lowest address covered by any range.
    #[must_use]
    pub fn lowest_address(&self) -> u64 {
        self.ranges.first().map_or(0, |r| r.start)
    }

    #[must_use]
    pub const fn as_slice(&self) -> &'a [PhysRange] {
        self.ranges
    }

    /// Bytes of the on-disk table, terminator included.
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        encoded_len(self.ranges)
    }
}

impl DumpOracle for DumpAvail<'_> {
    fn is_dumpable(&self, pa: PhysicalAddress) -> bool {
        let pa = pa.as_u64();
        // first range whose end lies above pa
        let idx = self.ranges.partition_point(|r| r.end <= pa);
        self.ranges.get(idx).is_some_and(|r| r.contains(pa))
    }

    fn ranges(&self) -> &[PhysRange] {
        self.ranges
    }
}

/// Bytes needed to encode `ranges`, terminator included.
#[must_use]
pub const fn encoded_len(ranges: &[PhysRange]) -> usize {
    (ranges.len() + 1) * 16
}

/// Encode `ranges` into `out` and return the number of bytes written.
///
/// `out` should hold at least [`encoded_len`] bytes; a short buffer
/// truncates the table at a whole pair.
pub fn encode_into(ranges: &[PhysRange], out: &mut [u8]) -> usize {
    let mut pos = 0;
    for r in ranges.iter().chain(core::iter::once(&PhysRange::new(0, 0))) {
        let Some(slot) = out.get_mut(pos..pos + 16) else {
            break;
        };
        slot[..8].copy_from_slice(&r.start.to_le_bytes());
        slot[8..].copy_from_slice(&r.end.to_le_bytes());
        pos += 16;
    }
    pos
}

/// Iterate the pairs of an encoded table up to (excluding) the terminator.
pub fn decode(bytes: &[u8]) -> impl Iterator<Item = PhysRange> + '_ {
    bytes
        .chunks_exact(16)
        .map(|c| {
            let mut start = [0u8; 8];
            let mut end = [0u8; 8];
            start.copy_from_slice(&c[..8]);
            end.copy_from_slice(&c[8..]);
            PhysRange::new(u64::from_le_bytes(start), u64::from_le_bytes(end))
        })
        .take_while(|r| r.start != 0 || r.end != 0)
}
