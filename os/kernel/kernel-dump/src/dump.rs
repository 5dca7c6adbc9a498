//! # Dump Orchestrator
//!
//! [`minidumpsys`] runs the whole dump: it rebuilds the page bitmap, sizes
//! the dump, and writes it to the end of the dump device in a fixed order.
//!
//! ```text
//!  media_offset                                            media_offset + media_size
//!  │ ... free ... │ leader │ meta │ msgbuf │ avail │ bitmap │ page tables │ pages ... │ trailer │
//!                 ^ leader_offset                                                    ^ trailer_offset
//! ```
//!
//! Every section starts on a page boundary of the payload. The payload
//! length in the header excludes both header copies.
//!
//! An attempt fails with [`DumpError::MapGrown`] when the set of dumpable
//! pages changed while it ran. Such an attempt is restarted from the scan, up
//! to [`DumpConfig::retry_limit`] attempts in total. Every other error ends
//! the dump.

use crate::addresses::{PhysicalAddress, is_page_aligned};
use crate::arch::ArchDumpFormat;
use crate::avail::{self, DumpOracle};
use crate::bitmap::PageBitmap;
use crate::device::{Console, DumpDevice};
use crate::error::DumpError;
use crate::header::{DumpHeader, DumpIdentity, HeaderParams};
use crate::mapping::ScratchMapper;
use crate::meta::SectionSizes;
use crate::scan::scan;
use crate::walk::WalkEvent;
use crate::writer::{ChunkBuffer, ChunkWriter, WriteSource};
use crate::{DEFAULT_RETRY_LIMIT, DUMP_HEADER_SIZE, METADATA_RESERVE, PAGE_SIZE};
use log::{debug, error, info, warn};

/// Runtime tunables of the dump.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DumpConfig {
    /// Total number of attempts, at least one.
    pub retry_limit: u32,
    /// Bytes kept free in front of the dump on the device.
    pub metadata_reserve: u64,
    /// Granularity of the progress messages, in percent.
    pub progress_step_percent: u8,
    /// Block size stamped into the header instead of the device's.
    pub block_size_override: Option<u32>,
}

impl DumpConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            metadata_reserve: METADATA_RESERVE,
            progress_step_percent: 10,
            block_size_override: None,
        }
    }

    #[must_use]
    pub const fn with_retry_limit(mut self, attempts: u32) -> Self {
        self.retry_limit = if attempts == 0 { 1 } else { attempts };
        self
    }

    #[must_use]
    pub const fn with_metadata_reserve(mut self, bytes: u64) -> Self {
        self.metadata_reserve = bytes;
        self
    }

    #[must_use]
    pub const fn with_progress_step(mut self, percent: u8) -> Self {
        self.progress_step_percent = match percent {
            0 => 1,
            1..=100 => percent,
            _ => 100,
        };
        self
    }

    #[must_use]
    pub const fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size_override = Some(block_size);
        self
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Dump-time state owned by the single caller of [`minidumpsys`].
pub struct DumpContext<'a> {
    bitmap: PageBitmap<'a>,
    runtime: Option<&'a PageBitmap<'a>>,
    chunk: &'a mut ChunkBuffer,
    attempts: u32,
}

impl<'a> DumpContext<'a> {
    /// Bundle the preallocated bitmap and chunk buffer.
    ///
    /// The bitmap must cover every dumpable address, see
    /// [`PageBitmap::words_for`].
    pub const fn new(bitmap: PageBitmap<'a>, chunk: &'a mut ChunkBuffer) -> Self {
        Self {
            bitmap,
            runtime: None,
            chunk,
            attempts: 0,
        }
    }

    /// Start every attempt from the pages the kernel added to (and not
    /// dropped from) `set` while running. The set itself is never modified.
    #[must_use]
    pub const fn with_runtime_set(mut self, set: &'a PageBitmap<'a>) -> Self {
        self.runtime = Some(set);
        self
    }

    /// The bitmap as left by the last attempt.
    #[must_use]
    pub const fn bitmap(&self) -> &PageBitmap<'a> {
        &self.bitmap
    }

    /// Attempts made by the last [`minidumpsys`] call.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// What to dump.
pub struct DumpSource<'a, A, O: ?Sized> {
    pub arch: &'a A,
    pub oracle: &'a O,
    /// Lowest address handed to the page allocator.
    pub first_avail: PhysicalAddress,
    /// Kernel message buffer contents.
    pub msgbuf: &'a [u8],
    pub identity: DumpIdentity<'a>,
}

/// Result of a successful dump.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DumpSummary {
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Payload bytes, as stored in the header.
    pub dump_length: u64,
    /// Memory pages written.
    pub pages: u64,
    pub leader_offset: u64,
    pub trailer_offset: u64,
}

/// Write a minidump of the running kernel to `device`.
///
/// # Errors
/// - [`DumpError::Cancelled`] when the operator pressed Ctrl-C.
/// - [`DumpError::TooSmall`] when the dump cannot fit the device.
/// - [`DumpError::RetriesExhausted`] when every attempt saw the map grow.
/// - Any other error from the device or the writer.
pub fn minidumpsys<A, O, D, M, C>(
    ctx: &mut DumpContext<'_>,
    source: &DumpSource<'_, A, O>,
    device: &mut D,
    mapper: &mut M,
    console: &mut C,
    config: &DumpConfig,
) -> Result<DumpSummary, DumpError>
where
    A: ArchDumpFormat,
    O: DumpOracle + ?Sized,
    D: DumpDevice + ?Sized,
    M: ScratchMapper + ?Sized,
    C: Console + ?Sized,
{
    let limit = config.retry_limit.max(1);
    ctx.attempts = 0;

    for attempt in 1..=limit {
        ctx.attempts = attempt;
        match dump_once(ctx, source, device, mapper, console, config) {
            Ok(summary) => {
                info!("Dump complete");
                return Ok(DumpSummary {
                    attempts: attempt,
                    ..summary
                });
            }
            Err(e) if e.is_retryable() => {
                warn!("Dump map grown while dumping. Retrying...");
            }
            Err(e) => {
                report_failure(&e);
                return Err(e);
            }
        }
    }

    let e = DumpError::RetriesExhausted { attempts: limit };
    report_failure(&e);
    Err(e)
}

fn report_failure(e: &DumpError) {
    match e {
        DumpError::Cancelled => error!("Dump aborted"),
        DumpError::TooSmall { .. } => error!("Dump failed. Partition too small."),
        other => error!("** DUMP FAILED (ERROR {other}) **"),
    }
}

fn dump_once<A, O, D, M, C>(
    ctx: &mut DumpContext<'_>,
    source: &DumpSource<'_, A, O>,
    device: &mut D,
    mapper: &mut M,
    console: &mut C,
    config: &DumpConfig,
) -> Result<DumpSummary, DumpError>
where
    A: ArchDumpFormat,
    O: DumpOracle + ?Sized,
    D: DumpDevice + ?Sized,
    M: ScratchMapper + ?Sized,
    C: Console + ?Sized,
{
    let oracle = source.oracle;

    // SCAN
    let scanned = scan(
        source.arch,
        oracle,
        source.first_avail,
        ctx.runtime,
        &mut ctx.bitmap,
    );
    debug_assert!(is_page_aligned(scanned.pmap_size));

    // SIZE: availability may have changed since the scan
    let pages = ctx.bitmap.retain(|page| oracle.is_dumpable(page.base()));
    let sizes = SectionSizes {
        msgbuf: source.msgbuf.len() as u64,
        dumpavail: avail::encoded_len(oracle.ranges()) as u64,
        bitmap: ctx.bitmap.byte_len() as u64,
        pmap: scanned.pmap_size,
    };
    if !sizes.fits_metadata() {
        return Err(DumpError::Inconsistent("section too large for the metadata page"));
    }
    let dump_length = sizes.payload_len(pages);

    let physmem = oracle
        .ranges()
        .iter()
        .fold(0u64, |acc, r| acc.saturating_add(r.end.saturating_sub(r.start)));
    info!("Physical memory: {} MB", physmem >> 20);
    info!("Dumping {} MB:", dump_length >> 20);

    let headers = 2 * DUMP_HEADER_SIZE as u64;
    let available = device.media_size();
    let Some(needed) = config
        .metadata_reserve
        .checked_add(dump_length)
        .and_then(|n| n.checked_add(headers))
    else {
        return Err(DumpError::TooSmall {
            needed: u64::MAX,
            available,
        });
    };
    if available < needed {
        return Err(DumpError::TooSmall { needed, available });
    }
    let leader_offset = device
        .media_offset()
        .checked_add(available - dump_length - headers)
        .ok_or(DumpError::Inconsistent("dump area beyond the end of the device"))?;

    // HEADER_OUT / START
    let header = DumpHeader::new(
        &HeaderParams {
            arch: A::ARCH_NAME,
            arch_version: A::ARCH_VERSION,
            dump_length,
            block_size: config
                .block_size_override
                .unwrap_or_else(|| device.block_size()),
        },
        &source.identity,
    );
    device.begin(&header)?;

    let mut w = ChunkWriter::new(device, mapper, console, &mut *ctx.chunk, leader_offset);
    w.write_at(leader_offset, header.as_bytes())?;

    // METADATA_OUT
    let mut page = [0u8; PAGE_SIZE];
    source.arch.metadata(&sizes).encode_page(&mut page);
    w.write(WriteSource::Buffer(&page))?;

    w.write(WriteSource::Buffer(source.msgbuf))?;
    w.pad_to_page()?;

    for group in oracle.ranges().chunks(PAGE_SIZE / 16 - 1) {
        let n = avail::encode_into(group, &mut page);
        w.write(WriteSource::Buffer(&page[..n - 16]))?;
    }
    w.write(WriteSource::Buffer(&[0u8; 16]))?;
    w.pad_to_page()?;

    for words in ctx.bitmap.words().chunks(PAGE_SIZE / 8) {
        for (word, slot) in words.iter().zip(page.chunks_exact_mut(8)) {
            slot.copy_from_slice(&word.to_le_bytes());
        }
        w.write(WriteSource::Buffer(&page[..words.len() * 8]))?;
    }
    w.pad_to_page()?;

    // PAGETABLE_OUT
    let mut tables = 0u64;
    source.arch.walk(|event| {
        let WalkEvent::Table(table) = event else {
            return Ok(());
        };
        tables += 1;
        if tables > scanned.table_pages {
            return Err(DumpError::MapGrown);
        }
        w.write(WriteSource::Physical(table.base(), PAGE_SIZE))
    })?;
    if tables != scanned.table_pages {
        return Err(DumpError::MapGrown);
    }
    debug!("dumped {tables} page-table pages");

    // MEMORY_OUT
    w.set_abort_polling(true);
    let mut progress = Progress::new(pages, config.progress_step_percent);
    for frame in ctx.bitmap.iter() {
        if !oracle.is_dumpable(frame.base()) {
            debug!("{frame:?} no longer dumpable");
            return Err(DumpError::MapGrown);
        }
        w.write(WriteSource::Physical(frame.base(), PAGE_SIZE))?;
        progress.advance();
    }
    w.set_abort_polling(false);
    w.flush()?;

    // TRAILER_OUT
    if w.bytes_written() != dump_length {
        debug!(
            "wrote {} payload bytes, sized {dump_length}",
            w.bytes_written()
        );
        return Err(DumpError::MapGrown);
    }
    let trailer_offset = w.offset();
    w.write_at(trailer_offset, header.as_bytes())?;

    device.finish()?;
    device.write(0, &[])?;

    Ok(DumpSummary {
        attempts: 0,
        dump_length,
        pages,
        leader_offset,
        trailer_offset,
    })
}

/// Percent-step progress over the memory pages.
struct Progress {
    total: u64,
    done: u64,
    step: u64,
    next: u64,
}

impl Progress {
    fn new(total: u64, step_percent: u8) -> Self {
        let step = u64::from(step_percent.max(1));
        Self {
            total,
            done: 0,
            step,
            next: step,
        }
    }

    /// Count one page; returns the percentage just reported, if any.
    fn advance(&mut self) -> Option<u64> {
        self.done += 1;
        let percent = self.done * 100 / self.total.max(1);
        if percent < self.next {
            return None;
        }
        let reported = percent - percent % self.step;
        info!("  ..{reported}%");
        self.next = reported + self.step;
        Some(reported)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_builders_clamp() {
        let c = DumpConfig::new()
            .with_retry_limit(0)
            .with_progress_step(0)
            .with_block_size(4096)
            .with_metadata_reserve(0);
        assert_eq!(c.retry_limit, 1);
        assert_eq!(c.progress_step_percent, 1);
        assert_eq!(c.block_size_override, Some(4096));
        assert_eq!(c.metadata_reserve, 0);
        assert_eq!(DumpConfig::default().retry_limit, DEFAULT_RETRY_LIMIT);
        assert_eq!(DumpConfig::new().with_progress_step(250).progress_step_percent, 100);
    }

    #[test]
    fn progress_reports_each_step_once() {
        let mut p = Progress::new(20, 10);
        let reported: Vec<u64> = (0..20).filter_map(|_| p.advance()).collect();
        assert_eq!(reported, [10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);

        let mut p = Progress::new(3, 25);
        let reported: Vec<u64> = (0..3).filter_map(|_| p.advance()).collect();
        assert_eq!(reported, [25, 50, 100]);
    }
}
