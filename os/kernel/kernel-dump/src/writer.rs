//! # Chunked Block Writer
//!
//! Every byte of a dump reaches the device through [`ChunkWriter`]. Output is
//! staged in a caller-owned [`ChunkBuffer`] and handed to the device one full
//! chunk at a time; the chunk size is the device's maximum transfer, capped
//! at [`MAX_DUMP_IO`] and rounded down to whole pages.
//!
//! Data comes from one of two [`WriteSource`]s: a buffer in kernel memory, or
//! a run of physical pages that are entered one by one into the scratch
//! window and copied out of it.
//!
//! ```text
//!   Buffer(&[u8]) ─────────────┐
//!                              ├──► ChunkBuffer ──(full chunk)──► DumpDevice::write
//!   Physical(pa, len) ─► ScratchMapping ┘
//! ```
//!
//! The writer never retries. Device failures are converted to [`DumpError`]
//! and returned to the orchestrator unchanged.

use crate::addresses::{PhysicalAddress, PhysicalPage, is_page_aligned};
use crate::device::{CTRL_C, Console, DumpDevice};
use crate::error::DumpError;
use crate::mapping::{ScratchMapper, ScratchMapping};
use crate::{MAX_DUMP_IO, PAGE_SIZE};
use log::{info, trace};

/// Staging memory for one chunk.
///
/// Dump-time code cannot allocate, so the caller provides this, usually as
/// a `static`.
#[repr(C, align(4096))]
pub struct ChunkBuffer {
    bytes: [u8; MAX_DUMP_IO],
}

impl ChunkBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: [0; MAX_DUMP_IO],
        }
    }
}

impl Default for ChunkBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the bytes of one [`ChunkWriter::write`] call come from.
#[derive(Copy, Clone, Debug)]
pub enum WriteSource<'a> {
    /// Bytes already addressable by the kernel.
    Buffer(&'a [u8]),
    /// `len` bytes of physical memory starting at the address. Both must be
    /// page-aligned.
    Physical(PhysicalAddress, usize),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Pending {
    Nothing,
    Buffer,
    Physical,
}

/// The partially filled chunk and where it goes on the device.
struct Staging<'w> {
    buf: &'w mut ChunkBuffer,
    size: usize,
    fill: usize,
    /// Device offset of `buf[0]`.
    base: u64,
}

impl Staging<'_> {
    fn push<D: DumpDevice + ?Sized>(
        &mut self,
        device: &mut D,
        mut bytes: &[u8],
    ) -> Result<(), DumpError> {
        while !bytes.is_empty() {
            let n = (self.size - self.fill).min(bytes.len());
            self.buf.bytes[self.fill..self.fill + n].copy_from_slice(&bytes[..n]);
            self.fill += n;
            bytes = &bytes[n..];
            if self.fill == self.size {
                self.flush(device)?;
            }
        }
        Ok(())
    }

    fn push_zeros<D: DumpDevice + ?Sized>(
        &mut self,
        device: &mut D,
        mut len: usize,
    ) -> Result<(), DumpError> {
        while len > 0 {
            let n = (self.size - self.fill).min(len);
            self.buf.bytes[self.fill..self.fill + n].fill(0);
            self.fill += n;
            len -= n;
            if self.fill == self.size {
                self.flush(device)?;
            }
        }
        Ok(())
    }

    fn flush<D: DumpDevice + ?Sized>(&mut self, device: &mut D) -> Result<(), DumpError> {
        if self.fill == 0 {
            return Ok(());
        }
        device.write(self.base, &self.buf.bytes[..self.fill])?;
        self.base += self.fill as u64;
        self.fill = 0;
        Ok(())
    }
}

/// Sequential writer for one dump attempt.
pub struct ChunkWriter<'w, D, M, C>
where
    D: DumpDevice + ?Sized,
    M: ScratchMapper + ?Sized,
    C: Console + ?Sized,
{
    device: &'w mut D,
    mapper: &'w mut M,
    console: &'w mut C,
    staging: Staging<'w>,
    pending: Pending,
    written: u64,
    poll_abort: bool,
}

impl<'w, D, M, C> ChunkWriter<'w, D, M, C>
where
    D: DumpDevice + ?Sized,
    M: ScratchMapper + ?Sized,
    C: Console + ?Sized,
{
    /// Create a writer whose first byte lands at device offset `offset`.
    pub fn new(
        device: &'w mut D,
        mapper: &'w mut M,
        console: &'w mut C,
        chunk: &'w mut ChunkBuffer,
        offset: u64,
    ) -> Self {
        let size = chunk_size(device.max_io_size());
        trace!("chunk writer: {size} byte chunks from offset {offset:#x}");
        Self {
            device,
            mapper,
            console,
            staging: Staging {
                buf: chunk,
                size,
                fill: 0,
                base: offset,
            },
            pending: Pending::Nothing,
            written: 0,
            poll_abort: false,
        }
    }

    /// Append the bytes of `source` to the dump.
    ///
    /// # Errors
    /// - [`DumpError::InvalidWrite`] if a physical source is not page-aligned.
    /// - [`DumpError::Cancelled`] if abort polling is on and Ctrl-C was pressed.
    /// - Device failures, see [`DumpError::from`].
    pub fn write(&mut self, source: WriteSource<'_>) -> Result<(), DumpError> {
        match source {
            WriteSource::Buffer(bytes) => {
                self.switch_to(Pending::Buffer)?;
                self.staging.push(&mut *self.device, bytes)?;
                self.written += bytes.len() as u64;
            }
            WriteSource::Physical(pa, len) => {
                if !pa.is_page_aligned() {
                    return Err(DumpError::InvalidWrite("physical address not page-aligned"));
                }
                if !is_page_aligned(len as u64) {
                    return Err(DumpError::InvalidWrite("physical length not page-aligned"));
                }
                self.switch_to(Pending::Physical)?;

                let mut page = PhysicalPage::containing(pa);
                for _ in 0..len / PAGE_SIZE {
                    {
                        let view = ScratchMapping::map(&mut *self.mapper, page);
                        self.staging.push(&mut *self.device, &view[..])?;
                    }
                    self.written += PAGE_SIZE as u64;
                    self.check_abort()?;
                    page = page.next();
                }
            }
        }
        Ok(())
    }

    /// Append `len` zero bytes.
    ///
    /// # Errors
    /// Device failures.
    pub fn write_zeros(&mut self, len: usize) -> Result<(), DumpError> {
        self.switch_to(Pending::Buffer)?;
        self.staging.push_zeros(&mut *self.device, len)?;
        self.written += len as u64;
        Ok(())
    }

    /// Zero-fill up to the next page boundary of the payload.
    ///
    /// # Errors
    /// Device failures.
    #[allow(clippy::cast_possible_truncation)]
    pub fn pad_to_page(&mut self) -> Result<(), DumpError> {
        let partial = self.written % PAGE_SIZE as u64;
        if partial == 0 {
            return Ok(());
        }
        self.write_zeros(PAGE_SIZE - partial as usize)
    }

    /// Hand a partially filled chunk to the device. No-op when empty.
    ///
    /// # Errors
    /// Device failures.
    pub fn flush(&mut self) -> Result<(), DumpError> {
        self.staging.flush(&mut *self.device)?;
        self.pending = Pending::Nothing;
        Ok(())
    }

    /// Flush, then write `bytes` directly at `offset` and continue after them.
    ///
    /// Used for the header copies, which are not part of the payload and are
    /// not counted by [`bytes_written`](Self::bytes_written).
    ///
    /// # Errors
    /// Device failures.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), DumpError> {
        self.flush()?;
        self.device.write(offset, bytes)?;
        self.staging.base = offset + bytes.len() as u64;
        Ok(())
    }

    /// Device offset the next byte will be written to.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.staging.base + self.staging.fill as u64
    }

    /// Payload bytes accepted so far, flushed or not.
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Enable polling the console for Ctrl-C after each physical page.
    pub const fn set_abort_polling(&mut self, enabled: bool) {
        self.poll_abort = enabled;
    }

    fn switch_to(&mut self, kind: Pending) -> Result<(), DumpError> {
        if self.pending != kind && self.pending != Pending::Nothing {
            self.staging.flush(&mut *self.device)?;
        }
        self.pending = kind;
        Ok(())
    }

    fn check_abort(&mut self) -> Result<(), DumpError> {
        if !self.poll_abort {
            return Ok(());
        }
        match self.console.poll_char() {
            Some(CTRL_C) => Err(DumpError::Cancelled),
            Some(_) => {
                info!(" (CTRL-C to abort) ");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Chunk size for a device transfer limit.
const fn chunk_size(max_io: usize) -> usize {
    let capped = if max_io < MAX_DUMP_IO { max_io } else { MAX_DUMP_IO };
    let pages = capped / PAGE_SIZE;
    if pages == 0 { PAGE_SIZE } else { pages * PAGE_SIZE }
}
