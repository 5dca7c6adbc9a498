#![allow(dead_code)]

use kernel_dump::arch::KernelLayout;
use kernel_dump::{
    ArchDumpFormat, ChunkBuffer, Console, DeviceError, DumpAvail, DumpConfig, DumpContext,
    DumpDevice, DumpError, DumpHeader, DumpIdentity, DumpOracle, DumpSource, DumpSummary,
    PAGE_SIZE, PageBitmap, PageTableWalk, PhysMapper, PhysRange, PhysicalAddress, PhysicalPage,
    ScratchMapper, VirtualAddress, WalkEvent, minidumpsys,
};
use std::cell::Cell;
use std::collections::HashMap;
use std::ptr::NonNull;

/// One device call as seen by [`RecordingDevice`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Write {
    pub offset: u64,
    pub len: usize,
}

/// In-memory block device that records every call.
pub struct RecordingDevice {
    pub media_offset: u64,
    pub media: Vec<u8>,
    pub block_size: u32,
    pub max_io: usize,
    pub writes: Vec<Write>,
    pub begins: usize,
    pub finishes: usize,
    pub completions: usize,
    /// Fail the n-th data write of an attempt (1-based) with `NoSpace`.
    pub no_space_at: Option<usize>,
    /// Number of attempts the `NoSpace` fault is injected into.
    pub no_space_attempts: usize,
    /// Fail the n-th data write of the first attempt with `Io(5)`.
    pub io_error_at: Option<usize>,
    writes_this_attempt: usize,
}

impl RecordingDevice {
    pub fn new(media_size: usize) -> Self {
        Self::with_offset(0, media_size)
    }

    pub fn with_offset(media_offset: u64, media_size: usize) -> Self {
        Self {
            media_offset,
            media: vec![0; media_offset as usize + media_size],
            block_size: 512,
            max_io: 64 * 1024,
            writes: Vec::new(),
            begins: 0,
            finishes: 0,
            completions: 0,
            no_space_at: None,
            no_space_attempts: 0,
            io_error_at: None,
            writes_this_attempt: 0,
        }
    }

    /// Device contents from `offset` to the end of the media.
    pub fn image_from(&self, offset: u64) -> &[u8] {
        &self.media[offset as usize..]
    }

    pub fn bytes_at(&self, offset: u64, len: usize) -> &[u8] {
        &self.media[offset as usize..offset as usize + len]
    }
}

impl DumpDevice for RecordingDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn max_io_size(&self) -> usize {
        self.max_io
    }

    fn media_offset(&self) -> u64 {
        self.media_offset
    }

    fn media_size(&self) -> u64 {
        self.media.len() as u64 - self.media_offset
    }

    fn begin(&mut self, header: &DumpHeader) -> Result<(), DeviceError> {
        assert!(DumpHeader::parse(header.as_bytes()).is_ok());
        self.begins += 1;
        self.writes_this_attempt = 0;
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        if data.is_empty() {
            self.completions += 1;
            return Ok(());
        }

        self.writes_this_attempt += 1;
        if self.no_space_attempts > 0 && self.no_space_at == Some(self.writes_this_attempt) {
            self.no_space_attempts -= 1;
            return Err(DeviceError::NoSpace);
        }
        if self.begins == 1 && self.io_error_at == Some(self.writes_this_attempt) {
            return Err(DeviceError::Io(5));
        }

        assert!(data.len() <= self.max_io, "transfer exceeds max_io_size");
        assert!(offset >= self.media_offset);
        let start = offset as usize;
        self.media[start..start + data.len()].copy_from_slice(data);
        self.writes.push(Write {
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<(), DeviceError> {
        self.finishes += 1;
        Ok(())
    }
}

#[repr(C, align(4096))]
pub struct Frame(pub [u8; PAGE_SIZE]);

/// Simulated physical memory. Pages never written read as zeros.
pub struct SimMemory {
    frames: HashMap<u64, Box<Frame>>,
    zero: Box<Frame>,
    pub entered: Vec<PhysicalPage>,
    pub mapped: Option<PhysicalPage>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self {
            frames: HashMap::new(),
            zero: Box::new(Frame([0; PAGE_SIZE])),
            entered: Vec::new(),
            mapped: None,
        }
    }

    /// Fill the page at `pa` with `byte`.
    pub fn fill(&mut self, pa: u64, byte: u8) {
        self.frame_mut(pa).0.fill(byte);
    }

    /// Store a 64-bit little-endian word at `pa`.
    pub fn write_u64(&mut self, pa: u64, value: u64) {
        let off = (pa as usize) % PAGE_SIZE;
        self.frame_mut(pa).0[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn frame_mut(&mut self, pa: u64) -> &mut Frame {
        self.frames
            .entry(pa / PAGE_SIZE as u64)
            .or_insert_with(|| Box::new(Frame([0; PAGE_SIZE])))
    }

    fn frame_ptr(&mut self, index: u64) -> NonNull<[u8; PAGE_SIZE]> {
        let frame = self.frames.get_mut(&index).unwrap_or(&mut self.zero);
        NonNull::from(&mut frame.0)
    }
}

unsafe impl ScratchMapper for SimMemory {
    fn enter(&mut self, page: PhysicalPage) -> NonNull<[u8; PAGE_SIZE]> {
        self.entered.push(page);
        self.mapped = Some(page);
        self.frame_ptr(page.index())
    }

    fn leave(&mut self) {
        self.mapped = None;
    }
}

impl PhysMapper for SimMemory {
    unsafe fn phys_to_ref<'a, T>(&self, pa: PhysicalAddress) -> &'a T {
        let frame = self
            .frames
            .get(&(pa.as_u64() / PAGE_SIZE as u64))
            .unwrap_or(&self.zero);
        let ptr = frame.0.as_ptr().wrapping_add(pa.page_offset() as usize);
        unsafe { &*ptr.cast::<T>() }
    }
}

/// Scratch mapper over memory that is also read by a page-table walker.
pub struct SharedScratch<'a> {
    pub mem: &'a SimMemory,
    pub entered: Vec<PhysicalPage>,
}

impl<'a> SharedScratch<'a> {
    pub fn new(mem: &'a SimMemory) -> Self {
        Self {
            mem,
            entered: Vec::new(),
        }
    }
}

unsafe impl ScratchMapper for SharedScratch<'_> {
    fn enter(&mut self, page: PhysicalPage) -> NonNull<[u8; PAGE_SIZE]> {
        self.entered.push(page);
        let frame = self.mem.frames.get(&page.index()).unwrap_or(&self.mem.zero);
        NonNull::from(&frame.0)
    }

    fn leave(&mut self) {}
}

pub fn identity() -> DumpIdentity<'static> {
    DumpIdentity {
        hostname: "testhost",
        version: "kernel-dump test kernel",
        panic: Some("test panic"),
        time: 1_700_000_000,
    }
}

/// Console that returns `key` on the given poll numbers (1-based).
pub struct ScriptedConsole {
    pub polls: usize,
    pub script: Vec<(usize, u8)>,
}

impl ScriptedConsole {
    pub fn new(script: &[(usize, u8)]) -> Self {
        Self {
            polls: 0,
            script: script.to_vec(),
        }
    }
}

impl Console for ScriptedConsole {
    fn poll_char(&mut self) -> Option<u8> {
        self.polls += 1;
        self.script
            .iter()
            .find(|(at, _)| *at == self.polls)
            .map(|&(_, key)| key)
    }
}

pub const TEST_LAYOUT: KernelLayout = KernelLayout {
    kernbase: VirtualAddress::new(0xffff_ffff_8000_0000),
    kernend: VirtualAddress::new(0xffff_ffff_ffff_f000),
    dmapbase: VirtualAddress::new(0),
    dmapend: VirtualAddress::new(0),
};

/// Architecture whose walk replays a fixed event list.
pub struct ListArch {
    pub events: Vec<WalkEvent>,
}

impl ListArch {
    /// Map each page of `pages` with a 4 KiB leaf, behind `tables`.
    pub fn new(tables: &[u64], pages: &[u64]) -> Self {
        let mut events: Vec<WalkEvent> = tables
            .iter()
            .map(|&pa| WalkEvent::Table(PhysicalPage::containing(PhysicalAddress::new(pa))))
            .collect();
        events.extend(pages.iter().map(|&pa| WalkEvent::Leaf {
            va: VirtualAddress::new(0xffff_ffff_8000_0000 + pa),
            pa: PhysicalAddress::new(pa),
            size: PAGE_SIZE as u64,
        }));
        Self { events }
    }
}

impl PageTableWalk for ListArch {
    fn walk<E, F>(&self, mut visit: F) -> Result<(), E>
    where
        F: FnMut(WalkEvent) -> Result<(), E>,
    {
        self.events.iter().copied().try_for_each(&mut visit)
    }
}

impl ArchDumpFormat for ListArch {
    const ARCH_NAME: &'static str = "testarch";
    const ARCH_VERSION: u32 = 3;
    const META_MAGIC: &'static str = "minidump testarch";
    const META_VERSION: u32 = 1;

    fn layout(&self) -> KernelLayout {
        TEST_LAYOUT
    }
}

/// Oracle over a fixed table where one page stops being dumpable after it
/// has been asked about `honest_queries` times.
pub struct ShrinkingOracle<'a> {
    pub inner: DumpAvail<'a>,
    pub victim: PhysicalAddress,
    pub honest_queries: usize,
    pub victim_queries: Cell<usize>,
}

impl<'a> ShrinkingOracle<'a> {
    pub fn new(ranges: &'a [PhysRange], victim: u64, honest_queries: usize) -> Self {
        Self {
            inner: DumpAvail::new(ranges),
            victim: PhysicalAddress::new(victim),
            honest_queries,
            victim_queries: Cell::new(0),
        }
    }
}

impl DumpOracle for ShrinkingOracle<'_> {
    fn is_dumpable(&self, pa: PhysicalAddress) -> bool {
        if pa == self.victim {
            let n = self.victim_queries.get() + 1;
            self.victim_queries.set(n);
            if n > self.honest_queries {
                return false;
            }
        }
        self.inner.is_dumpable(pa)
    }

    fn ranges(&self) -> &[PhysRange] {
        self.inner.ranges()
    }
}

/// Run a complete dump with freshly allocated bitmap and chunk buffer.
#[allow(clippy::too_many_arguments)]
pub fn run_dump<A, O, M, C>(
    arch: &A,
    oracle: &O,
    first_avail: u64,
    msgbuf: &[u8],
    dev: &mut RecordingDevice,
    mem: &mut M,
    console: &mut C,
    config: &DumpConfig,
) -> Result<DumpSummary, DumpError>
where
    A: ArchDumpFormat,
    O: DumpOracle,
    M: ScratchMapper,
    C: Console,
{
    run_dump_with(arch, oracle, first_avail, msgbuf, dev, mem, console, config, None)
}

/// Like [`run_dump`], starting every attempt from the runtime set `runtime`.
#[allow(clippy::too_many_arguments)]
pub fn run_dump_with<A, O, D, M, C>(
    arch: &A,
    oracle: &O,
    first_avail: u64,
    msgbuf: &[u8],
    dev: &mut D,
    mem: &mut M,
    console: &mut C,
    config: &DumpConfig,
    runtime: Option<&PageBitmap<'_>>,
) -> Result<DumpSummary, DumpError>
where
    A: ArchDumpFormat,
    O: DumpOracle,
    D: DumpDevice,
    M: ScratchMapper,
    C: Console,
{
    let last = oracle.ranges().iter().map(|r| r.end).max().unwrap_or(0);
    let mut words = vec![0u64; PageBitmap::words_for(last)];
    let mut chunk = Box::new(ChunkBuffer::new());
    let mut ctx = DumpContext::new(PageBitmap::new(&mut words), &mut chunk);
    if let Some(set) = runtime {
        ctx = ctx.with_runtime_set(set);
    }
    let source = DumpSource {
        arch,
        oracle,
        first_avail: PhysicalAddress::new(first_avail),
        msgbuf,
        identity: identity(),
    };
    minidumpsys(&mut ctx, &source, dev, mem, console, config)
}
