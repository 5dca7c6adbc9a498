//! # Kernel Minidump
//!
//! Crash-time dump of the kernel's live memory to a raw block device.
//!
//! A *minidump* only contains the physical pages the kernel actually uses:
//! pages mapped by the kernel half of the page tables plus the low memory
//! holding the kernel image, filtered by the table of physical ranges that
//! may be dumped at all. A bitmap with one bit per physical page records
//! which pages were saved, so an offline reader can find any page again.
//!
//! ## On-disk format
//!
//! ```text
//! ┌────────┬──────┬────────┬───────────┬────────┬─────────────┬──────────────┬─────────┐
//! │ leader │ meta │ msgbuf │ dump_avail│ bitmap │ page tables │ memory pages │ trailer │
//! │ 512 B  │ page │ pages  │ pages     │ pages  │ pages       │ ascending PA │ 512 B   │
//! └────────┴──────┴────────┴───────────┴────────┴─────────────┴──────────────┴─────────┘
//! ```
//!
//! The dump is placed at the very end of the device. Leader and trailer are
//! byte-identical [`DumpHeader`]s; a reader rejects a dump where they differ.
//! The metadata page ([`MiniDumpMeta`]) records the size of every section.
//!
//! ## Running a dump
//!
//! Nothing in here allocates. The caller provides the bitmap storage and a
//! [`ChunkBuffer`] in a [`DumpContext`], describes the system in a
//! [`DumpSource`] and hands over the device, the scratch page mapper and the
//! console to [`minidumpsys`]:
//!
//! ```ignore
//! // `dump_set` is the bitmap the kernel kept up to date with
//! // `add_page`/`drop_page` while running.
//! let mut ctx = DumpContext::new(PageBitmap::new(bitmap_words), chunk).with_runtime_set(&dump_set);
//! let source = DumpSource {
//!     arch: &Amd64::new(&hhdm, pml4, DEFAULT_LAYOUT),
//!     oracle: &DumpAvail::new(&dump_avail),
//!     first_avail,
//!     msgbuf,
//!     identity,
//! };
//! minidumpsys(&mut ctx, &source, &mut disk, &mut scratch, &mut console, &DumpConfig::new())?;
//! ```
//!
//! All console output goes through the [`log`] facade.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod addresses;
pub mod arch;
pub mod avail;
pub mod bitmap;
pub mod device;
pub mod dump;
pub mod error;
pub mod header;
pub mod mapping;
pub mod meta;
pub mod reader;
pub mod scan;
pub mod walk;
pub mod writer;

pub use addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
pub use arch::{ArchDumpFormat, KernelLayout};
pub use avail::{DumpAvail, DumpOracle, PhysRange};
pub use bitmap::PageBitmap;
pub use device::{Console, DeviceError, DumpDevice, NoConsole};
pub use dump::{DumpConfig, DumpContext, DumpSource, DumpSummary, minidumpsys};
pub use error::{DumpError, HeaderError};
pub use header::{DumpHeader, DumpIdentity, HeaderParams};
pub use mapping::{PhysMapper, ScratchMapper, ScratchMapping};
pub use meta::{MiniDumpMeta, SectionSizes};
pub use reader::MiniDump;
pub use walk::{PageTableWalk, WalkEvent};
pub use writer::{ChunkBuffer, ChunkWriter, WriteSource};

/// Size of a base page.
pub const PAGE_SIZE: usize = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// Largest single device transfer the dump format issues (16 pages).
pub const MAX_DUMP_IO: usize = 16 * PAGE_SIZE;

/// On-disk size of one [`DumpHeader`] copy.
pub const DUMP_HEADER_SIZE: usize = 512;

/// Space kept free in front of the leader header.
pub const METADATA_RESERVE: u64 = 64 * 1024;

/// Default number of dump attempts.
pub const DEFAULT_RETRY_LIMIT: u32 = 5;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);
