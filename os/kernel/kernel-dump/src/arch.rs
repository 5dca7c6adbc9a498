//! # Architecture Dump Formats
//!
//! The dump sequence is the same on every architecture. What differs is
//! the name and version stamped into the headers, the kernel's virtual
//! layout recorded in the metadata page, and how to walk the page tables.
//! [`ArchDumpFormat`] carries exactly those pieces.

pub mod amd64;

use crate::addresses::VirtualAddress;
use crate::meta::{MiniDumpMeta, SectionSizes};
use crate::walk::PageTableWalk;

/// Kernel virtual layout recorded in the metadata page.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct KernelLayout {
    /// Start of kernel virtual address space.
    pub kernbase: VirtualAddress,
    /// End of kernel virtual address space.
    pub kernend: VirtualAddress,
    /// Start of the physical direct map; zero if the architecture has none.
    pub dmapbase: VirtualAddress,
    /// End of the physical direct map; zero if the architecture has none.
    pub dmapend: VirtualAddress,
}

/// Architecture-specific parts of a minidump.
pub trait ArchDumpFormat: PageTableWalk {
    /// Architecture name in the dump header (e.g. `"amd64"`).
    const ARCH_NAME: &'static str;
    /// Architecture-specific header version.
    const ARCH_VERSION: u32;
    /// Magic of the metadata page.
    const META_MAGIC: &'static str;
    /// Version of the metadata page layout.
    const META_VERSION: u32;

    /// Current kernel virtual layout.
    fn layout(&self) -> KernelLayout;

    /// Metadata page contents for the given section sizes.
    ///
    /// Sizes that do not fit the 32-bit fields are clamped; the dump driver
    /// rejects such dumps before calling this.
    fn metadata(&self, sizes: &SectionSizes) -> MiniDumpMeta {
        let layout = self.layout();
        MiniDumpMeta {
            magic: MiniDumpMeta::magic_from_str(Self::META_MAGIC),
            version: Self::META_VERSION,
            msgbuf_size: u32::try_from(sizes.msgbuf).unwrap_or(u32::MAX),
            bitmap_size: u32::try_from(sizes.bitmap).unwrap_or(u32::MAX),
            dumpavail_size: u32::try_from(sizes.dumpavail).unwrap_or(u32::MAX),
            pmap_size: sizes.pmap,
            kernbase: layout.kernbase.as_u64(),
            kernend: layout.kernend.as_u64(),
            dmapbase: layout.dmapbase.as_u64(),
            dmapend: layout.dmapend.as_u64(),
        }
    }
}
