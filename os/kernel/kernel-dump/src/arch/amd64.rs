//! # x86-64 Minidump Format
//!
//! Walks the kernel half of a four-level PML4 hierarchy:
//!
//! ```text
//!  PML4[256..512] → PDPT → PD → PT → 4 KiB page
//!                     │      └────► PS=1: 2 MiB leaf
//!                     └───────────► PS=1: 1 GiB leaf
//! ```
//!
//! Every table frame is reported as [`WalkEvent::Table`] (PML4 first, then
//! depth-first), every present leaf as [`WalkEvent::Leaf`]. Table frames are
//! read through a [`PhysMapper`], normally the higher-half direct map.
//!
//! The direct map itself is skipped: it maps all of RAM and would turn the
//! minidump into a full dump. Entries whose whole range lies inside
//! `dmapbase..dmapend` are neither descended into nor reported. Pages used
//! through the direct map reach the dump via the runtime set instead.

use crate::addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use crate::arch::{ArchDumpFormat, KernelLayout};
use crate::mapping::PhysMapper;
use crate::walk::{PageTableWalk, WalkEvent};
use bitfield_struct::bitfield;

/// Base of the higher-half direct map.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Base of the kernel image mapping.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// First PML4 slot of the kernel half.
const KERNEL_PML4_FIRST: usize = 256;

const ENTRIES: usize = 512;
const SIZE_512G: u64 = 1 << 39;
const SIZE_1G: u64 = 1 << 30;
const SIZE_2M: u64 = 1 << 21;
const SIZE_4K: u64 = 1 << 12;

/// Default kernel layout: kernel VA from the start of the kernel half to the
/// top of the address space, direct map covering up to 64 TiB.
pub const DEFAULT_LAYOUT: KernelLayout = KernelLayout {
    kernbase: VirtualAddress::new(0xffff_8000_0000_0000),
    kernend: VirtualAddress::new(u64::MAX),
    dmapbase: VirtualAddress::new(HHDM_BASE),
    dmapend: VirtualAddress::new(HHDM_BASE + (64 << 40)),
};

/// Raw 64-bit paging entry, valid at every level.
///
/// | Bits  | Field |
/// |-------|-------|
/// | 0     | present |
/// | 1     | writable |
/// | 2     | user |
/// | 3     | write-through |
/// | 4     | cache disabled |
/// | 5     | accessed |
/// | 6     | dirty (leaf) |
/// | 7     | PS, large page (PDPTE/PDE) |
/// | 8     | global (leaf) |
/// | 9–11  | OS available |
/// | 12–51 | physical frame |
/// | 52–62 | OS available / protection key |
/// | 63    | no-execute |
#[bitfield(u64)]
pub struct PageEntryBits {
    /// Present (P, bit 0). Clear means the entry is ignored.
    pub present: bool,
    /// Writable (RW, bit 1).
    pub writable: bool,
    /// User/Supervisor (US, bit 2). Set allows user-mode access.
    pub user_access: bool,
    /// Page write-through (PWT, bit 3).
    pub write_through: bool,
    /// Page cache disable (PCD, bit 4).
    pub cache_disabled: bool,
    /// Accessed (A, bit 5), set by the CPU.
    pub accessed: bool,
    /// Dirty (D, bit 6), leaf entries only.
    pub dirty: bool,
    /// Page size (PS, bit 7). In a PDPTE or PDE the entry is a 1 GiB or
    /// 2 MiB leaf.
    pub large_page: bool,
    /// Global (G, bit 8), leaf entries only.
    pub global_translation: bool,
    /// Bits 9..=11, free for the OS.
    #[bits(3)]
    pub os_available_low: u8,
    /// Physical address bits [51:12]. For large pages bit 12 is PAT.
    #[bits(40)]
    phys_addr_bits_51_12: u64,
    /// Bits 52..=62, free for the OS or protection key.
    #[bits(11)]
    pub os_available_high: u16,
    /// Execute disable (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        self.with_phys_addr_bits_51_12(pa.as_u64() >> 12)
    }

    /// Base of the frame this entry refers to, aligned to `size`.
    #[inline]
    const fn frame_base(self, size: u64) -> PhysicalAddress {
        PhysicalAddress::new(self.physical_address().as_u64() & !(size - 1))
    }
}

/// One 4 KiB page-table frame at any level.
#[repr(C, align(4096))]
pub struct RawTable {
    entries: [u64; ENTRIES],
}

impl RawTable {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [0; ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, i: usize) -> PageEntryBits {
        PageEntryBits::from(self.entries[i])
    }

    #[inline]
    pub fn set(&mut self, i: usize, e: PageEntryBits) {
        self.entries[i] = e.into();
    }
}

/// Read-only walker over a PML4-rooted hierarchy.
pub struct Amd64PageTables<'m, M: PhysMapper + ?Sized> {
    root: PhysicalPage,
    mapper: &'m M,
    /// Canonical VA range `[start, end)` not walked.
    skip: Option<(u64, u64)>,
}

impl<'m, M: PhysMapper + ?Sized> Amd64PageTables<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M, root: PhysicalPage) -> Self {
        Self {
            root,
            mapper,
            skip: None,
        }
    }

    /// Leave out every entry whose range lies inside `[start, end)`.
    #[must_use]
    pub const fn skipping(mut self, start: VirtualAddress, end: VirtualAddress) -> Self {
        if start.as_u64() < end.as_u64() {
            self.skip = Some((start.as_u64(), end.as_u64()));
        }
        self
    }

    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        self.root
    }

    /// Whether the `size`-byte range at (non-canonical) `va` is skipped.
    #[inline]
    fn skipped(&self, va: u64, size: u64) -> bool {
        let Some((start, end)) = self.skip else {
            return false;
        };
        let first = VirtualAddress::canonical(va).as_u64();
        first >= start && first + (size - 1) < end
    }

    #[inline]
    fn table(&self, page: PhysicalPage) -> &'m RawTable {
        // SAFETY: page-table frames are reachable through the mapper by contract.
        unsafe { self.mapper.phys_to_ref::<RawTable>(page.base()) }
    }

    fn walk_pdpt<E, F>(&self, page: PhysicalPage, va: u64, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(WalkEvent) -> Result<(), E>,
    {
        visit(WalkEvent::Table(page))?;
        let pdpt = self.table(page);
        for i3 in 0..ENTRIES {
            let e = pdpt.get(i3);
            if !e.present() {
                continue;
            }
            let va = va | ((i3 as u64) << 30);
            if self.skipped(va, SIZE_1G) {
                continue;
            }
            if e.large_page() {
                visit(WalkEvent::Leaf {
                    va: VirtualAddress::canonical(va),
                    pa: e.frame_base(SIZE_1G),
                    size: SIZE_1G,
                })?;
            } else {
                self.walk_pd(PhysicalPage::containing(e.physical_address()), va, visit)?;
            }
        }
        Ok(())
    }

    fn walk_pd<E, F>(&self, page: PhysicalPage, va: u64, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(WalkEvent) -> Result<(), E>,
    {
        visit(WalkEvent::Table(page))?;
        let pd = self.table(page);
        for i2 in 0..ENTRIES {
            let e = pd.get(i2);
            if !e.present() {
                continue;
            }
            let va = va | ((i2 as u64) << 21);
            if self.skipped(va, SIZE_2M) {
                continue;
            }
            if e.large_page() {
                visit(WalkEvent::Leaf {
                    va: VirtualAddress::canonical(va),
                    pa: e.frame_base(SIZE_2M),
                    size: SIZE_2M,
                })?;
            } else {
                self.walk_pt(PhysicalPage::containing(e.physical_address()), va, visit)?;
            }
        }
        Ok(())
    }

    fn walk_pt<E, F>(&self, page: PhysicalPage, va: u64, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(WalkEvent) -> Result<(), E>,
    {
        visit(WalkEvent::Table(page))?;
        let pt = self.table(page);
        for i1 in 0..ENTRIES {
            let e = pt.get(i1);
            let va = va | ((i1 as u64) << 12);
            if !e.present() || self.skipped(va, SIZE_4K) {
                continue;
            }
            visit(WalkEvent::Leaf {
                va: VirtualAddress::canonical(va),
                pa: e.frame_base(SIZE_4K),
                size: SIZE_4K,
            })?;
        }
        Ok(())
    }
}

impl<M: PhysMapper + ?Sized> PageTableWalk for Amd64PageTables<'_, M> {
    fn walk<E, F>(&self, mut visit: F) -> Result<(), E>
    where
        F: FnMut(WalkEvent) -> Result<(), E>,
    {
        visit(WalkEvent::Table(self.root))?;
        let pml4 = self.table(self.root);
        for i4 in KERNEL_PML4_FIRST..ENTRIES {
            let e = pml4.get(i4);
            if !e.present() {
                continue;
            }
            let va = (i4 as u64) << 39;
            if self.skipped(va, SIZE_512G) {
                continue;
            }
            self.walk_pdpt(PhysicalPage::containing(e.physical_address()), va, &mut visit)?;
        }
        Ok(())
    }
}

/// The x86-64 minidump format.
pub struct Amd64<'m, M: PhysMapper + ?Sized> {
    tables: Amd64PageTables<'m, M>,
    layout: KernelLayout,
}

impl<'m, M: PhysMapper + ?Sized> Amd64<'m, M> {
    /// Format for the hierarchy rooted at `root` (the CR3 frame). The
    /// direct map `layout.dmapbase..layout.dmapend` is not walked.
    #[must_use]
    pub const fn new(mapper: &'m M, root: PhysicalPage, layout: KernelLayout) -> Self {
        Self {
            tables: Amd64PageTables::new(mapper, root).skipping(layout.dmapbase, layout.dmapend),
            layout,
        }
    }

    #[must_use]
    pub const fn tables(&self) -> &Amd64PageTables<'m, M> {
        &self.tables
    }
}

impl<M: PhysMapper + ?Sized> PageTableWalk for Amd64<'_, M> {
    fn walk<E, F>(&self, visit: F) -> Result<(), E>
    where
        F: FnMut(WalkEvent) -> Result<(), E>,
    {
        self.tables.walk(visit)
    }
}

impl<M: PhysMapper + ?Sized> ArchDumpFormat for Amd64<'_, M> {
    const ARCH_NAME: &'static str = "amd64";
    const ARCH_VERSION: u32 = 2;
    const META_MAGIC: &'static str = "minidump amd64";
    const META_VERSION: u32 = 1;

    fn layout(&self) -> KernelLayout {
        self.layout
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    /// Physical memory made of individually boxed, page-aligned tables.
    #[derive(Default)]
    struct Frames(HashMap<u64, Box<RawTable>>);

    impl Frames {
        fn table(&mut self, pa: u64) -> &mut RawTable {
            self.0.entry(pa).or_insert_with(|| Box::new(RawTable::zeroed()))
        }
    }

    impl PhysMapper for Frames {
        unsafe fn phys_to_ref<'a, T>(&self, pa: PhysicalAddress) -> &'a T {
            let table: &RawTable = self.0.get(&pa.as_u64()).expect("unknown frame");
            unsafe { &*core::ptr::from_ref(table).cast::<T>() }
        }
    }

    fn link(pa: u64) -> PageEntryBits {
        PageEntryBits::new()
            .with_present(true)
            .with_writable(true)
            .with_physical_address(PhysicalAddress::new(pa))
    }

    #[test]
    fn entry_bits_roundtrip_address() {
        let e = link(0x0012_3456_7000).with_no_execute(true);
        assert_eq!(e.physical_address().as_u64(), 0x0012_3456_7000);
        assert!(e.present());
        assert!(e.no_execute());
        assert_eq!(u64::from(e) >> 63, 1);
    }

    #[test]
    fn walks_kernel_half_depth_first() {
        let mut mem = Frames::default();
        // PML4 @0x1000; kernel slot 511 → PDPT @0x2000; user slot 0 → PDPT @0x9000
        mem.table(0x1000).set(511, link(0x2000));
        mem.table(0x1000).set(0, link(0x9000));
        mem.table(0x9000).set(0, link(0xA000).with_large_page(true));
        // PDPT[510] → PD @0x3000, PDPT[0] → 1 GiB leaf at 0x4000_0000
        mem.table(0x2000).set(510, link(0x3000));
        mem.table(0x2000).set(0, link(0x4000_0000).with_large_page(true));
        // PD[0] → PT @0x4000, PD[1] → 2 MiB leaf at 0x60_0000 (PAT bit set)
        mem.table(0x3000).set(0, link(0x4000));
        mem.table(0x3000).set(1, link(0x60_1000).with_large_page(true));
        // PT[5] → 4 KiB at 0x7000
        mem.table(0x4000).set(5, link(0x7000));

        let walker = Amd64PageTables::new(&mem, PhysicalPage::from_index(1));
        let mut events = Vec::new();
        let res: Result<(), ()> = walker.walk(|e| {
            events.push(e);
            Ok(())
        });
        assert!(res.is_ok());

        let table = |pa: u64| WalkEvent::Table(PhysicalPage::containing(PhysicalAddress::new(pa)));
        assert_eq!(
            events,
            vec![
                table(0x1000),
                table(0x2000),
                WalkEvent::Leaf {
                    va: VirtualAddress::new(0xFFFF_FF80_0000_0000),
                    pa: PhysicalAddress::new(0x4000_0000),
                    size: SIZE_1G,
                },
                table(0x3000),
                table(0x4000),
                WalkEvent::Leaf {
                    va: VirtualAddress::new(0xFFFF_FFFF_8000_5000),
                    pa: PhysicalAddress::new(0x7000),
                    size: SIZE_4K,
                },
                WalkEvent::Leaf {
                    va: VirtualAddress::new(0xFFFF_FFFF_8020_0000),
                    pa: PhysicalAddress::new(0x60_0000),
                    size: SIZE_2M,
                },
            ]
        );
    }

    #[test]
    fn skips_direct_map_entries() {
        let mut mem = Frames::default();
        // HHDM_BASE is PML4 slot 273: one whole slot inside the direct map
        mem.table(0x1000).set(273, link(0x2000));
        mem.table(0x2000).set(0, link(0x0).with_large_page(true));
        // slot 511 partly overlaps: PDPT entry 0 is skipped, 510 is not
        mem.table(0x1000).set(511, link(0x3000));
        mem.table(0x3000).set(0, link(0x4000_0000).with_large_page(true));
        mem.table(0x3000).set(510, link(0x8000_0000).with_large_page(true));

        let walker = Amd64PageTables::new(&mem, PhysicalPage::from_index(1)).skipping(
            VirtualAddress::new(HHDM_BASE),
            VirtualAddress::new(0xFFFF_FF80_4000_0000),
        );
        let mut events = Vec::new();
        let res: Result<(), ()> = walker.walk(|e| {
            events.push(e);
            Ok(())
        });
        assert!(res.is_ok());

        let table = |pa: u64| WalkEvent::Table(PhysicalPage::containing(PhysicalAddress::new(pa)));
        assert_eq!(
            events,
            vec![
                table(0x1000),
                table(0x3000),
                WalkEvent::Leaf {
                    va: VirtualAddress::new(0xFFFF_FFFF_8000_0000),
                    pa: PhysicalAddress::new(0x8000_0000),
                    size: SIZE_1G,
                },
            ]
        );
    }

    #[test]
    fn visitor_error_stops_walk() {
        let mut mem = Frames::default();
        mem.table(0x1000).set(300, link(0x2000));
        mem.table(0x2000);

        let walker = Amd64PageTables::new(&mem, PhysicalPage::from_index(1));
        let mut seen = 0;
        let res = walker.walk(|_| {
            seen += 1;
            if seen == 2 { Err("stop") } else { Ok(()) }
        });
        assert_eq!(res, Err("stop"));
        assert_eq!(seen, 2);
    }

    #[test]
    fn format_metadata_uses_layout() {
        let mut mem = Frames::default();
        mem.table(0x1000);
        let arch = Amd64::new(&mem, PhysicalPage::from_index(1), DEFAULT_LAYOUT);
        let meta = arch.metadata(&crate::meta::SectionSizes {
            msgbuf: 10,
            dumpavail: 32,
            bitmap: 64,
            pmap: 4096,
        });
        assert!(meta.has_magic("minidump amd64"));
        assert_eq!(meta.dmapbase, HHDM_BASE);
        assert_eq!(meta.pmap_size, 4096);
        assert_eq!(meta.bitmap_size, 64);
    }
}
