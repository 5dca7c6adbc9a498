//! # Bitmap Scan
//!
//! Rebuilds the dump bitmap from the live page tables right before a dump
//! attempt. The bitmap starts out as a copy of the runtime set the kernel
//! maintained while running (empty without one). A page is then added when
//! it is mapped by the kernel (or sits below the first allocatable address,
//! where the kernel image and early boot allocations live) *and* the oracle
//! says it may be dumped. Seeded pages are checked against the oracle when
//! the dump is sized.

use crate::PAGE_SIZE;
use crate::addresses::{PhysicalAddress, PhysicalPage};
use crate::avail::DumpOracle;
use crate::bitmap::PageBitmap;
use crate::walk::{PageTableWalk, WalkEvent};
use core::convert::Infallible;
use log::trace;

/// Outcome of [`scan`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanResult {
    /// Page-table pages visited by the walk.
    pub table_pages: u64,
    /// Bytes of the page-table section, `table_pages * PAGE_SIZE`.
    pub pmap_size: u64,
    /// Pages set in the bitmap after the scan.
    pub pages: u64,
}

/// Reset `bitmap` to `runtime` and add the kernel mappings reported by `walker`.
///
/// `first_avail` is the lowest address handed to the page allocator; every
/// dumpable page below it is included whether mapped or not.
pub fn scan<W, O>(
    walker: &W,
    oracle: &O,
    first_avail: PhysicalAddress,
    runtime: Option<&PageBitmap<'_>>,
    bitmap: &mut PageBitmap<'_>,
) -> ScanResult
where
    W: PageTableWalk + ?Sized,
    O: DumpOracle + ?Sized,
{
    match runtime {
        Some(set) => bitmap.copy_from(set),
        None => bitmap.clear_all(),
    }

    let mut table_pages = 0u64;
    let Ok(()) = walker.walk(|event| -> Result<(), Infallible> {
        match event {
            WalkEvent::Table(_) => table_pages += 1,
            WalkEvent::Leaf { pa, size, .. } => {
                let mut page = PhysicalPage::containing(pa);
                for _ in 0..size.div_ceil(PAGE_SIZE as u64) {
                    if oracle.is_dumpable(page.base()) {
                        bitmap.add_page(page.base());
                    } else {
                        bitmap.drop_page(page.base());
                    }
                    page = page.next();
                }
            }
        }
        Ok(())
    });

    let mut page = PhysicalPage::from_index(0);
    while page.base() < first_avail {
        if oracle.is_dumpable(page.base()) {
            bitmap.add_page(page.base());
        }
        page = page.next();
    }

    let result = ScanResult {
        table_pages,
        pmap_size: table_pages * PAGE_SIZE as u64,
        pages: bitmap.count(),
    };
    trace!("bitmap scan: {result:?}");
    result
}
