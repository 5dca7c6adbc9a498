//! # Kernel Page-Table Walk
//!
//! Architecture-neutral view of "everything the kernel has mapped". A walker
//! reports every page-table page it reads and every valid leaf mapping; the
//! [scanner](crate::scan) turns that stream into the dump bitmap and the
//! dump driver later replays it to write the page-table pages themselves.

use crate::addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};

/// One step of a page-table walk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WalkEvent {
    /// A page-table page (any level) reached by the walk.
    Table(PhysicalPage),
    /// A valid leaf mapping of `size` bytes at `va → pa`.
    Leaf {
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: u64,
    },
}

/// Enumerates the kernel's valid mappings.
///
/// Two walks over an unchanged address space must report the same events in
/// the same order.
pub trait PageTableWalk {
    /// Call `visit` for every event; stop at the first error and return it.
    ///
    /// # Errors
    /// Whatever `visit` returns.
    fn walk<E, F>(&self, visit: F) -> Result<(), E>
    where
        F: FnMut(WalkEvent) -> Result<(), E>;
}
