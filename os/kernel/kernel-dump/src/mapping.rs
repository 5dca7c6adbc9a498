//! # Physical Memory Access
//!
//! The dump path needs to read physical memory in two ways:
//!
//! - **Page-table frames** during the walk. The kernel reaches them through
//!   its direct map, so [`PhysMapper`] simply converts a physical address into
//!   a reference (HHDM style: `HHDM_BASE + pa`).
//! - **Arbitrary dumped pages**, which may lie outside any permanent mapping.
//!   These are entered one at a time into a reserved scratch window through
//!   [`ScratchMapper`]; [`ScratchMapping`] scopes that window so it is torn
//!   down on every exit path, including early returns on error.

use crate::PAGE_SIZE;
use crate::addresses::{PhysicalAddress, PhysicalPage};
use core::ops::Deref;
use core::ptr::NonNull;

/// Converts physical addresses of page-table frames into usable references.
pub trait PhysMapper {
    /// Borrow the object of type `T` stored at physical address `pa`.
    ///
    /// # Safety
    /// - `pa` must be mapped in the current address space for reads.
    /// - `T` must match the bytes at `pa` and be suitably aligned.
    /// - The mapping must outlive `'a`.
    unsafe fn phys_to_ref<'a, T>(&self, pa: PhysicalAddress) -> &'a T;
}

/// A single reserved virtual window for one physical page.
///
/// # Safety
/// Implementors guarantee that the pointer returned by
/// [`enter`](Self::enter) is valid for reads of [`PAGE_SIZE`] bytes showing
/// the contents of `page`, until the next call to `enter` or
/// [`leave`](Self::leave). No allocation may happen in either method.
pub unsafe trait ScratchMapper {
    /// Map `page` at the scratch window, replacing any previous temporary mapping.
    fn enter(&mut self, page: PhysicalPage) -> NonNull<[u8; PAGE_SIZE]>;

    /// Remove the temporary mapping.
    fn leave(&mut self);
}

/// Scoped view of one physical page through a [`ScratchMapper`].
pub struct ScratchMapping<'m, M: ScratchMapper + ?Sized> {
    mapper: &'m mut M,
    window: NonNull<[u8; PAGE_SIZE]>,
    page: PhysicalPage,
}

impl<'m, M: ScratchMapper + ?Sized> ScratchMapping<'m, M> {
    /// Enter `page` into the scratch window for the lifetime of the guard.
    pub fn map(mapper: &'m mut M, page: PhysicalPage) -> Self {
        let window = mapper.enter(page);
        Self {
            mapper,
            window,
            page,
        }
    }

    #[must_use]
    pub const fn page(&self) -> PhysicalPage {
        self.page
    }
}

impl<M: ScratchMapper + ?Sized> Deref for ScratchMapping<'_, M> {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        // SAFETY: the window stays valid until `leave`, which only runs in `drop`.
        unsafe { self.window.as_ref() }
    }
}

impl<M: ScratchMapper + ?Sized> Drop for ScratchMapping<'_, M> {
    fn drop(&mut self) {
        self.mapper.leave();
    }
}
