//! # Physical and Virtual Addresses
//!
//! Thin `u64` wrappers that keep physical and virtual addresses apart in the
//! dump path. The bitmap, the device writer and the page-table walk all talk
//! in [`PhysicalAddress`] / [`PhysicalPage`]; only the walk reports the
//! [`VirtualAddress`] of a mapping.
//!
//! ```rust
//! # use kernel_dump::addresses::*;
//! let pa = PhysicalAddress::new(0x5123);
//! let page = PhysicalPage::containing(pa);
//! assert_eq!(page.base().as_u64(), 0x5000);
//! assert_eq!(page.index(), 5);
//! assert_eq!(round_page(100), 4096);
//! ```

use crate::{PAGE_SHIFT, PAGE_SIZE};
use core::fmt;
use core::ops::{Add, AddAssign};

/// Round `x` up to the next page boundary.
#[inline]
#[must_use]
pub const fn round_page(x: u64) -> u64 {
    (x + (PAGE_SIZE as u64 - 1)) & !(PAGE_SIZE as u64 - 1)
}

/// Round `x` down to its page boundary.
#[inline]
#[must_use]
pub const fn trunc_page(x: u64) -> u64 {
    x & !(PAGE_SIZE as u64 - 1)
}

/// Whether `x` lies on a page boundary.
#[inline]
#[must_use]
pub const fn is_page_aligned(x: u64) -> bool {
    x & (PAGE_SIZE as u64 - 1) == 0
}

/// Physical memory address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

/// Virtual memory address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

/// Base address of a 4 KiB physical page.
///
/// The low [`PAGE_SHIFT`] bits are always clear.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(PhysicalAddress);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Offset of this address inside its page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE as u64 - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        is_page_aligned(self.0)
    }
}

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Sign-extend bit 47 into the upper bits (x86-64 canonical form).
    #[inline]
    #[must_use]
    pub const fn canonical(v: u64) -> Self {
        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        let v = (((v << 16) as i64) >> 16) as u64;
        Self(v)
    }
}

impl PhysicalPage {
    /// The page that contains `pa`.
    #[inline]
    #[must_use]
    pub const fn containing(pa: PhysicalAddress) -> Self {
        Self(PhysicalAddress(trunc_page(pa.0)))
    }

    /// The page with page frame number `pfn`.
    #[inline]
    #[must_use]
    pub const fn from_index(pfn: u64) -> Self {
        Self(PhysicalAddress(pfn << PAGE_SHIFT))
    }

    /// Page frame number, i.e. the bitmap index of this page.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u64 {
        self.0.0 >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.0
    }

    /// The page directly above this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(PhysicalAddress(self.0.0 + PAGE_SIZE as u64))
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(0x{:016X})", self.0.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<PhysicalPage> for PhysicalAddress {
    #[inline]
    fn from(value: PhysicalPage) -> Self {
        value.base()
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}
