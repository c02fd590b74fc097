//! # Physical Memory Address Types
//!
//! Strongly typed wrappers for the physical addresses handed around by the
//! page allocator and by DMA-capable device drivers.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`PhysicalAddress`] | A raw 64-bit physical address (RAM or MMIO). |
//! | [`PhysMapper`] | Translates between physical addresses and kernel pointers. |
//!
//! Physical memory can't be dereferenced directly; code that wants to touch a
//! page (the allocator writing its free-list links, a driver handing buffer
//! addresses to a device) goes through a [`PhysMapper`]. The mapping strategy
//! is injected: the kernel uses an offset (direct) map, host-side tests use an
//! identity map over memory they allocated themselves.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0010_2042);
//! assert_eq!(pa.align_down().as_u64(), 0x0010_2000);
//! assert!(!pa.is_page_aligned());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

use core::fmt;
use core::ops::{Add, AddAssign};

/// Size of a physical page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// [`PAGE_SIZE`] as `usize`, for slice lengths and pointer arithmetic.
#[allow(clippy::cast_possible_truncation)]
pub const PAGE_SIZE_BYTES: usize = PAGE_SIZE as usize;

const _: () = assert!(PAGE_SIZE.is_power_of_two());

/// A raw physical address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
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

    /// Low 32 bits, as programmed into `*_BAL` style device registers.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn low_u32(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits, as programmed into `*_BAH` style device registers.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn high_u32(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns `true` if the address sits on a page boundary.
    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// Returns `true` if the address is a multiple of `align` (a power of two).
    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Round up to the next page boundary, or `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn checked_align_up(self) -> Option<Self> {
        match self.0.checked_add(PAGE_SIZE - 1) {
            Some(v) => Some(Self(v & !(PAGE_SIZE - 1))),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
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

/// Translation between physical addresses and pointers in the current
/// address space.
///
/// Loader and tests: often identity. Kernel: a fixed offset (direct map).
///
/// # Safety
/// Implementations must return pointers that alias exactly the physical
/// memory named by the address, and `virt_to_phys` must be the inverse of
/// `phys_to_ptr` for every address the kernel hands to a device.
pub unsafe trait PhysMapper {
    /// Pointer through which the kernel can access `pa`.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Physical address backing the kernel pointer `ptr` (used for DMA).
    fn virt_to_phys(&self, ptr: *const u8) -> PhysicalAddress;
}

unsafe impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (**self).phys_to_ptr(pa)
    }

    #[inline]
    fn virt_to_phys(&self, ptr: *const u8) -> PhysicalAddress {
        (**self).virt_to_phys(ptr)
    }
}

/// Physical addresses are usable as pointers as-is.
#[derive(Debug, Default, Copy, Clone)]
pub struct IdentityMapper;

unsafe impl PhysMapper for IdentityMapper {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(pa_to_usize(pa))
    }

    #[inline]
    fn virt_to_phys(&self, ptr: *const u8) -> PhysicalAddress {
        PhysicalAddress::new(ptr.expose_provenance() as u64)
    }
}

/// All of physical memory is mapped at `offset` (a higher-half direct map).
#[derive(Debug, Copy, Clone)]
pub struct OffsetMapper {
    offset: u64,
}

impl OffsetMapper {
    /// # Safety
    /// Every physical address the mapper is asked about must be mapped at
    /// `offset + pa` for as long as the mapper is in use.
    #[must_use]
    pub const unsafe fn new(offset: u64) -> Self {
        Self { offset }
    }
}

unsafe impl PhysMapper for OffsetMapper {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let va = PhysicalAddress::new(self.offset.wrapping_add(pa.as_u64()));
        core::ptr::with_exposed_provenance_mut(pa_to_usize(va))
    }

    #[inline]
    fn virt_to_phys(&self, ptr: *const u8) -> PhysicalAddress {
        let va = ptr.expose_provenance() as u64;
        debug_assert!(va >= self.offset, "pointer below the direct map");
        PhysicalAddress::new(va.wrapping_sub(self.offset))
    }
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn pa_to_usize(pa: PhysicalAddress) -> usize {
    pa.as_u64() as usize
}
