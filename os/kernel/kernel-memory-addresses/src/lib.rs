//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the 32-bit addresses used by the paging and
//! memory management code of a protected-mode x86 kernel.
//!
//! ## Overview
//!
//! The processor runs with 4 KiB pages and a two-level translation
//! (page directory, page table). Every address is a `u32`; these types only
//! carry the *kind* of address so a virtual address can never be handed to
//! code expecting a physical one.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`VirtualAddress`] / [`VirtualPage`] | Refer to paged (translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage`] | Refer to RAM as seen by the bus. |
//! | [`PageOffset`] | The low 12 bits of either, `0..PAGE_SIZE`. |
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC040_1234);
//! let (page, off) = va.split();
//! assert_eq!(page.base().as_u32(), 0xC040_1000);
//! assert_eq!(off.as_u32(), 0x234);
//! assert_eq!(page.join(off), va);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

use core::fmt;

pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Size of a page or frame in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the in-page offset bits.
pub const PAGE_OFFSET_MASK: u32 = PAGE_SIZE - 1;

/// Align `x` down to a multiple of `align` (a power of two).
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1234, 0x1000), 0x1000);
/// assert_eq!(align_down(0x1000, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Align `x` up to a multiple of `align` (a power of two), saturating at the
/// highest aligned `u32`.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0x1001, 0x1000), 0x2000);
/// assert_eq!(align_up(0x1000, 0x1000), 0x1000);
/// assert_eq!(align_up(5, 4), 8);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    match x.checked_add(align - 1) {
        Some(v) => v & !(align - 1),
        None => u32::MAX & !(align - 1),
    }
}

/// Number of whole pages needed to hold `bytes`.
///
/// ```rust
/// # use kernel_memory_addresses::pages_for;
/// assert_eq!(pages_for(0), 0);
/// assert_eq!(pages_for(1), 1);
/// assert_eq!(pages_for(4096), 1);
/// assert_eq!(pages_for(4097), 2);
/// ```
#[inline]
#[must_use]
pub const fn pages_for(bytes: u32) -> u32 {
    bytes.div_ceil(PAGE_SIZE)
}

/// The offset within a 4 KiB page (`0..PAGE_SIZE`).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageOffset(u32);

impl PageOffset {
    /// Create from a raw value, asserting it is `< PAGE_SIZE` in debug.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        debug_assert!(value < PAGE_SIZE, "offset must be < page size");
        Self(value & PAGE_OFFSET_MASK)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset({:#05X})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_virtual() {
        let va = VirtualAddress::new(0x0050_0ABC);
        let (p, o) = va.split();
        assert_eq!(p.base().as_u32(), 0x0050_0000);
        assert_eq!(o.as_u32(), 0xABC);
        assert_eq!(p.join(o), va);
    }

    #[test]
    fn split_and_join_physical() {
        let pa = PhysicalAddress::new(0x0010_0042);
        let (p, o) = pa.split();
        assert_eq!(p.base().as_u32(), 0x0010_0000);
        assert_eq!(p.frame_index(), 0x100);
        assert_eq!(o.as_u32(), 0x42);
        assert_eq!(p.join(o), pa);
    }

    #[test]
    fn frames_by_index() {
        let p = PhysicalPage::from_index(256);
        assert_eq!(p.base().as_u32(), 0x0010_0000);
        assert_eq!(p.frame_index(), 256);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x12345, PAGE_SIZE), 0x12000);
        assert_eq!(align_up(0x12345, PAGE_SIZE), 0x13000);
        assert_eq!(align_up(u32::MAX, PAGE_SIZE), 0xFFFF_F000);
        assert!(VirtualAddress::new(0x2000).is_page_aligned());
        assert!(!PhysicalAddress::new(0x2001).is_page_aligned());
    }

    #[test]
    fn checked_offsets() {
        let va = VirtualAddress::new(0xFFFF_F000);
        assert_eq!(va.checked_add(0xFFF), Some(VirtualAddress::new(0xFFFF_FFFF)));
        assert_eq!(va.checked_add(0x1000), None);
    }
}
