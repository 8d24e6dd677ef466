use crate::{PAGE_OFFSET_MASK, PAGE_SHIFT, PageOffset, PhysicalAddress};
use core::fmt;

/// A 4 KiB physical frame, identified by its page-aligned base.
///
/// ### Invariants
/// - The low [`PAGE_SHIFT`] bits of the base are always zero.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let frame = PhysicalPage::from_index(3);
/// assert_eq!(frame.base(), PhysicalAddress::new(0x3000));
/// assert_eq!(PhysicalPage::containing(PhysicalAddress::new(0x3FFF)), frame);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u32);

impl PhysicalPage {
    /// Frame that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.as_u32() & !PAGE_OFFSET_MASK)
    }

    /// Create from an address that must already be aligned.
    /// Panics in debug if unaligned.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: PhysicalAddress) -> Self {
        debug_assert!(addr.is_page_aligned(), "unaligned frame address");
        Self::containing(addr)
    }

    /// The frame with the given index (`address / PAGE_SIZE`).
    #[inline]
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn frame_index(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: PageOffset) -> PhysicalAddress {
        PhysicalAddress::new(self.0 | off.as_u32())
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/4K", self.0)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(0x{:08X})", self.0)
    }
}
