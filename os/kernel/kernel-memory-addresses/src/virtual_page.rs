use crate::{PAGE_OFFSET_MASK, PAGE_SIZE, PageOffset, VirtualAddress};
use core::fmt;

/// A 4 KiB virtual page, identified by its page-aligned base.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let vp = VirtualPage::containing(VirtualAddress::new(0xC040_0FFF));
/// assert_eq!(vp.base().as_u32(), 0xC040_0000);
/// assert_eq!(vp.next().map(VirtualPage::base), Some(VirtualAddress::new(0xC040_1000)));
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u32);

impl VirtualPage {
    /// Page that contains `addr` (aligns down to page boundary).
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self(addr.as_u32() & !PAGE_OFFSET_MASK)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: PageOffset) -> VirtualAddress {
        VirtualAddress::new(self.0 | off.as_u32())
    }

    /// The page directly after this one, `None` at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(PAGE_SIZE) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/4K", self.0)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage(0x{:08X})", self.0)
    }
}
