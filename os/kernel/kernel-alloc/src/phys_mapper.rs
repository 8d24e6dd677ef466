//! # Identity-window PhysMapper
//!
//! The kernel identity-maps the first 4 MiB of physical memory before
//! paging is switched on, so any physical address inside that window is
//! also a valid virtual address, before and after activation. Page
//! directories, page tables and the frame bitmap are reached this way.
//!
//! Frames above the window are not reachable through this mapper, so page
//! tables are never placed there.

use kernel_info::memory::IDENTITY_MAP_BYTES;
use kernel_vmem::PhysMapper;
use kernel_vmem::addresses::PhysicalAddress;

/// [`PhysMapper`] for the identity-mapped low window.
///
/// # Safety
/// - The window must be mapped 1:1 (or paging must be off).
/// - Callers only hand in addresses of memory they own.
#[derive(Debug, Default, Copy, Clone)]
pub struct IdentityPhysMapper;

impl IdentityPhysMapper {
    /// Whether `pa` lies in the identity window.
    #[must_use]
    pub const fn covers(pa: PhysicalAddress) -> bool {
        pa.as_u32() < IDENTITY_MAP_BYTES
    }
}

impl PhysMapper for IdentityPhysMapper {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        debug_assert!(Self::covers(pa), "{pa} outside the identity window");
        pa.as_u32() as usize as *mut u8
    }

    fn reaches(&self, pa: PhysicalAddress) -> bool {
        Self::covers(pa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_bounds() {
        assert!(IdentityPhysMapper::covers(PhysicalAddress::new(0)));
        assert!(IdentityPhysMapper::covers(PhysicalAddress::new(0x3F_FFFF)));
        assert!(!IdentityPhysMapper::covers(PhysicalAddress::new(0x40_0000)));
    }

    #[test]
    fn only_the_window_is_reachable() {
        assert!(IdentityPhysMapper.reaches(PhysicalAddress::new(0x11_3000)));
        assert!(!IdentityPhysMapper.reaches(PhysicalAddress::new(0x51_6000)));
    }

    #[test]
    fn pointer_is_the_address() {
        let p = IdentityPhysMapper.phys_to_ptr(PhysicalAddress::new(0x1000));
        assert_eq!(p as usize, 0x1000);
    }
}
