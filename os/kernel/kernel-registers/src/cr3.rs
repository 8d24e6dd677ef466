#[cfg(all(feature = "asm", target_arch = "x86"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PAGE_SHIFT, PhysicalPage};

/// CR3: Page-Directory Base Register (32-bit paging, no PAE).
///
/// Holds the physical base of the page directory and the cache-control
/// flags used when the processor reads it.
#[bitfield(u32)]
pub struct Cr3 {
    /// Bits 0–2: Reserved (must be 0).
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3: PWT: Page-level Write-Through for the page directory.
    pub pwt: bool,

    /// Bit 4: PCD: Page-level Cache Disable for the page directory.
    pub pcd: bool,

    /// Bits 5–11: Reserved (must be 0 when written).
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–31: page directory physical base >> 12.
    #[bits(20)]
    directory_base_4k: u32,
}

impl Cr3 {
    /// Create a `Cr3` value pointing at the page directory in `frame`.
    #[must_use]
    pub const fn from_directory(frame: PhysicalPage, pwt: bool, pcd: bool) -> Self {
        Self::new()
            .with_pwt(pwt)
            .with_pcd(pcd)
            .with_directory_base_4k(frame.frame_index())
    }

    /// The frame holding the page directory.
    #[must_use]
    pub const fn directory(&self) -> PhysicalPage {
        PhysicalPage::from_index(self.directory_base_4k())
    }

    /// The page directory base as it appears in the raw register.
    #[must_use]
    pub const fn directory_bits(&self) -> u32 {
        self.directory_base_4k() << PAGE_SHIFT
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u32;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn directory_round_trip() {
        let frame = PhysicalPage::containing(PhysicalAddress::new(0x0012_3000));
        let cr3 = Cr3::from_directory(frame, false, false);
        assert_eq!(cr3.into_bits(), 0x0012_3000);
        assert_eq!(cr3.directory(), frame);
    }

    #[test]
    fn cache_flags_live_in_low_bits() {
        let frame = PhysicalPage::from_index(1);
        let cr3 = Cr3::from_directory(frame, true, true);
        assert_eq!(cr3.into_bits(), 0x1000 | 0x8 | 0x10);
        assert_eq!(cr3.directory_bits(), 0x1000);
    }
}
