//! # Memory Page Table

pub mod pd;
pub mod pt;

use crate::page_table::pd::PdIndex;
use crate::page_table::pt::PtIndex;
use kernel_memory_addresses::VirtualAddress;

/// Number of entries in a page directory or page table.
pub const ENTRIES: usize = 1024;

/// Bytes of virtual address space covered by one directory entry.
pub const BYTES_PER_TABLE: u32 = 4 * 1024 * 1024;

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (PdIndex, PtIndex) {
    (PdIndex::from(va), PtIndex::from(va))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_ok() {
        let va = VirtualAddress::new(0xC040_1234);
        let (pd, pt) = split_indices(va);
        assert_eq!(pd.as_usize(), 0x301);
        assert_eq!(pt.as_usize(), 0x001);
    }

    #[test]
    fn last_page_indices() {
        let (pd, pt) = split_indices(VirtualAddress::new(0xFFFF_FFFF));
        assert_eq!(pd.as_usize(), ENTRIES - 1);
        assert_eq!(pt.as_usize(), ENTRIES - 1);
    }
}
