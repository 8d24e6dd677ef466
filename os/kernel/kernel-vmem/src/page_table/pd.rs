//! # x86 Page Directory (PD)
//!
//! The upper paging level; CR3 points here.
//!
//! - [`PdIndex`]: index type for VA bits `[31:22]`.
//! - [`PdEntry`]: a PD entry (PDE); a present entry points to a [`PageTable`](super::pt::PageTable).
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 PDEs.
//!
//! 4 MiB pages (`PS=1`) are never created here; every present PDE is a
//! table link.

use crate::page_table::ENTRIES;
use crate::{PageEntryBits, PageFlags};
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PdIndex(u16);

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// The Page Directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES],
}

impl PdIndex {
    /// Build an index from a virtual address (extracts bits `[31:22]`).
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(va.directory_index())
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> PageEntryBits {
        self.0
    }

    /// If present, the frame holding the next-level page table.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage> {
        if !self.is_present() {
            return None;
        }
        Some(self.0.frame_page())
    }

    /// Link to the page table in `table`.
    ///
    /// A table link is always present and writable; only the user bit is
    /// taken from `flags`, so user mappings stay reachable from ring 3 while
    /// the leaf entry alone decides read/write permission.
    #[inline]
    #[must_use]
    pub const fn make_table_link(table: PhysicalPage, flags: PageFlags) -> Self {
        let link = PageFlags::KERNEL_RW.union(flags.intersection(PageFlags::USER));
        Self(PageEntryBits::from_flags(link).with_frame_page(table))
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES],
        }
    }

    /// Clear every entry in place.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: PdIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: PdIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Number of page tables linked from this directory.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn table_link_is_present_and_writable() {
        let e = PdEntry::make_table_link(PhysicalPage::from_index(7), PageFlags::PRESENT);
        assert_eq!(e.raw(), 0x7003);
        assert_eq!(e.next_table(), Some(PhysicalPage::from_index(7)));
    }

    #[test]
    fn table_link_inherits_only_user() {
        let e = PdEntry::make_table_link(
            PhysicalPage::from_index(1),
            PageFlags::PRESENT | PageFlags::USER | PageFlags::CACHE_DISABLE,
        );
        assert_eq!(e.raw(), 0x1007);
    }
}
