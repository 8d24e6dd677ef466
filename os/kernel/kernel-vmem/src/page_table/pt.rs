//! # x86 Page Table (PT)
//!
//! This module models the lower paging level.
//!
//! - [`PtIndex`]: index type for VA bits `[21:12]`.
//! - [`PtEntry`]: a PT entry (PTE); every present entry maps one 4 KiB page.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 PTEs.
//!
//! ## Invariants & Notes
//!
//! - [`PageTable`] is 4 KiB-aligned and contains exactly 1024 entries.
//! - [`PtEntry::make_4k`] writes the caller's flags verbatim and forces `PAT=0`.
//! - After modifying active mappings, the caller must perform any required TLB maintenance.

use crate::page_table::ENTRIES;
use crate::{PageEntryBits, PageFlags};
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};

/// Index into the Page Table (derived from VA bits `[21:12]`).
///
/// Range is `0..1024` (checked in debug builds).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PtIndex(u16);

/// A single Page Table entry (PTE).
#[doc(alias = "PTE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PtEntry(PageEntryBits);

/// The Page Table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; ENTRIES],
}

impl PtIndex {
    /// Build an index from a virtual address (extracts bits `[21:12]`).
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(va.table_index())
    }

    /// Construct from a raw `u16`.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
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

impl PtEntry {
    /// Create a zero (non-present) entry.
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

    /// Expose the underlying bitfield.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> PageEntryBits {
        self.0
    }

    /// If present, return the mapped 4 KiB frame and its flags.
    #[inline]
    #[must_use]
    pub const fn page_4k(self) -> Option<(PhysicalPage, PageFlags)> {
        if !self.is_present() {
            return None;
        }
        Some((self.0.frame_page(), self.0.flags()))
    }

    /// Create a 4 KiB leaf PTE mapping `page` with `flags`.
    ///
    /// The flags are written as given; without [`PageFlags::PRESENT`] the
    /// entry records the frame but does not translate.
    #[inline]
    #[must_use]
    pub const fn make_4k(page: PhysicalPage, flags: PageFlags) -> Self {
        Self(
            PageEntryBits::from_flags(flags)
                .with_large_page(false)
                .with_frame_page(page),
        )
    }

    /// Return the raw 32-bit value (flags + address).
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }
}

impl PageTable {
    /// Create a fully zeroed Page Table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::zero(); ENTRIES],
        }
    }

    /// Clear every entry in place.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PtEntry::zero());
    }

    /// Read the entry at `i`.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: PtIndex) -> PtEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: PtIndex, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn pte_4k_leaf() {
        let page = PhysicalPage::containing(PhysicalAddress::new(0x5555_0000));
        let e = PtEntry::make_4k(page, PageFlags::PRESENT | PageFlags::USER);
        let (p, fl) = e.page_4k().unwrap();
        assert_eq!(p.base().as_u32(), 0x5555_0000);
        assert!(fl.contains(PageFlags::PRESENT | PageFlags::USER));
        assert!(!fl.contains(PageFlags::WRITABLE));
        assert_eq!(e.raw(), 0x5555_0005);
    }

    #[test]
    fn entry_without_present_does_not_translate() {
        let e = PtEntry::make_4k(PhysicalPage::from_index(9), PageFlags::WRITABLE);
        assert!(e.page_4k().is_none());
        assert_eq!(e.raw(), 0x9002);
    }

    #[test]
    fn zero_entry_is_not_a_page() {
        assert!(PtEntry::zero().page_4k().is_none());
        assert_eq!(core::mem::size_of::<PageTable>(), 4096);
    }
}
