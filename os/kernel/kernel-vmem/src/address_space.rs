//! # Address Space (x86, page-directory-rooted)
//!
//! Strongly-typed helpers to build and manipulate the kernel's **single**
//! virtual address space.
//!
//! ## Highlights
//!
//! - [`AddressSpace::map`] installs one 4 KiB mapping, creating the page
//!   table for its 4 MiB region on first use.
//! - [`AddressSpace::reserve_tables`] creates the page tables for a whole
//!   range up front, while frames the [`PhysMapper`] reaches are still free.
//! - [`AddressSpace::unmap`] clears a single PTE.
//! - [`AddressSpace::translate`] resolves a VA to a PA (including the in-page offset).
//! - [`AddressSpace::activate`] loads CR3 with this space's directory and turns on paging.
//!
//! ## Design
//!
//! - Directory entries are always present + writable (plus user, if the
//!   first mapping in that region asked for it); leaf flags come from the
//!   mapping call.
//! - Page tables are only reclaimed by [`AddressSpace::release_tables`].
//! - A new page table must sit in a frame the [`PhysMapper`] reaches;
//!   otherwise the mapping fails with [`MapError::UnreachableTable`].
//! - Keeps `unsafe` confined to mapping a physical frame to a typed table
//!   through the [`PhysMapper`].
//!
//! ## Safety
//!
//! - Every change to a leaf entry is followed by `invlpg` for that page.
//! - The provided [`PhysMapper`] must yield **writable** references to table frames.

use crate::page_table::pd::{PageDirectory, PdEntry};
use crate::page_table::pt::{PageTable, PtEntry};
use crate::page_table::split_indices;
use crate::{FrameAlloc, PageFlags, PhysMapper, PhysMapperExt, invalidate_tlb_page};
use core::fmt;
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, align_down, align_up,
};
use log::trace;

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage, // page directory frame
    mapper: &'m M,
}

/// The page directory frame for an [`AddressSpace`].
pub type RootPage = PhysicalPage;

/// Bytes of virtual address space covered by one page table.
pub const TABLE_REGION_SIZE: u32 = 0x40_0000;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// No frame was available for the page table covering the address.
    #[error("out of memory allocating a page table for {0}")]
    OutOfMemory(VirtualAddress),
    /// The only free frame for the page table covering the address lies
    /// outside what the [`PhysMapper`] can reach.
    #[error("page table for {va} would sit in unreachable frame {frame}")]
    UnreachableTable {
        va: VirtualAddress,
        frame: PhysicalAddress,
    },
}

/// Start of every 4 MiB region overlapping `[start, start + bytes)`.
fn regions(start: VirtualAddress, bytes: u32) -> impl Iterator<Item = VirtualAddress> {
    let first = u64::from(align_down(start.as_u32(), TABLE_REGION_SIZE));
    let end = u64::from(start.as_u32()) + u64::from(bytes);
    (first..end)
        .step_by(TABLE_REGION_SIZE as usize)
        .map_while(|addr| u32::try_from(addr).ok())
        .map(VirtualAddress::new)
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate and zero a fresh page directory.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is available for the directory.
    pub fn new<A: FrameAlloc>(mapper: &'m M, alloc: &mut A) -> Result<Self, MapError> {
        let root = alloc
            .alloc_4k()
            .ok_or(MapError::OutOfMemory(VirtualAddress::zero()))?;
        let space = Self { root, mapper };
        space.pd_mut().zero();
        Ok(space)
    }

    /// Physical page of the page directory.
    #[inline]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    /// Load CR3 with this address space's directory, then set CR0.PG.
    ///
    /// A no-op when not building for an `x86` target with the `asm` feature.
    ///
    /// # Safety
    /// Must run at CPL0. The code performing the switch, its stack, and every
    /// structure touched right afterwards must already be mapped (typically
    /// through [`identity_map`](Self::identity_map)).
    #[inline]
    pub unsafe fn activate(&self) {
        #[cfg(all(feature = "asm", target_arch = "x86"))]
        unsafe {
            use kernel_registers::cr0::Cr0;
            use kernel_registers::cr3::Cr3;
            use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

            Cr3::from_directory(self.root, false, false).store_unsafe();
            Cr0::load_unsafe().with_pg_paging(true).store_unsafe();
        }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn pd_mut(&self) -> &mut PageDirectory {
        // SAFETY: the root frame holds this space's directory.
        unsafe { self.mapper.pd_mut(self.root) }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn pt_mut(&self, page: PhysicalPage) -> &mut PageTable {
        // SAFETY: `page` came from a present directory entry of this space.
        unsafe { self.mapper.pt_mut(page) }
    }

    /// Map the 4 KiB page containing `va` onto the frame containing `pa`.
    ///
    /// Both addresses are truncated to page boundaries. If the 4 MiB region
    /// has no page table yet, one is allocated from `alloc`, zeroed and
    /// linked. Any cached translation for the page is invalidated.
    ///
    /// # Errors
    /// - [`MapError::OutOfMemory`] if a page table was needed and `alloc` had
    ///   no frame.
    /// - [`MapError::UnreachableTable`] if the frame `alloc` handed out cannot
    ///   be reached through the mapper; it is given back.
    ///
    /// Nothing is changed in either case.
    pub fn map<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let (_, pti) = split_indices(va);
        let (table, _) = self.table_for(alloc, va, flags)?;
        self.pt_mut(table).set(pti, PtEntry::make_4k(pa.page(), flags));
        // SAFETY: only invalidates a cached translation.
        unsafe { invalidate_tlb_page(va.page()) };
        Ok(())
    }

    /// Page table covering `va`, created if the region has none. The flag
    /// tells whether it was created by this call.
    fn table_for<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        flags: PageFlags,
    ) -> Result<(PhysicalPage, bool), MapError> {
        let (pdi, _) = split_indices(va);
        let pd = self.pd_mut();
        if let Some(table) = pd.get(pdi).next_table() {
            return Ok((table, false));
        }

        let frame = alloc.alloc_4k().ok_or(MapError::OutOfMemory(va))?;
        if !self.mapper.reaches(frame.base()) {
            alloc.free_4k(frame);
            return Err(MapError::UnreachableTable {
                va,
                frame: frame.base(),
            });
        }
        self.pt_mut(frame).zero();
        pd.set(pdi, PdEntry::make_table_link(frame, flags));
        trace!("page table for {va} at {frame}");
        Ok((frame, true))
    }

    /// Create the page table of every 4 MiB region overlapping
    /// `[start, start + bytes)` that has none yet.
    ///
    /// Returns how many tables were created.
    ///
    /// # Errors
    /// As [`map`](Self::map). Tables created before the failure stay linked.
    pub fn reserve_tables<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        start: VirtualAddress,
        bytes: u32,
        flags: PageFlags,
    ) -> Result<usize, MapError> {
        let mut created = 0;
        for region in regions(start, bytes) {
            if self.table_for(alloc, region, flags)?.1 {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Unlink and free every page table without present entries among the
    /// 4 MiB regions overlapping `[start, start + bytes)`.
    ///
    /// Returns how many tables were freed.
    pub fn release_tables<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        start: VirtualAddress,
        bytes: u32,
    ) -> usize {
        let pd = self.pd_mut();
        let mut released = 0;
        for region in regions(start, bytes) {
            let (pdi, _) = split_indices(region);
            let Some(table) = pd.get(pdi).next_table() else {
                continue;
            };
            if self.pt_mut(table).present_count() != 0 {
                continue;
            }
            pd.set(pdi, PdEntry::zero());
            // SAFETY: only invalidates cached translations.
            unsafe { invalidate_tlb_page(region.page()) };
            alloc.free_4k(table);
            released += 1;
        }
        released
    }

    /// Identity-map (`va == pa`) every page overlapping `[start, start + bytes)`.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a page table could not be allocated;
    /// pages mapped before the failure stay mapped.
    pub fn identity_map<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        start: PhysicalAddress,
        bytes: u32,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let first = align_down(start.as_u32(), PAGE_SIZE);
        let end = align_up(start.as_u32().saturating_add(bytes), PAGE_SIZE);
        let mut addr = first;
        while addr < end {
            self.map(
                alloc,
                VirtualAddress::new(addr),
                PhysicalAddress::new(addr),
                flags,
            )?;
            match addr.checked_add(PAGE_SIZE) {
                Some(next) => addr = next,
                None => break,
            }
        }
        Ok(())
    }

    /// Clear the leaf entry for `va`, if its region has a page table.
    ///
    /// Returns the frame that was mapped there, if the entry was present.
    /// The frame is not freed and the page table is kept.
    pub fn unmap(&self, va: VirtualAddress) -> Option<PhysicalPage> {
        let (pdi, pti) = split_indices(va);
        let table = self.pd_mut().get(pdi).next_table()?;

        let pt = self.pt_mut(table);
        let previous = pt.get(pti).page_4k().map(|(page, _)| page);
        pt.set(pti, PtEntry::zero());
        // SAFETY: only invalidates a cached translation.
        unsafe { invalidate_tlb_page(va.page()) };
        previous
    }

    /// Translate a [`VirtualAddress`] to a [`PhysicalAddress`] if mapped.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (pdi, pti) = split_indices(va);
        let table = self.pd_mut().get(pdi).next_table()?;
        let (page, _) = self.pt_mut(table).get(pti).page_4k()?;
        Some(page.join(va.offset()))
    }

    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.translate(va).is_some()
    }

    /// Raw directory and table entries on the way to `va`.
    #[must_use]
    pub fn walk(&self, va: VirtualAddress) -> PageWalk {
        let (pdi, pti) = split_indices(va);
        let pde = self.pd_mut().get(pdi);
        let pte = pde.next_table().map(|table| self.pt_mut(table).get(pti));
        PageWalk { va, pde, pte }
    }

    /// Number of page tables linked from the directory.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.pd_mut().table_count()
    }
}

/// Result of [`AddressSpace::walk`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageWalk {
    pub va: VirtualAddress,
    pub pde: PdEntry,
    /// `None` if the directory entry is not present.
    pub pte: Option<PtEntry>,
}

impl fmt::Display for PageWalk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (pdi, pti) = split_indices(self.va);
        let pde = self.pde.bits();
        write!(
            f,
            "{}: PD[{:4}]={:08x} P={} RW={} US={}",
            self.va,
            pdi.as_usize(),
            self.pde.raw(),
            pde.present(),
            pde.writable(),
            pde.user_access()
        )?;
        match self.pte {
            None => write!(f, " -- no page table"),
            Some(pte) => {
                let bits = pte.bits();
                write!(
                    f,
                    " PT[{:4}]={:08x} P={} RW={} US={} A={} D={}",
                    pti.as_usize(),
                    pte.raw(),
                    bits.present(),
                    bits.writable(),
                    bits.user_access(),
                    bits.accessed(),
                    bits.dirty()
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BumpAlloc, TestPhys};

    fn setup(frames: u32) -> (TestPhys, BumpAlloc) {
        let phys = TestPhys::with_frames(frames as usize);
        let alloc = BumpAlloc::new(0, frames << 12);
        (phys, alloc)
    }

    #[test]
    fn map_creates_table_and_leaf() {
        let (phys, mut alloc) = setup(8);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");

        let va = VirtualAddress::new(0xC040_0000);
        let pa = PhysicalAddress::new(0x0030_0000);
        aspace
            .map(&mut alloc, va, pa, PageFlags::KERNEL_RW)
            .expect("map");

        // Walk the tables by hand and check what was written.
        let pd = unsafe { phys.pd_mut(aspace.root_page()) };
        let (pdi, pti) = split_indices(va);
        let pde = pd.get(pdi);
        assert!(pde.is_present());
        assert!(pde.bits().writable());
        assert!(!pde.bits().user_access());

        let pt = unsafe { phys.pt_mut(pde.next_table().unwrap()) };
        let pte = pt.get(pti);
        assert_eq!(pte.raw(), 0x0030_0003);
        assert_eq!(aspace.table_count(), 1);
    }

    #[test]
    fn map_translate_unmap_round_trip() {
        let (phys, mut alloc) = setup(8);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");

        let va = VirtualAddress::new(0x0050_0000);
        let pa = PhysicalAddress::new(0x0010_0000);
        aspace
            .map(&mut alloc, va, pa, PageFlags::PRESENT | PageFlags::WRITABLE)
            .expect("map");
        assert_eq!(aspace.translate(va), Some(pa));
        assert!(aspace.is_mapped(va));

        assert_eq!(aspace.unmap(va), Some(pa.page()));
        assert_eq!(aspace.translate(va), None);
        assert!(!aspace.is_mapped(va));
    }

    #[test]
    fn addresses_are_truncated_and_offset_is_kept() {
        let (phys, mut alloc) = setup(8);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");

        aspace
            .map(
                &mut alloc,
                VirtualAddress::new(0x0080_0123),
                PhysicalAddress::new(0x0020_0456),
                PageFlags::KERNEL_RW,
            )
            .expect("map");
        assert_eq!(
            aspace.translate(VirtualAddress::new(0x0080_0ABC)),
            Some(PhysicalAddress::new(0x0020_0ABC))
        );
    }

    #[test]
    fn unmap_without_table_is_a_no_op() {
        let (phys, mut alloc) = setup(8);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");
        assert_eq!(aspace.unmap(VirtualAddress::new(0x1234_5000)), None);
        assert_eq!(aspace.table_count(), 0);
    }

    #[test]
    fn pages_in_one_region_share_a_table() {
        let (phys, mut alloc) = setup(8);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");

        for i in 0..16 {
            let va = VirtualAddress::new(0xC040_0000 + i * 4096);
            let pa = PhysicalAddress::new(0x0040_0000 + i * 4096);
            aspace
                .map(&mut alloc, va, pa, PageFlags::KERNEL_RW)
                .expect("map");
        }
        assert_eq!(aspace.table_count(), 1);
        // directory + one table
        assert_eq!(alloc.next, 2 * 4096);
    }

    #[test]
    fn table_stays_after_last_unmap() {
        let (phys, mut alloc) = setup(8);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");
        let va = VirtualAddress::new(0x0100_0000);
        aspace
            .map(&mut alloc, va, PhysicalAddress::new(0x5000), PageFlags::KERNEL_RW)
            .expect("map");
        aspace.unmap(va);
        assert_eq!(aspace.table_count(), 1);
        assert!(aspace.walk(va).pte.is_some());
    }

    #[test]
    fn out_of_memory_for_page_table_is_reported() {
        // Exactly one frame: the directory itself.
        let (phys, mut alloc) = setup(1);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");

        let va = VirtualAddress::new(0x0050_0000);
        let err = aspace
            .map(&mut alloc, va, PhysicalAddress::new(0x1000), PageFlags::KERNEL_RW)
            .unwrap_err();
        assert_eq!(err, MapError::OutOfMemory(va));
        assert!(!aspace.is_mapped(va));
        assert_eq!(aspace.table_count(), 0);
    }

    #[test]
    fn existing_table_needs_no_frame() {
        let (phys, mut alloc) = setup(2);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");
        aspace
            .map(
                &mut alloc,
                VirtualAddress::new(0x0050_0000),
                PhysicalAddress::new(0x1000),
                PageFlags::KERNEL_RW,
            )
            .expect("first map");
        // the allocator is now empty
        aspace
            .map(
                &mut alloc,
                VirtualAddress::new(0x0050_1000),
                PhysicalAddress::new(0x2000),
                PageFlags::KERNEL_RW,
            )
            .expect("second map in same region");
    }

    #[test]
    fn user_flag_reaches_directory_entry() {
        let (phys, mut alloc) = setup(8);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");
        let va = VirtualAddress::new(0x4000_0000);
        aspace
            .map(
                &mut alloc,
                va,
                PhysicalAddress::new(0x9000),
                PageFlags::PRESENT | PageFlags::USER,
            )
            .expect("map");

        let walk = aspace.walk(va);
        assert!(walk.pde.bits().user_access());
        assert!(walk.pde.bits().writable());
        let pte = walk.pte.unwrap();
        assert!(pte.bits().user_access());
        assert!(!pte.bits().writable());
    }

    #[test]
    fn table_outside_mapper_reach_is_refused() {
        let phys = TestPhys::with_reach(4, 1);
        let mut alloc = BumpAlloc::new(0, 4 << 12);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");

        let va = VirtualAddress::new(0x0050_0000);
        let err = aspace
            .map(&mut alloc, va, PhysicalAddress::new(0x3000), PageFlags::KERNEL_RW)
            .unwrap_err();
        assert_eq!(
            err,
            MapError::UnreachableTable {
                va,
                frame: PhysicalAddress::new(0x1000)
            }
        );
        assert_eq!(alloc.freed, [PhysicalPage::containing(PhysicalAddress::new(0x1000))]);
        assert_eq!(aspace.table_count(), 0);
        assert!(!aspace.is_mapped(va));
    }

    #[test]
    fn reserve_tables_covers_every_region_once() {
        let (phys, mut alloc) = setup(8);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");
        let start = VirtualAddress::new(0xC040_0000);

        assert_eq!(
            aspace.reserve_tables(&mut alloc, start, 0x0100_0000, PageFlags::KERNEL_RW),
            Ok(4)
        );
        assert_eq!(
            aspace.reserve_tables(&mut alloc, start, 0x0100_0000, PageFlags::KERNEL_RW),
            Ok(0)
        );
        assert_eq!(aspace.table_count(), 4);
        assert!(aspace.walk(VirtualAddress::new(0xC13F_F000)).pte.is_some());
        assert!(aspace.walk(VirtualAddress::new(0xC140_0000)).pte.is_none());

        // mapping inside a reserved region takes no frame
        let next = alloc.next;
        aspace
            .map(
                &mut alloc,
                VirtualAddress::new(0xC080_0000),
                PhysicalAddress::new(0x7000),
                PageFlags::KERNEL_RW,
            )
            .expect("map");
        assert_eq!(alloc.next, next);
    }

    #[test]
    fn reserve_tables_counts_partial_regions() {
        let (phys, mut alloc) = setup(8);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");
        let created = aspace.reserve_tables(
            &mut alloc,
            VirtualAddress::new(0x003F_F000),
            0x2000,
            PageFlags::KERNEL_RW,
        );
        assert_eq!(created, Ok(2));
        assert_eq!(
            aspace.reserve_tables(&mut alloc, VirtualAddress::new(0x0080_0000), 0, PageFlags::KERNEL_RW),
            Ok(0)
        );
    }

    #[test]
    fn reserve_tables_stops_at_the_mapper_reach() {
        let phys = TestPhys::with_reach(8, 3);
        let mut alloc = BumpAlloc::new(0, 8 << 12);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");

        let err = aspace
            .reserve_tables(
                &mut alloc,
                VirtualAddress::new(0xC040_0000),
                0x0100_0000,
                PageFlags::KERNEL_RW,
            )
            .unwrap_err();
        assert_eq!(
            err,
            MapError::UnreachableTable {
                va: VirtualAddress::new(0xC0C0_0000),
                frame: PhysicalAddress::new(0x3000)
            }
        );
        assert_eq!(aspace.table_count(), 2);
    }

    #[test]
    fn release_tables_keeps_tables_in_use() {
        let (phys, mut alloc) = setup(8);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");
        let start = VirtualAddress::new(0xC040_0000);
        aspace
            .reserve_tables(&mut alloc, start, 0x0100_0000, PageFlags::KERNEL_RW)
            .expect("reserve");
        aspace
            .map(&mut alloc, start, PhysicalAddress::new(0x7000), PageFlags::KERNEL_RW)
            .expect("map");

        assert_eq!(aspace.release_tables(&mut alloc, start, 0x0100_0000), 3);
        assert_eq!(alloc.freed.len(), 3);
        assert_eq!(aspace.table_count(), 1);
        assert_eq!(aspace.translate(start), Some(PhysicalAddress::new(0x7000)));
        assert!(aspace.walk(VirtualAddress::new(0xC080_0000)).pte.is_none());
    }

    #[test]
    fn identity_map_first_four_mib_uses_one_table() {
        let (phys, mut alloc) = setup(4);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");
        aspace
            .identity_map(
                &mut alloc,
                PhysicalAddress::zero(),
                0x0040_0000,
                PageFlags::KERNEL_RW,
            )
            .expect("identity map");

        assert_eq!(aspace.table_count(), 1);
        for addr in [0u32, 0x1000, 0x0010_0000, 0x003F_F000] {
            assert_eq!(
                aspace.translate(VirtualAddress::new(addr)),
                Some(PhysicalAddress::new(addr))
            );
        }
        assert!(!aspace.is_mapped(VirtualAddress::new(0x0040_0000)));
    }

    #[test]
    fn walk_renders_both_levels() {
        let (phys, mut alloc) = setup(4);
        let aspace = AddressSpace::new(&phys, &mut alloc).expect("directory");
        let va = VirtualAddress::new(0x0040_0000);
        assert!(format!("{}", aspace.walk(va)).contains("no page table"));

        aspace
            .map(&mut alloc, va, PhysicalAddress::new(0x3000), PageFlags::KERNEL_RW)
            .expect("map");
        let text = format!("{}", aspace.walk(va));
        assert!(text.contains("PT[   0]=00003003"), "{text}");
    }
}
