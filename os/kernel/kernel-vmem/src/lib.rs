//! # Virtual Memory Support
//!
//! Two-level x86 paging (32-bit protected mode, 4 KiB pages, no PAE).
//!
//! ## What you get
//! - An [`AddressSpace`] describing a page-directory-rooted translation tree.
//! - x86 page entry [`PageFlags`] with practical explanations.
//! - 4 KiB-aligned [`PageDirectory`] and [`PageTable`] wrappers and index helpers.
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]).
//!
//! ## x86 Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses the first two fields as **indices** into two levels of
//! tables, each 4 KiB large and holding 1024 entries of 4 bytes.
//!
//! ```text
//!  CR3 → PD  →  PT  →  Physical Page
//!         │      │
//!         │      └───► PTE (Page Table Entry)      → maps 4 KiB page
//!         └──────────► PDE (Page Directory Entry)  → points to a PT
//! ```
//!
//! One directory entry covers 4 MiB of virtual address space. Page tables
//! are created on demand the first time anything in their 4 MiB region is
//! mapped, or up front for a whole range, and are only reclaimed on request.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod page_entry_bits;
pub mod page_table;

pub use crate::address_space::{AddressSpace, MapError, PageWalk, TABLE_REGION_SIZE};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::pd::{PageDirectory, PdEntry, PdIndex};
pub use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
pub use kernel_memory_addresses as addresses;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualPage};

bitflags::bitflags! {
    /// Page entry flags used in x86 virtual memory.
    ///
    /// These flags control access permissions, caching behavior,
    /// and indicate page status (e.g., accessed or dirty).
    /// Callers of [`AddressSpace::map`] normally pick from
    /// `PRESENT`, `WRITABLE` and `USER`; the remaining bits are carried
    /// through to the entry but never interpreted here.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageFlags: u32 {
        /// Page is present in physical memory.
        ///
        /// Cleared means any access raises a page fault.
        const PRESENT       = 1 << 0;

        /// Page is writable.
        ///
        /// If cleared, the page is read-only for user mode, and for
        /// supervisor mode as well when CR0.WP is set.
        const WRITABLE      = 1 << 1;

        /// Page is accessible from user mode (CPL=3).
        const USER          = 1 << 2;

        /// Write-through caching enabled.
        const WRITE_THROUGH = 1 << 3;

        /// Caching disabled for this page; used for MMIO.
        const CACHE_DISABLE = 1 << 4;

        /// Page has been accessed. Set by the processor.
        const ACCESSED      = 1 << 5;

        /// Page has been written to. Set by the processor on leaf entries.
        const DIRTY         = 1 << 6;
    }
}

impl PageFlags {
    /// Present, writable, supervisor-only: the default for kernel data.
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::WRITABLE);
}

/// Minimal frame allocator used to obtain **physical** 4 KiB frames
/// for page tables and mapped pages.
///
/// Returned frames **must** be 4 KiB aligned. Returns `None` on out-of-memory.
pub trait FrameAlloc {
    /// Allocate one 4 KiB *physical* frame.
    fn alloc_4k(&mut self) -> Option<PhysicalPage>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, page: PhysicalPage);
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space (e.g., via the identity map of low memory).
///
/// # Safety
/// - You must ensure `pa` is mapped as writable in the current page tables
///   for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a pointer in the current address space.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Whether [`phys_to_ptr`](Self::phys_to_ptr) can produce a usable
    /// pointer for `pa`. New page tables are only placed in frames it reaches.
    #[inline]
    fn reaches(&self, pa: PhysicalAddress) -> bool {
        let _ = pa;
        true
    }

    /// Convert a *physical* address to a mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }
}

/// Typed views of paging structures through a [`PhysMapper`].
pub trait PhysMapperExt: PhysMapper {
    /// Borrow the [`PageDirectory`] stored in `page`.
    ///
    /// # Safety
    /// `page` must hold a page directory and no other reference to it may be live.
    #[inline]
    unsafe fn pd_mut<'a>(&self, page: PhysicalPage) -> &'a mut PageDirectory {
        unsafe { self.phys_to_mut::<PageDirectory>(page.base()) }
    }

    /// Borrow the [`PageTable`] stored in `page`.
    ///
    /// # Safety
    /// `page` must hold a page table and no other reference to it may be live.
    #[inline]
    unsafe fn pt_mut<'a>(&self, page: PhysicalPage) -> &'a mut PageTable {
        unsafe { self.phys_to_mut::<PageTable>(page.base()) }
    }
}

impl<T: PhysMapper + ?Sized> PhysMapperExt for T {}

/// Invalidate any cached translation for a single virtual page on this CPU.
///
/// A no-op when not building for an `x86` target with the `asm` feature.
///
/// # Safety
/// Must run at CPL0.
#[inline]
pub unsafe fn invalidate_tlb_page(page: VirtualPage) {
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    unsafe {
        let va = page.base().as_u32();
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
    }
    #[cfg(not(all(feature = "asm", target_arch = "x86")))]
    let _ = page;
}
