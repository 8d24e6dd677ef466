//! # Kernel Physical Frame and Heap Allocation
//!
//! The two allocators at the bottom of the kernel's memory stack:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Kernel Heap ([`heap`])              │
//! │    • first-fit block list with split / coalesce     │
//! │    • grows page by page up to a fixed limit         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ HeapBacking (map page, read, write)
//! ┌─────────────────▼───────────────────────────────────┐
//! │      Paging (kernel-vmem AddressSpace)              │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ FrameAlloc
//! ┌─────────────────▼───────────────────────────────────┐
//! │        Frame Bitmap Allocator ([`frame_alloc`])     │
//! │    • one bit per 4 KiB frame                        │
//! │    • bitmap placed right after the kernel image     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Frame allocation
//!
//! [`BitmapFrameAlloc`](frame_alloc::BitmapFrameAlloc) is sized from the boot
//! memory map. Low memory, reserved ranges, the kernel image and the bitmap
//! itself are marked used up front; everything else is handed out one frame
//! at a time, lowest address first.
//!
//! ```rust
//! use kernel_alloc::frame_alloc::{BitmapFrameAlloc, BitmapPlacement};
//! use kernel_info::boot::{KernelImage, MemoryMapEntry, MemoryRegionKind};
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let map = [MemoryMapEntry::new(0, 8 << 20, MemoryRegionKind::Available)];
//! let kernel = KernelImage {
//!     start: PhysicalAddress::new(0x10_0000),
//!     end: PhysicalAddress::new(0x12_0000),
//! };
//! let placement = BitmapPlacement::plan(map, &kernel).unwrap();
//! let mut storage = vec![0u32; placement.words as usize];
//! let mut frames = BitmapFrameAlloc::new(&placement, &mut storage, map, &kernel).unwrap();
//!
//! let frame = frames.allocate_frame().unwrap();
//! assert_eq!(frame, PhysicalAddress::new(0x12_1000));
//! frames.free_frame(frame);
//! ```
//!
//! ## Heap
//!
//! [`KernelHeap`](heap::KernelHeap) keeps only the arena bounds; block
//! headers live inside the arena and are read and written through a
//! [`HeapBacking`](heap::HeapBacking), which also supplies fresh pages when
//! the heap grows. The kernel's backing maps those pages through its
//! address space; tests use plain host memory.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod frame_alloc;
pub mod heap;
pub mod phys_mapper;
