//! # Kernel Memory Manager
//!
//! Wires the frame bitmap, the paging layer and the heap into one
//! [`MemoryManager`], and exposes the kernel-wide instance through plain
//! functions in [`global`].
//!
//! ## Bring-up
//!
//! ```text
//! Multiboot memory map ──► BitmapFrameAlloc   (frames above the kernel image)
//!                               │
//!                               ▼
//!                          AddressSpace        (directory + 4 MiB identity map)
//!                               │  activate(): CR3, CR0.PG
//!                               ▼
//!                          KernelHeap          (1 MiB at 0xC040_0000, grows to 16 MiB)
//! ```
//!
//! [`global::memory_init`] runs the whole chain and halts on failure; there is
//! no way to continue without memory.
//!
//! ## Reaching physical memory
//!
//! Page directories, page tables and the frame bitmap are reached through a
//! [`PhysMapper`](kernel_vmem::PhysMapper). The kernel uses
//! [`IdentityPhysMapper`](kernel_alloc::phys_mapper::IdentityPhysMapper), so
//! every frame the paging layer touches must lie in the identity-mapped
//! first 4 MiB. Heap pages are reached through their heap virtual address.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod backing;
pub mod global;
pub mod global_alloc;
pub mod halt;
mod manager;
pub mod page_fault;

pub use crate::backing::{HeapAccess, PagedHeapBacking};
pub use crate::manager::MemoryManager;
pub use kernel_alloc::frame_alloc::{FrameAllocError, FrameStats};
pub use kernel_alloc::heap::{HeapConfig, HeapError, HeapStats, HeapValidationError};
pub use kernel_vmem::{MapError, PageFlags};

/// Why [`global::memory_init`] (or [`MemoryManager::new`]) could not bring
/// memory up.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryInitError {
    #[error("the boot loader did not provide a memory map")]
    NoMemoryMap,
    #[error(transparent)]
    Frames(#[from] FrameAllocError),
    #[error("paging setup failed: {0}")]
    Paging(#[from] MapError),
    #[error("heap setup failed: {0}")]
    Heap(#[from] HeapError),
    #[error("memory manager already initialized")]
    AlreadyInitialized,
}

/// The logger used by the kernel, writing to the QEMU debug console.
static LOGGER: kernel_qemu::QemuLogger = kernel_qemu::QemuLogger::new(log::LevelFilter::Info);

/// Route `log` records to the QEMU debug console.
///
/// # Errors
/// Fails if a logger was already installed.
pub fn init_logging() -> Result<(), log::SetLoggerError> {
    LOGGER.init()
}
