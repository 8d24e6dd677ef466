//! # `GlobalAlloc` over the Kernel Heap
//!
//! Lets `alloc` collections use [`kmalloc`] / [`kfree`] once
//! [`memory_init`](crate::global::memory_init) has run. The kernel binary
//! installs it with
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;
//! ```
//!
//! Heap payloads are 4-byte aligned. Stricter alignments over-allocate and
//! store the original payload address in the word right before the aligned
//! pointer.

use crate::global::{kfree, kmalloc};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use kernel_memory_addresses::VirtualAddress;

/// Alignment every heap payload already has.
pub const HEAP_ALIGN: usize = 4;

/// The kernel's global allocator.
pub struct KernelAllocator;

/// First address at or after `raw + HEAP_ALIGN` aligned to `align`, leaving
/// room for the stashed address.
#[must_use]
pub const fn aligned_payload(raw: usize, align: usize) -> usize {
    (raw + HEAP_ALIGN + align - 1) & !(align - 1)
}

/// Bytes to request from the heap for `layout`.
#[must_use]
pub const fn request_size(layout: &Layout) -> Option<usize> {
    if layout.align() <= HEAP_ALIGN {
        Some(layout.size())
    } else {
        layout.size().checked_add(layout.align() + HEAP_ALIGN)
    }
}

fn to_ptr(va: VirtualAddress) -> *mut u8 {
    va.as_u32() as usize as *mut u8
}

#[allow(clippy::cast_possible_truncation)]
fn to_va(ptr: *mut u8) -> VirtualAddress {
    VirtualAddress::new(ptr as usize as u32)
}

unsafe impl GlobalAlloc for KernelAllocator {
    /// # Safety
    /// The `GlobalAlloc` contract applies. Caller must handle a null return (OOM).
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(size) = request_size(&layout) else {
            return ptr::null_mut();
        };
        let Some(raw) = kmalloc(size) else {
            return ptr::null_mut();
        };
        if layout.align() <= HEAP_ALIGN {
            return to_ptr(raw);
        }

        let base = to_ptr(raw);
        let aligned = aligned_payload(base as usize, layout.align());
        let payload = base.wrapping_add(aligned - base as usize);
        // SAFETY: the stash word lies between `base` and `payload`, inside
        // the allocation, and is 4-byte aligned.
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            payload.sub(HEAP_ALIGN).cast::<u32>().write(raw.as_u32());
        }
        payload
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies. `ptr` and `layout` must match a prior allocation.
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        if layout.align() <= HEAP_ALIGN {
            kfree(to_va(ptr));
            return;
        }
        // SAFETY: written by `alloc` for this layout.
        #[allow(clippy::cast_ptr_alignment)]
        let raw = unsafe { ptr.sub(HEAP_ALIGN).cast::<u32>().read() };
        kfree(VirtualAddress::new(raw));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_alignments_use_the_heap_directly() {
        let layout = Layout::from_size_align(24, 4).unwrap();
        assert_eq!(request_size(&layout), Some(24));
    }

    #[test]
    fn large_alignments_reserve_room_for_the_stash() {
        let layout = Layout::from_size_align(100, 64).unwrap();
        assert_eq!(request_size(&layout), Some(100 + 64 + 4));
    }

    #[test]
    fn aligned_payload_leaves_a_stash_word() {
        for raw in (0xC040_0014usize..0xC040_0114).step_by(4) {
            for align in [8usize, 16, 64, 4096] {
                let p = aligned_payload(raw, align);
                assert!(p.is_multiple_of(align));
                assert!(p >= raw + HEAP_ALIGN);
                assert!(p + 100 <= raw + 100 + align + HEAP_ALIGN);
            }
        }
    }
}
