//! # The Kernel-Wide Memory Manager
//!
//! One [`MemoryManager`] lives behind a [`SpinLock`] and is set up by
//! [`memory_init`]. The functions here are what the rest of the kernel
//! calls; they flatten every failure into a sentinel (`None`, `false`, `0`
//! or a no-op) after logging it.
//!
//! Every call only *tries* the lock. A call that arrives while the manager
//! is busy (an interrupt handler preempting an allocation) is refused with
//! an error instead of spinning forever on the single core.

use crate::halt::fatal;
use crate::{MemoryInitError, MemoryManager};
use core::slice;
use kernel_alloc::frame_alloc::{BitmapFrameAlloc, BitmapPlacement, FrameAllocError, FrameStats};
use kernel_alloc::heap::{HeapConfig, HeapError, HeapStats};
use kernel_alloc::phys_mapper::IdentityPhysMapper;
use kernel_info::boot::{KernelImage, MultibootInfo, MultibootMmapIter};
use kernel_info::memory::IDENTITY_MAP_BYTES;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{PageFlags, PageWalk, PhysMapper};
use log::{debug, error, info, warn};

type KernelMemory = MemoryManager<'static, IdentityPhysMapper>;

static MAPPER: IdentityPhysMapper = IdentityPhysMapper;

static MEMORY: SpinLock<Option<KernelMemory>> = SpinLock::new(None);

fn with_manager<R>(f: impl FnOnce(&mut KernelMemory) -> R) -> Option<R> {
    let Some(mut guard) = MEMORY.try_lock() else {
        error!("memory manager re-entered while busy");
        return None;
    };
    let Some(mm) = guard.as_mut() else {
        warn!("memory manager used before initialization");
        return None;
    };
    Some(f(mm))
}

fn heap_result<T>(op: &str, result: Result<T, HeapError>) -> Option<T> {
    result
        .map_err(|e| match e {
            HeapError::InvalidSize => {}
            e => debug!("{op} failed: {e}"),
        })
        .ok()
}

/// Bring up frames, paging and the heap from the boot loader's information.
/// Halts if anything fails.
///
/// # Safety
/// See [`try_memory_init`].
pub unsafe fn memory_init(info: &MultibootInfo, kernel: KernelImage) {
    // SAFETY: forwarded to the caller.
    if let Err(e) = unsafe { try_memory_init(info, kernel) } {
        fatal(format_args!("memory initialization failed: {e}"));
    }
}

/// Fallible body of [`memory_init`].
///
/// # Safety
/// - Paging must be off, at CPL0.
/// - `info` must be the block the loader handed over; its memory map, the
///   kernel image and the memory right after it must lie in the first 4 MiB.
/// - Nothing else may use the memory past `kernel.end` that the frame
///   bitmap is placed in.
///
/// # Errors
/// - [`MemoryInitError::AlreadyInitialized`] on a second call.
/// - [`MemoryInitError::NoMemoryMap`] if `info` carries no memory map.
/// - [`MemoryInitError::Frames`] if the bitmap cannot be sized or placed.
/// - [`MemoryInitError::Paging`] / [`MemoryInitError::Heap`] if their frames
///   cannot be allocated.
pub unsafe fn try_memory_init(
    info: &MultibootInfo,
    kernel: KernelImage,
) -> Result<(), MemoryInitError> {
    let mut guard = MEMORY
        .try_lock()
        .ok_or(MemoryInitError::AlreadyInitialized)?;
    if guard.is_some() {
        return Err(MemoryInitError::AlreadyInitialized);
    }

    let (map_addr, map_len) = info.memory_map().ok_or(MemoryInitError::NoMemoryMap)?;
    // SAFETY: the loader's memory map is identity-reachable (caller contract).
    let raw = unsafe {
        slice::from_raw_parts(
            MAPPER.phys_to_ptr(map_addr).cast_const(),
            map_len as usize,
        )
    };
    let map = MultibootMmapIter::new(raw);
    for entry in map.clone() {
        debug!(
            "memory map: {:#011x}..{:#011x} {}",
            entry.base,
            entry.end(),
            entry.region_kind().as_str()
        );
    }

    let placement = BitmapPlacement::plan(map.clone(), &kernel)?;
    if placement.end().as_u32() > IDENTITY_MAP_BYTES {
        return Err(FrameAllocError::BitmapOutOfRange.into());
    }
    // SAFETY: the planned range is 4-byte aligned, identity-mapped and
    // owned by the allocator from here on.
    #[allow(clippy::cast_ptr_alignment)]
    let storage = unsafe {
        slice::from_raw_parts_mut(
            MAPPER.phys_to_ptr(placement.base).cast::<u32>(),
            placement.words as usize,
        )
    };
    let frames = BitmapFrameAlloc::new(&placement, storage, map, &kernel)?;

    let mut mm = MemoryManager::new(&MAPPER, frames)?;
    // SAFETY: the running kernel lies in the identity window (caller contract).
    unsafe { mm.activate_paging() };
    mm.init_heap(HeapConfig::default())?;

    let stats = mm.frame_stats();
    info!(
        "memory initialized ({} MB, {} pages used)",
        stats.total_bytes >> 20,
        stats.used_frames
    );
    *guard = Some(mm);
    Ok(())
}

/// Whether [`memory_init`] has completed. `false` while the manager is busy.
#[must_use]
pub fn is_initialized() -> bool {
    MEMORY.try_with_lock(|mm| mm.is_some()).unwrap_or(false)
}

/// One free 4 KiB frame, or `None` when physical memory is exhausted.
#[must_use]
pub fn allocate_frame() -> Option<PhysicalAddress> {
    with_manager(MemoryManager::allocate_frame).flatten()
}

pub fn free_frame(pa: PhysicalAddress) {
    with_manager(|mm| mm.free_frame(pa));
}

#[must_use]
pub fn total_memory_bytes() -> u64 {
    with_manager(|mm| mm.frames().total_memory_bytes()).unwrap_or(0)
}

#[must_use]
pub fn used_memory_bytes() -> u64 {
    with_manager(|mm| mm.frames().used_memory_bytes()).unwrap_or(0)
}

#[must_use]
pub fn free_memory_bytes() -> u64 {
    with_manager(|mm| mm.frames().free_memory_bytes()).unwrap_or(0)
}

#[must_use]
pub fn frame_stats() -> Option<FrameStats> {
    with_manager(|mm| mm.frame_stats())
}

/// Map the page containing `va` onto the frame containing `pa`.
///
/// Returns `false` if a page table was needed and no frame inside the
/// identity window was left for it.
#[must_use]
pub fn map(va: VirtualAddress, pa: PhysicalAddress, flags: PageFlags) -> bool {
    with_manager(|mm| match mm.map(va, pa, flags) {
        Ok(()) => true,
        Err(e) => {
            warn!("cannot map {va} -> {pa}: {e}");
            false
        }
    })
    .unwrap_or(false)
}

pub fn unmap(va: VirtualAddress) {
    with_manager(|mm| mm.unmap(va));
}

#[must_use]
pub fn translate(va: VirtualAddress) -> Option<PhysicalAddress> {
    with_manager(|mm| mm.translate(va)).flatten()
}

#[must_use]
pub fn is_mapped(va: VirtualAddress) -> bool {
    translate(va).is_some()
}

/// Same as [`translate`].
#[must_use]
pub fn virtual_to_physical(va: VirtualAddress) -> Option<PhysicalAddress> {
    translate(va)
}

/// Virtual address of `pa` inside the identity window, if it lies there.
#[must_use]
pub const fn physical_to_virtual(pa: PhysicalAddress) -> Option<VirtualAddress> {
    if IdentityPhysMapper::covers(pa) {
        Some(VirtualAddress::new(pa.as_u32()))
    } else {
        None
    }
}

/// Directory and table entries for `va`, for diagnostics.
#[must_use]
pub fn walk(va: VirtualAddress) -> Option<PageWalk> {
    with_manager(|mm| mm.walk(va))
}

/// Allocate `size` bytes from the kernel heap. `None` for `size == 0` and
/// when the heap cannot grow any further.
#[must_use]
pub fn kmalloc(size: usize) -> Option<VirtualAddress> {
    let size = u32::try_from(size).ok()?;
    with_manager(|mm| heap_result("kmalloc", mm.allocate(size))).flatten()
}

/// Allocate `count * size` zeroed bytes.
#[must_use]
pub fn kcalloc(count: usize, size: usize) -> Option<VirtualAddress> {
    let count = u32::try_from(count).ok()?;
    let size = u32::try_from(size).ok()?;
    with_manager(|mm| heap_result("kcalloc", mm.allocate_zeroed(count, size))).flatten()
}

/// Resize an allocation. `ptr == None` allocates, `size == 0` frees and
/// returns `None`. On failure the old allocation is left alone.
#[must_use]
pub fn krealloc(ptr: Option<VirtualAddress>, size: usize) -> Option<VirtualAddress> {
    let size = u32::try_from(size).ok()?;
    with_manager(|mm| heap_result("krealloc", mm.reallocate(ptr, size)))
        .flatten()
        .flatten()
}

/// Return an allocation to the heap. A null address is ignored.
pub fn kfree(ptr: VirtualAddress) {
    if ptr.as_u32() == 0 {
        return;
    }
    with_manager(|mm| heap_result("kfree", mm.free(ptr)));
}

/// Usable bytes of the allocation at `ptr`.
#[must_use]
pub fn allocated_size_of(ptr: VirtualAddress) -> Option<u32> {
    with_manager(|mm| mm.allocated_size_of(ptr)).flatten()
}

#[must_use]
pub fn heap_stats() -> Option<HeapStats> {
    with_manager(MemoryManager::heap_stats)
}

/// Check the heap's block list. `false` if it is inconsistent or the heap
/// is unavailable.
#[must_use]
pub fn heap_validate() -> bool {
    with_manager(|mm| mm.heap_validate().is_ok()).unwrap_or(false)
}

pub fn log_memory_stats() {
    let Some(s) = frame_stats() else {
        return;
    };
    info!(
        "physical memory: {} KiB usable in {} map entries, {} MiB tracked",
        s.usable_bytes >> 10,
        s.map_entries,
        s.total_bytes >> 20
    );
    info!(
        "frames: {} total, {} used, {} free (peak {})",
        s.total_frames, s.used_frames, s.free_frames, s.peak_used_frames
    );
    info!("frame allocations: {}, frees: {}", s.allocations, s.frees);
}

pub fn log_heap_stats() {
    let Some(s) = heap_stats() else {
        return;
    };
    info!(
        "heap: {} bytes, {} blocks ({} free, {} allocated)",
        s.heap_size, s.total_blocks, s.free_blocks, s.allocated_blocks
    );
    info!(
        "heap bytes: {} free, {} allocated, largest free block {}",
        s.free_bytes, s.allocated_bytes, s.largest_free_block
    );
}
