//! Bitmap physical frame allocator.
//!
//! One bit per 4 KiB frame of physical memory below the highest available
//! address in the boot memory map; a set bit means the frame is in use. The
//! bitmap itself lives in physical memory directly after the kernel image,
//! which is why its placement is computed first ([`BitmapPlacement::plan`])
//! and the storage handed in afterwards ([`BitmapFrameAlloc::new`]).
//!
//! At initialization the following frames are marked in use and are never
//! expected to be freed:
//! - frames of every memory-map record that is not "available",
//! - every frame below 1 MiB,
//! - the kernel image and the bitmap.
//!
//! Frames not covered by any record stay free.

use kernel_info::boot::{KernelImage, MemoryMapEntry};
use kernel_info::memory::{LOW_MEMORY_END, PHYSICAL_ADDRESS_LIMIT};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, align_up};
use kernel_vmem::FrameAlloc;
use log::debug;

const BITS_PER_WORD: u32 = u32::BITS;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    /// The memory map contains no available range below 4 GiB.
    #[error("no available memory below 4 GiB in the memory map")]
    NoAvailableMemory,
    /// The bitmap would not fit in the 32-bit physical address space.
    #[error("frame bitmap does not fit after the kernel image")]
    BitmapOutOfRange,
    /// The storage handed to [`BitmapFrameAlloc::new`] is shorter than planned.
    #[error("frame bitmap storage too small: need {needed} words, got {got}")]
    StorageTooSmall { needed: usize, got: usize },
}

/// Where the frame bitmap goes and how large it is, derived from the boot
/// memory map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BitmapPlacement {
    /// Physical address of the first bitmap word (kernel end, 4-byte aligned).
    pub base: PhysicalAddress,
    /// Number of frames tracked.
    pub total_frames: u32,
    /// Number of `u32` words in the bitmap.
    pub words: u32,
    /// One past the highest available byte below 4 GiB.
    pub highest_address: u64,
    /// Sum of the available ranges below 4 GiB.
    pub usable_bytes: u64,
    /// Number of memory-map records seen.
    pub map_entries: u32,
}

impl BitmapPlacement {
    /// Size the bitmap from `map` and place it after the kernel image.
    ///
    /// # Errors
    /// - [`FrameAllocError::NoAvailableMemory`] if the map has no usable RAM.
    /// - [`FrameAllocError::BitmapOutOfRange`] if the bitmap would extend past 4 GiB.
    pub fn plan<I>(map: I, kernel: &KernelImage) -> Result<Self, FrameAllocError>
    where
        I: IntoIterator<Item = MemoryMapEntry>,
    {
        let mut highest_address = 0u64;
        let mut usable_bytes = 0u64;
        let mut map_entries = 0u32;

        for entry in map {
            map_entries = map_entries.saturating_add(1);
            if entry.base >= PHYSICAL_ADDRESS_LIMIT || !entry.is_available() {
                continue;
            }
            let end = entry.end().min(PHYSICAL_ADDRESS_LIMIT);
            highest_address = highest_address.max(end);
            usable_bytes += end - entry.base;
        }

        let total_frames = u32::try_from(highest_address / u64::from(PAGE_SIZE))
            .map_err(|_| FrameAllocError::BitmapOutOfRange)?;
        if total_frames == 0 {
            return Err(FrameAllocError::NoAvailableMemory);
        }

        let words = total_frames.div_ceil(BITS_PER_WORD);
        let base = align_up(kernel.end.as_u32(), 4);
        base.checked_add(words * 4)
            .ok_or(FrameAllocError::BitmapOutOfRange)?;

        Ok(Self {
            base: PhysicalAddress::new(base),
            total_frames,
            words,
            highest_address,
            usable_bytes,
            map_entries,
        })
    }

    /// Bytes occupied by the bitmap.
    #[must_use]
    pub const fn bytes(&self) -> u32 {
        self.words * 4
    }

    /// One past the last bitmap byte.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u32() + self.bytes())
    }
}

/// Snapshot of the frame allocator's counters.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FrameStats {
    pub total_frames: u32,
    pub used_frames: u32,
    pub free_frames: u32,
    /// Bytes of physical memory tracked, up to the highest available address.
    pub total_bytes: u64,
    /// Sum of the available memory-map ranges.
    pub usable_bytes: u64,
    pub map_entries: u32,
    /// Successful [`BitmapFrameAlloc::allocate_frame`] calls.
    pub allocations: u64,
    /// Frames actually released by [`BitmapFrameAlloc::free_frame`].
    pub frees: u64,
    /// Highest `used_frames` seen since initialization.
    pub peak_used_frames: u32,
}

/// Bitmap allocator for 4 KiB physical frames.
pub struct BitmapFrameAlloc<'a> {
    bitmap: &'a mut [u32],
    total_frames: u32,
    used_frames: u32,
    /// Every frame below this index is in use.
    first_free_hint: u32,
    total_bytes: u64,
    usable_bytes: u64,
    map_entries: u32,
    allocations: u64,
    frees: u64,
    peak_used_frames: u32,
}

impl<'a> BitmapFrameAlloc<'a> {
    /// Build the allocator over `storage`, which must be the memory at
    /// `placement.base` (or, in tests, any buffer of at least
    /// `placement.words` words).
    ///
    /// # Errors
    /// [`FrameAllocError::StorageTooSmall`] if `storage` cannot hold the bitmap.
    pub fn new<I>(
        placement: &BitmapPlacement,
        storage: &'a mut [u32],
        map: I,
        kernel: &KernelImage,
    ) -> Result<Self, FrameAllocError>
    where
        I: IntoIterator<Item = MemoryMapEntry>,
    {
        let needed = placement.words as usize;
        let got = storage.len();
        let bitmap = storage
            .get_mut(..needed)
            .ok_or(FrameAllocError::StorageTooSmall { needed, got })?;
        bitmap.fill(0);

        let mut this = Self {
            bitmap,
            total_frames: placement.total_frames,
            used_frames: 0,
            first_free_hint: 0,
            total_bytes: placement.highest_address,
            usable_bytes: placement.usable_bytes,
            map_entries: placement.map_entries,
            allocations: 0,
            frees: 0,
            peak_used_frames: 0,
        };

        for entry in map {
            if entry.base >= PHYSICAL_ADDRESS_LIMIT || entry.is_available() {
                continue;
            }
            let end = entry.end().min(PHYSICAL_ADDRESS_LIMIT);
            this.mark_range(entry.base, end);
        }
        this.mark_range(0, u64::from(LOW_MEMORY_END));
        this.mark_range(kernel.start.as_u64(), placement.end().as_u64());

        this.used_frames = this.bitmap.iter().map(|w| w.count_ones()).sum();
        this.peak_used_frames = this.used_frames;
        this.first_free_hint = (LOW_MEMORY_END / PAGE_SIZE).min(this.total_frames);

        debug!(
            "frame bitmap at {} ({} words): {} frames, {} in use",
            placement.base, placement.words, this.total_frames, this.used_frames
        );
        Ok(this)
    }

    /// Mark every frame overlapping `[start, end)` as in use.
    #[allow(clippy::cast_possible_truncation)]
    fn mark_range(&mut self, start: u64, end: u64) {
        let page = u64::from(PAGE_SIZE);
        let first = (start / page).min(u64::from(self.total_frames)) as u32;
        let last = end.div_ceil(page).min(u64::from(self.total_frames)) as u32;
        for index in first..last {
            self.set(index);
        }
    }

    #[inline]
    const fn is_set(&self, index: u32) -> bool {
        self.bitmap[(index / BITS_PER_WORD) as usize] & (1 << (index % BITS_PER_WORD)) != 0
    }

    #[inline]
    const fn set(&mut self, index: u32) {
        self.bitmap[(index / BITS_PER_WORD) as usize] |= 1 << (index % BITS_PER_WORD);
    }

    #[inline]
    const fn clear(&mut self, index: u32) {
        self.bitmap[(index / BITS_PER_WORD) as usize] &= !(1 << (index % BITS_PER_WORD));
    }

    /// Allocate one frame, scanning upward from the first-free hint.
    ///
    /// Never returns frame 0: everything below 1 MiB is reserved.
    pub fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
        let mut index = self.first_free_hint;
        while index < self.total_frames {
            let word = self.bitmap[(index / BITS_PER_WORD) as usize];
            if word == u32::MAX && index.is_multiple_of(BITS_PER_WORD) {
                index += BITS_PER_WORD;
                continue;
            }
            if !self.is_set(index) {
                self.set(index);
                self.used_frames += 1;
                self.peak_used_frames = self.peak_used_frames.max(self.used_frames);
                self.allocations += 1;
                if index == self.first_free_hint {
                    self.first_free_hint += 1;
                }
                return Some(PhysicalPage::from_index(index).base());
            }
            index += 1;
        }
        None
    }

    /// Release a frame.
    ///
    /// Unaligned or out-of-range addresses and frames that are already free
    /// are ignored.
    pub fn free_frame(&mut self, addr: PhysicalAddress) {
        if !addr.is_page_aligned() {
            debug!("ignoring free of unaligned frame address {addr}");
            return;
        }
        let index = addr.page().frame_index();
        if index >= self.total_frames {
            debug!("ignoring free of frame {addr} beyond end of memory");
            return;
        }
        if !self.is_set(index) {
            return;
        }

        self.clear(index);
        self.used_frames -= 1;
        self.frees += 1;
        if index < self.first_free_hint {
            self.first_free_hint = index;
        }
    }

    /// Whether the frame containing `addr` is in use. Addresses past the end
    /// of memory count as in use.
    #[must_use]
    pub fn is_allocated(&self, addr: PhysicalAddress) -> bool {
        let index = addr.page().frame_index();
        index >= self.total_frames || self.is_set(index)
    }

    #[must_use]
    pub const fn total_frames(&self) -> u32 {
        self.total_frames
    }

    #[must_use]
    pub const fn used_frames(&self) -> u32 {
        self.used_frames
    }

    #[must_use]
    pub const fn free_frames(&self) -> u32 {
        self.total_frames - self.used_frames
    }

    /// Physical memory size: the highest available address in the map.
    #[must_use]
    pub const fn total_memory_bytes(&self) -> u64 {
        self.total_bytes
    }

    #[must_use]
    pub fn used_memory_bytes(&self) -> u64 {
        u64::from(self.used_frames) * u64::from(PAGE_SIZE)
    }

    #[must_use]
    pub fn free_memory_bytes(&self) -> u64 {
        u64::from(self.free_frames()) * u64::from(PAGE_SIZE)
    }

    #[must_use]
    pub const fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.total_frames,
            used_frames: self.used_frames,
            free_frames: self.free_frames(),
            total_bytes: self.total_bytes,
            usable_bytes: self.usable_bytes,
            map_entries: self.map_entries,
            allocations: self.allocations,
            frees: self.frees,
            peak_used_frames: self.peak_used_frames,
        }
    }
}

impl FrameAlloc for BitmapFrameAlloc<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        self.allocate_frame().map(PhysicalAddress::page)
    }

    fn free_4k(&mut self, page: PhysicalPage) {
        self.free_frame(page.base());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryRegionKind;

    const MIB: u64 = 1024 * 1024;

    fn kernel(start: u32, end: u32) -> KernelImage {
        KernelImage {
            start: PhysicalAddress::new(start),
            end: PhysicalAddress::new(end),
        }
    }

    fn qemu_map(top: u64) -> Vec<MemoryMapEntry> {
        vec![
            MemoryMapEntry::new(0, 0x9_FC00, MemoryRegionKind::Available),
            MemoryMapEntry::new(0x9_FC00, 0x400, MemoryRegionKind::Reserved),
            MemoryMapEntry::new(0xF_0000, 0x1_0000, MemoryRegionKind::Reserved),
            MemoryMapEntry::new(MIB, top - MIB, MemoryRegionKind::Available),
            MemoryMapEntry::new(0xFFFC_0000, 0x4_0000, MemoryRegionKind::Reserved),
        ]
    }

    fn build<'a>(
        map: &[MemoryMapEntry],
        kernel: &KernelImage,
        storage: &'a mut Vec<u32>,
    ) -> BitmapFrameAlloc<'a> {
        let placement = BitmapPlacement::plan(map.iter().copied(), kernel).expect("plan");
        storage.resize(placement.words as usize, 0xFFFF_FFFF);
        BitmapFrameAlloc::new(&placement, storage, map.iter().copied(), kernel).expect("init")
    }

    #[test]
    fn placement_follows_kernel_end() {
        let map = qemu_map(32 * MIB);
        let p = BitmapPlacement::plan(map, &kernel(0x10_0000, 0x12_3457)).unwrap();
        assert_eq!(p.base, PhysicalAddress::new(0x12_3458));
        assert_eq!(p.total_frames, 8192);
        assert_eq!(p.words, 256);
        assert_eq!(p.highest_address, 32 * MIB);
        assert_eq!(p.map_entries, 5);
        assert_eq!(p.usable_bytes, 0x9_FC00 + 31 * MIB);
    }

    #[test]
    fn plan_without_available_memory_fails() {
        let map = [MemoryMapEntry::new(0, MIB, MemoryRegionKind::Reserved)];
        assert_eq!(
            BitmapPlacement::plan(map, &kernel(0x10_0000, 0x11_0000)),
            Err(FrameAllocError::NoAvailableMemory)
        );
    }

    #[test]
    fn records_above_4_gib_are_ignored() {
        let mut map = qemu_map(16 * MIB);
        map.push(MemoryMapEntry::new(
            0x1_0000_0000,
            0x4000_0000,
            MemoryRegionKind::Available,
        ));
        let p = BitmapPlacement::plan(map, &kernel(0x10_0000, 0x11_0000)).unwrap();
        assert_eq!(p.highest_address, 16 * MIB);
    }

    #[test]
    fn reserved_low_kernel_and_bitmap_are_marked() {
        let map = qemu_map(16 * MIB);
        let k = kernel(0x10_0000, 0x14_0000);
        let mut storage = Vec::new();
        let frames = build(&map, &k, &mut storage);

        // 256 low frames + kernel (0x40 frames) + bitmap (1 frame)
        assert_eq!(frames.used_frames(), 256 + 0x40 + 1);
        assert!(frames.is_allocated(PhysicalAddress::new(0)));
        assert!(frames.is_allocated(PhysicalAddress::new(0x9_F000)));
        assert!(frames.is_allocated(PhysicalAddress::new(0x13_F000)));
        assert!(frames.is_allocated(PhysicalAddress::new(0x14_0000)));
        assert!(!frames.is_allocated(PhysicalAddress::new(0x14_1000)));
    }

    #[test]
    fn first_allocation_follows_bitmap() {
        let map = qemu_map(16 * MIB);
        let k = kernel(0x10_0000, 0x14_0000);
        let mut storage = Vec::new();
        let mut frames = build(&map, &k, &mut storage);

        assert_eq!(frames.allocate_frame(), Some(PhysicalAddress::new(0x14_1000)));
        assert_eq!(frames.allocate_frame(), Some(PhysicalAddress::new(0x14_2000)));
    }

    #[test]
    fn conservation_holds_across_operations() {
        let map = qemu_map(8 * MIB);
        let k = kernel(0x10_0000, 0x10_8000);
        let mut storage = Vec::new();
        let mut frames = build(&map, &k, &mut storage);

        let mut live = Vec::new();
        for _ in 0..100 {
            live.push(frames.allocate_frame().unwrap());
            assert_eq!(
                frames.used_frames() + frames.free_frames(),
                frames.total_frames()
            );
        }
        for pa in live.iter().step_by(3) {
            frames.free_frame(*pa);
            assert_eq!(
                frames.used_frames() + frames.free_frames(),
                frames.total_frames()
            );
        }
        let stats = frames.stats();
        assert_eq!(stats.allocations, 100);
        assert_eq!(stats.frees, 34);
        assert_eq!(stats.peak_used_frames, stats.used_frames + 34);
    }

    #[test]
    fn live_frames_are_unique() {
        let map = qemu_map(4 * MIB);
        let k = kernel(0x10_0000, 0x10_8000);
        let mut storage = Vec::new();
        let mut frames = build(&map, &k, &mut storage);

        let mut live = std::collections::HashSet::new();
        for round in 0..50u32 {
            let pa = frames.allocate_frame().unwrap();
            assert!(live.insert(pa), "frame {pa} handed out twice");
            if round % 4 == 0 {
                let victim = *live.iter().next().unwrap();
                live.remove(&victim);
                frames.free_frame(victim);
            }
        }
    }

    #[test]
    fn exhaust_then_free_then_allocate_again() {
        let map = qemu_map(2 * MIB);
        let k = kernel(0x10_0000, 0x10_4000);
        let mut storage = Vec::new();
        let mut frames = build(&map, &k, &mut storage);

        let mut handed_out = Vec::new();
        while let Some(pa) = frames.allocate_frame() {
            assert_ne!(pa.as_u32(), 0);
            handed_out.push(pa);
        }
        assert_eq!(frames.free_frames(), 0);
        assert_eq!(frames.allocate_frame(), None);

        let victim = handed_out[handed_out.len() / 2];
        frames.free_frame(victim);
        assert_eq!(frames.allocate_frame(), Some(victim));
    }

    #[test]
    fn hint_rewinds_to_lowest_freed_frame() {
        let map = qemu_map(4 * MIB);
        let k = kernel(0x10_0000, 0x10_4000);
        let mut storage = Vec::new();
        let mut frames = build(&map, &k, &mut storage);

        let a = frames.allocate_frame().unwrap();
        let b = frames.allocate_frame().unwrap();
        let _c = frames.allocate_frame().unwrap();
        frames.free_frame(b);
        frames.free_frame(a);
        assert_eq!(frames.allocate_frame(), Some(a));
        assert_eq!(frames.allocate_frame(), Some(b));
    }

    #[test]
    fn invalid_frees_are_ignored() {
        let map = qemu_map(4 * MIB);
        let k = kernel(0x10_0000, 0x10_4000);
        let mut storage = Vec::new();
        let mut frames = build(&map, &k, &mut storage);
        let used = frames.used_frames();

        frames.free_frame(PhysicalAddress::new(0x20_0123));
        frames.free_frame(PhysicalAddress::new(0x4000_0000));
        // already free
        frames.free_frame(PhysicalAddress::new(0x30_0000));
        assert_eq!(frames.used_frames(), used);
        assert_eq!(frames.stats().frees, 0);
    }

    #[test]
    fn holes_in_the_map_stay_free() {
        let map = [
            MemoryMapEntry::new(0, 0x9_F000, MemoryRegionKind::Available),
            MemoryMapEntry::new(MIB, MIB, MemoryRegionKind::Available),
            MemoryMapEntry::new(4 * MIB, MIB, MemoryRegionKind::Available),
        ];
        let k = kernel(0x10_0000, 0x10_1000);
        let mut storage = Vec::new();
        let frames = build(&map, &k, &mut storage);
        assert_eq!(frames.total_frames(), 1280);
        assert!(!frames.is_allocated(PhysicalAddress::new(3 * MIB as u32)));
    }

    #[test]
    fn byte_statistics() {
        let map = qemu_map(16 * MIB);
        let k = kernel(0x10_0000, 0x14_0000);
        let mut storage = Vec::new();
        let frames = build(&map, &k, &mut storage);

        assert_eq!(frames.total_memory_bytes(), 16 * MIB);
        assert_eq!(frames.used_memory_bytes(), u64::from(frames.used_frames()) * 4096);
        assert_eq!(
            frames.used_memory_bytes() + frames.free_memory_bytes(),
            u64::from(frames.total_frames()) * 4096
        );
    }

    #[test]
    fn storage_must_hold_the_bitmap() {
        let map = qemu_map(16 * MIB);
        let k = kernel(0x10_0000, 0x14_0000);
        let placement = BitmapPlacement::plan(map.iter().copied(), &k).unwrap();
        let mut storage = vec![0u32; 4];
        assert!(matches!(
            BitmapFrameAlloc::new(&placement, &mut storage, map.iter().copied(), &k),
            Err(FrameAllocError::StorageTooSmall { needed: 128, got: 4 })
        ));
    }
}
