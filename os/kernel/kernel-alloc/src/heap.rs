//! # Kernel heap
//!
//! A first-fit allocator over a single growable virtual arena. Blocks are
//! laid out back to back from the arena start; each carries a
//! [`BlockHeader`] linking it to its address-order neighbours, so walking
//! `next` from the first block covers the arena exactly, without gaps.
//!
//! - **Allocate**: round the request to 4 bytes, add the header, take the
//!   first free block that fits and split off the tail if it can hold
//!   another header plus [`SPLIT_SLACK`] bytes. When nothing fits, grow the
//!   arena once and retry.
//! - **Free**: merge with every free block that follows, then with a free
//!   predecessor. Absorbed headers lose their magic.
//! - **Grow**: map whole pages at the arena end (all or nothing, bounded by
//!   [`HeapConfig::max_size`]), then extend the last block if it is free or
//!   append a new free block.
//!
//! [`KernelHeap`] only keeps the arena bounds; the block list lives in heap
//! memory and is reached through a [`HeapBacking`] passed to every call.

mod backing;
mod block;

pub use backing::HeapBacking;
pub use block::{BLOCK_MAGIC, BlockHeader, HEADER_SIZE};
pub(crate) use block::SPLIT_SLACK;

use kernel_info::memory::{HEAP_INITIAL_SIZE, HEAP_MAX_SIZE, HEAP_START};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, pages_for};
use log::{debug, error, info, warn};

/// Upper bound on blocks visited by a single walk; a longer list is
/// treated as cyclic.
pub const MAX_BLOCKS: u32 = 10_000;

/// Placement and limits of the heap arena.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapConfig {
    /// First byte of the arena; page-aligned and non-zero.
    pub start: VirtualAddress,
    /// Bytes mapped by [`KernelHeap::init`]; a multiple of the page size.
    pub initial_size: u32,
    /// Hard cap on the arena size.
    pub max_size: u32,
}

impl HeapConfig {
    #[must_use]
    pub const fn new(start: VirtualAddress, initial_size: u32, max_size: u32) -> Self {
        Self {
            start,
            initial_size,
            max_size,
        }
    }

    /// # Errors
    /// [`HeapError::InvalidConfig`] unless `start` is page-aligned and
    /// non-zero, `initial_size` is a non-zero page multiple no larger than
    /// `max_size`, and the whole range fits in the address space.
    pub fn validate(&self) -> Result<(), HeapError> {
        let fits = self.start.checked_add(self.max_size).is_some();
        if self.start.as_u32() == 0
            || !self.start.is_page_aligned()
            || self.initial_size == 0
            || !self.initial_size.is_multiple_of(PAGE_SIZE)
            || self.initial_size > self.max_size
            || !fits
        {
            return Err(HeapError::InvalidConfig(*self));
        }
        Ok(())
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new(
            VirtualAddress::new(HEAP_START),
            HEAP_INITIAL_SIZE,
            HEAP_MAX_SIZE,
        )
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("heap not initialized")]
    NotInitialized,
    #[error("heap already initialized")]
    AlreadyInitialized,
    #[error("invalid heap configuration {0:?}")]
    InvalidConfig(HeapConfig),
    #[error("zero-sized or oversized allocation request")]
    InvalidSize,
    #[error("out of physical memory while growing the heap")]
    OutOfMemory,
    #[error("growing the heap by {requested} bytes would exceed its {max} byte limit")]
    LimitExceeded { requested: u32, max: u32 },
    #[error("heap corruption detected at {0}")]
    Corrupted(VirtualAddress),
    #[error("{0} does not point into the heap")]
    InvalidPointer(VirtualAddress),
    #[error("double free of {0}")]
    DoubleFree(VirtualAddress),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapValidationError {
    #[error("heap not initialized")]
    NotInitialized,
    #[error("invalid magic number at {0}")]
    BadMagic(VirtualAddress),
    #[error("invalid block size {size} at {at}")]
    BadSize { at: VirtualAddress, size: u32 },
    #[error("block at {at} of {size} bytes out of bounds")]
    OutOfBounds { at: VirtualAddress, size: u32 },
    #[error("back link of block at {0} does not match its predecessor")]
    BrokenLink(VirtualAddress),
    #[error("block at {at} does not start where its predecessor ends ({expected})")]
    Gap {
        at: VirtualAddress,
        expected: VirtualAddress,
    },
    #[error("last block ends at {last_end}, heap ends at {heap_end}")]
    EndMismatch {
        last_end: VirtualAddress,
        heap_end: VirtualAddress,
    },
    #[error("too many blocks (possible loop)")]
    TooManyBlocks,
}

/// Block-list summary. Byte counts include headers.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeapStats {
    pub heap_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub allocated_blocks: u32,
    pub free_bytes: u32,
    pub allocated_bytes: u32,
    pub largest_free_block: u32,
}

/// A block visited by [`KernelHeap::blocks`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Block {
    pub at: VirtualAddress,
    pub header: BlockHeader,
}

impl Block {
    /// Address handed out to callers for this block.
    #[must_use]
    pub fn payload(&self) -> VirtualAddress {
        self.at + HEADER_SIZE
    }
}

/// The kernel heap's arena bookkeeping.
#[derive(Debug)]
pub struct KernelHeap {
    config: HeapConfig,
    end: VirtualAddress,
    initialized: bool,
}

impl KernelHeap {
    #[must_use]
    pub const fn new(config: HeapConfig) -> Self {
        Self {
            config,
            end: config.start,
            initialized: false,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.config.start
    }

    /// One past the last mapped arena byte.
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    /// Bytes currently mapped for the arena.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.end.as_u32() - self.config.start.as_u32()
    }

    /// Map the initial arena and lay a single free block over it.
    ///
    /// # Errors
    /// - [`HeapError::AlreadyInitialized`] on a second call.
    /// - [`HeapError::InvalidConfig`] for an unusable [`HeapConfig`].
    /// - Whatever [`HeapBacking::map_page`] reports; nothing stays mapped then.
    pub fn init<B: HeapBacking>(&mut self, backing: &mut B) -> Result<(), HeapError> {
        if self.initialized {
            return Err(HeapError::AlreadyInitialized);
        }
        self.config.validate()?;

        let start = self.config.start;
        let size = self.config.initial_size;
        map_pages(backing, start, pages_for(size))?;
        store(backing, start, &BlockHeader::new_free(size, None, None));

        self.end = start + size;
        self.initialized = true;
        info!(
            "kernel heap at {start}: {} KiB mapped, {} KiB max",
            size / 1024,
            self.config.max_size / 1024
        );
        Ok(())
    }

    /// Allocate at least `size` bytes; the result is 4-byte aligned.
    ///
    /// # Errors
    /// - [`HeapError::InvalidSize`] for `size == 0` or a size that cannot be represented.
    /// - [`HeapError::Corrupted`] if a header on the way has a bad magic.
    /// - [`HeapError::LimitExceeded`] / [`HeapError::OutOfMemory`] if growing fails.
    pub fn allocate<B: HeapBacking>(
        &mut self,
        backing: &mut B,
        size: u32,
    ) -> Result<VirtualAddress, HeapError> {
        if !self.initialized {
            return Err(HeapError::NotInitialized);
        }
        let total = block_size_for(size)?;

        if let Some(at) = self.find_fit(backing, total)? {
            return Ok(self.take(backing, at, total));
        }

        self.expand(backing, total)?;
        match self.find_fit(backing, total)? {
            Some(at) => Ok(self.take(backing, at, total)),
            None => Err(HeapError::OutOfMemory),
        }
    }

    /// Allocate `count * size` zeroed bytes.
    ///
    /// # Errors
    /// As [`allocate`](Self::allocate); an overflowing product is [`HeapError::InvalidSize`].
    pub fn allocate_zeroed<B: HeapBacking>(
        &mut self,
        backing: &mut B,
        count: u32,
        size: u32,
    ) -> Result<VirtualAddress, HeapError> {
        let bytes = count.checked_mul(size).ok_or(HeapError::InvalidSize)?;
        let ptr = self.allocate(backing, bytes)?;
        backing.fill(ptr, bytes, 0);
        Ok(ptr)
    }

    /// Resize the allocation at `ptr`.
    ///
    /// `None` allocates, `new_size == 0` frees and yields `Ok(None)`. A block
    /// that already has room is returned unchanged; otherwise the contents
    /// move to a new block and the old one is freed.
    ///
    /// # Errors
    /// As [`allocate`](Self::allocate) and [`free`](Self::free). On error the
    /// original allocation is untouched.
    pub fn reallocate<B: HeapBacking>(
        &mut self,
        backing: &mut B,
        ptr: Option<VirtualAddress>,
        new_size: u32,
    ) -> Result<Option<VirtualAddress>, HeapError> {
        let Some(ptr) = ptr else {
            return self.allocate(backing, new_size).map(Some);
        };
        if new_size == 0 {
            self.free(backing, ptr)?;
            return Ok(None);
        }

        let (_, header) = self.header_of(backing, ptr)?;
        if !header.is_valid() {
            return Err(HeapError::Corrupted(ptr));
        }
        if header.free {
            warn!("reallocation of freed block {ptr}");
            return Err(HeapError::DoubleFree(ptr));
        }
        let capacity = header.capacity();
        if round_up_4(new_size)? <= capacity {
            return Ok(Some(ptr));
        }

        let moved = self.allocate(backing, new_size)?;
        backing.copy(moved, ptr, capacity.min(new_size));
        self.free(backing, ptr)?;
        Ok(Some(moved))
    }

    /// Release the allocation at `ptr` and coalesce with free neighbours.
    ///
    /// # Errors
    /// - [`HeapError::InvalidPointer`] if `ptr` cannot be a payload address.
    /// - [`HeapError::Corrupted`] if the header's magic is wrong.
    /// - [`HeapError::DoubleFree`] if the block is already free.
    ///
    /// The heap is left unchanged in all error cases.
    pub fn free<B: HeapBacking>(
        &mut self,
        backing: &mut B,
        ptr: VirtualAddress,
    ) -> Result<(), HeapError> {
        let (at, mut header) = self.header_of(backing, ptr)?;
        if !header.is_valid() {
            error!("invalid heap block {ptr} passed to free");
            return Err(HeapError::Corrupted(ptr));
        }
        if header.free {
            warn!("double free of {ptr}");
            return Err(HeapError::DoubleFree(ptr));
        }

        header.free = true;
        self.coalesce(backing, at, header);
        Ok(())
    }

    /// Payload capacity of the block at `ptr`, or `None` if `ptr` does not
    /// carry a valid header.
    #[must_use]
    pub fn allocated_size_of<B: HeapBacking>(&self, backing: &B, ptr: VirtualAddress) -> Option<u32> {
        let (_, header) = self.header_of(backing, ptr).ok()?;
        header.is_valid().then_some(header.capacity())
    }

    /// Walk the block list from the arena start.
    ///
    /// The walk stops after a block with a bad magic, at a link leaving the
    /// arena, or after [`MAX_BLOCKS`] blocks.
    #[must_use]
    pub fn blocks<'b, B: HeapBacking>(&self, backing: &'b B) -> Blocks<'b, B> {
        Blocks {
            backing,
            cursor: self.initialized.then_some(self.config.start),
            start: self.config.start,
            end: self.end,
            visited: 0,
        }
    }

    #[must_use]
    pub fn stats<B: HeapBacking>(&self, backing: &B) -> HeapStats {
        let mut stats = HeapStats {
            heap_size: self.size(),
            ..HeapStats::default()
        };
        for block in self.blocks(backing) {
            let h = block.header;
            stats.total_blocks += 1;
            if h.free {
                stats.free_blocks += 1;
                stats.free_bytes += h.size;
                stats.largest_free_block = stats.largest_free_block.max(h.size);
            } else {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += h.size;
            }
        }
        stats
    }

    /// Check every header and the list's coverage of the arena.
    ///
    /// Returns the number of blocks on success.
    ///
    /// # Errors
    /// The first inconsistency found.
    pub fn validate<B: HeapBacking>(&self, backing: &B) -> Result<u32, HeapValidationError> {
        let result = self.check_blocks(backing);
        match &result {
            Ok(count) => debug!("heap validation passed: {count} blocks"),
            Err(e) => error!("heap validation failed: {e}"),
        }
        result
    }

    fn check_blocks<B: HeapBacking>(&self, backing: &B) -> Result<u32, HeapValidationError> {
        if !self.initialized {
            return Err(HeapValidationError::NotInitialized);
        }

        let mut cursor = Some(self.config.start);
        let mut expected = self.config.start;
        let mut prev = None;
        let mut count = 0u32;

        while let Some(at) = cursor {
            count += 1;
            if count > MAX_BLOCKS {
                return Err(HeapValidationError::TooManyBlocks);
            }
            if !self.header_in_bounds(at) {
                return Err(HeapValidationError::OutOfBounds { at, size: 0 });
            }

            let h = load(backing, at);
            if !h.is_valid() {
                return Err(HeapValidationError::BadMagic(at));
            }
            if h.size < HEADER_SIZE || !h.size.is_multiple_of(4) {
                return Err(HeapValidationError::BadSize { at, size: h.size });
            }
            let block_end = at
                .checked_add(h.size)
                .filter(|e| *e <= self.end)
                .ok_or(HeapValidationError::OutOfBounds { at, size: h.size })?;
            if h.prev != prev {
                return Err(HeapValidationError::BrokenLink(at));
            }
            if at != expected {
                return Err(HeapValidationError::Gap { at, expected });
            }

            expected = block_end;
            prev = Some(at);
            cursor = h.next;
        }

        if expected != self.end {
            return Err(HeapValidationError::EndMismatch {
                last_end: expected,
                heap_end: self.end,
            });
        }
        Ok(count)
    }

    /// Grow the arena by at least `min_increase` bytes (rounded to pages).
    fn expand<B: HeapBacking>(&mut self, backing: &mut B, min_increase: u32) -> Result<(), HeapError> {
        let pages = pages_for(min_increase);
        let max = self.config.max_size;
        let increase = pages
            .checked_mul(PAGE_SIZE)
            .filter(|inc| self.size().checked_add(*inc).is_some_and(|s| s <= max))
            .ok_or_else(|| {
                debug!("heap growth by {min_increase} bytes refused, limit {max}");
                HeapError::LimitExceeded {
                    requested: min_increase,
                    max,
                }
            })?;

        let last_at = self.last_block(backing)?;
        let old_end = self.end;
        map_pages(backing, old_end, pages)?;

        let mut last = load(backing, last_at);
        if last.free {
            last.size += increase;
            store(backing, last_at, &last);
        } else {
            store(
                backing,
                old_end,
                &BlockHeader::new_free(increase, Some(last_at), None),
            );
            last.next = Some(old_end);
            store(backing, last_at, &last);
        }

        self.end = old_end + increase;
        debug!(
            "heap grown by {} KiB to {} KiB",
            increase / 1024,
            self.size() / 1024
        );
        Ok(())
    }

    /// First free block of at least `total` bytes.
    fn find_fit<B: HeapBacking>(
        &self,
        backing: &B,
        total: u32,
    ) -> Result<Option<VirtualAddress>, HeapError> {
        let mut cursor = Some(self.config.start);
        let mut visited = 0u32;
        while let Some(at) = cursor {
            let h = self.checked_load(backing, at, visited)?;
            if h.free && h.size >= total {
                return Ok(Some(at));
            }
            visited += 1;
            cursor = h.next;
        }
        Ok(None)
    }

    fn last_block<B: HeapBacking>(&self, backing: &B) -> Result<VirtualAddress, HeapError> {
        let mut at = self.config.start;
        let mut visited = 0u32;
        loop {
            let h = self.checked_load(backing, at, visited)?;
            match h.next {
                Some(next) => at = next,
                None => return Ok(at),
            }
            visited += 1;
        }
    }

    /// Load the header at `at` during a walk, refusing anything that does not
    /// look like a block.
    fn checked_load<B: HeapBacking>(
        &self,
        backing: &B,
        at: VirtualAddress,
        visited: u32,
    ) -> Result<BlockHeader, HeapError> {
        if visited >= MAX_BLOCKS || !self.header_in_bounds(at) {
            error!("heap corruption detected at {at}");
            return Err(HeapError::Corrupted(at));
        }
        let h = load(backing, at);
        if !h.is_valid() {
            error!("heap corruption detected at {at}");
            return Err(HeapError::Corrupted(at));
        }
        Ok(h)
    }

    /// Mark the free block at `at` allocated, splitting off its tail when
    /// large enough. Returns the payload address.
    fn take<B: HeapBacking>(&self, backing: &mut B, at: VirtualAddress, total: u32) -> VirtualAddress {
        let mut h = load(backing, at);
        if h.size >= total + HEADER_SIZE + SPLIT_SLACK {
            let tail_at = at + total;
            let tail = BlockHeader::new_free(h.size - total, Some(at), h.next);
            store(backing, tail_at, &tail);
            if let Some(next) = h.next {
                set_prev(backing, next, Some(tail_at));
            }
            h.next = Some(tail_at);
            h.size = total;
        }
        h.free = false;
        store(backing, at, &h);
        at + HEADER_SIZE
    }

    /// Merge the just-freed block at `at` forward with every free successor,
    /// then backward with a free predecessor.
    fn coalesce<B: HeapBacking>(&self, backing: &mut B, at: VirtualAddress, mut h: BlockHeader) {
        while let Some(next_at) = h.next {
            let next = load(backing, next_at);
            if !next.free || !next.is_valid() {
                break;
            }
            h.size += next.size;
            h.next = next.next;
            if let Some(after) = next.next {
                set_prev(backing, after, Some(at));
            }
            invalidate(backing, next_at);
        }
        store(backing, at, &h);

        if let Some(prev_at) = h.prev {
            let mut prev = load(backing, prev_at);
            if prev.free && prev.is_valid() {
                prev.size += h.size;
                prev.next = h.next;
                if let Some(after) = h.next {
                    set_prev(backing, after, Some(prev_at));
                }
                store(backing, prev_at, &prev);
                invalidate(backing, at);
            }
        }
    }

    /// Header address for payload `ptr`, plus the header itself.
    fn header_of<B: HeapBacking>(
        &self,
        backing: &B,
        ptr: VirtualAddress,
    ) -> Result<(VirtualAddress, BlockHeader), HeapError> {
        if !self.initialized {
            return Err(HeapError::NotInitialized);
        }
        let at = ptr
            .checked_offset_from(self.config.start)
            .filter(|off| *off >= HEADER_SIZE && off.is_multiple_of(4))
            .map(|_| VirtualAddress::new(ptr.as_u32() - HEADER_SIZE))
            .filter(|at| self.header_in_bounds(*at))
            .ok_or(HeapError::InvalidPointer(ptr))?;
        Ok((at, load(backing, at)))
    }

    fn header_in_bounds(&self, at: VirtualAddress) -> bool {
        at >= self.config.start && at.checked_add(HEADER_SIZE).is_some_and(|e| e <= self.end)
    }
}

/// Iterator over the heap's block list; see [`KernelHeap::blocks`].
pub struct Blocks<'b, B> {
    backing: &'b B,
    cursor: Option<VirtualAddress>,
    start: VirtualAddress,
    end: VirtualAddress,
    visited: u32,
}

impl<B: HeapBacking> Iterator for Blocks<'_, B> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let at = self.cursor.take()?;
        let in_bounds =
            at >= self.start && at.checked_add(HEADER_SIZE).is_some_and(|e| e <= self.end);
        if !in_bounds || self.visited >= MAX_BLOCKS {
            return None;
        }
        self.visited += 1;
        let header = load(self.backing, at);
        if header.is_valid() {
            self.cursor = header.next;
        }
        Some(Block { at, header })
    }
}

/// Block size (header included) serving a `size`-byte request.
fn block_size_for(size: u32) -> Result<u32, HeapError> {
    if size == 0 {
        return Err(HeapError::InvalidSize);
    }
    round_up_4(size)?
        .checked_add(HEADER_SIZE)
        .ok_or(HeapError::InvalidSize)
}

fn round_up_4(size: u32) -> Result<u32, HeapError> {
    size.checked_add(3)
        .map(|s| s & !3)
        .ok_or(HeapError::InvalidSize)
}

/// Map `pages` consecutive pages from `from`; on failure unmap what was
/// mapped so far.
fn map_pages<B: HeapBacking>(backing: &mut B, from: VirtualAddress, pages: u32) -> Result<(), HeapError> {
    for i in 0..pages {
        if let Err(e) = backing.map_page(from + i * PAGE_SIZE) {
            for j in 0..i {
                backing.unmap_page(from + j * PAGE_SIZE);
            }
            debug!("heap mapping at {from} failed after {i} of {pages} pages");
            return Err(e);
        }
    }
    Ok(())
}

fn load<B: HeapBacking>(backing: &B, at: VirtualAddress) -> BlockHeader {
    let mut raw = [0u8; HEADER_SIZE as usize];
    backing.read(at, &mut raw);
    BlockHeader::from_bytes(&raw)
}

fn store<B: HeapBacking>(backing: &mut B, at: VirtualAddress, header: &BlockHeader) {
    backing.write(at, &header.to_bytes());
}

fn set_prev<B: HeapBacking>(backing: &mut B, at: VirtualAddress, prev: Option<VirtualAddress>) {
    let mut h = load(backing, at);
    h.prev = prev;
    store(backing, at, &h);
}

/// Clear the magic of an absorbed header.
fn invalidate<B: HeapBacking>(backing: &mut B, at: VirtualAddress) {
    backing.write(at, &0u32.to_le_bytes());
}
