use crate::MemoryInitError;
use crate::backing::{HeapAccess, PagedHeapBacking};
use kernel_alloc::frame_alloc::{BitmapFrameAlloc, FrameStats};
use kernel_alloc::heap::{HeapConfig, HeapError, HeapStats, HeapValidationError, KernelHeap};
use kernel_info::memory::IDENTITY_MAP_BYTES;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_vmem::{AddressSpace, MapError, PageFlags, PageWalk, PhysMapper};
use log::{debug, info, warn};

/// Frames, page tables and heap of the kernel's single address space.
pub struct MemoryManager<'a, M: PhysMapper> {
    mapper: &'a M,
    frames: BitmapFrameAlloc<'a>,
    space: AddressSpace<'a, M>,
    heap: KernelHeap,
    access: HeapAccess,
}

impl<'a, M: PhysMapper> MemoryManager<'a, M> {
    /// Take over `frames`, build the page directory and identity-map the
    /// first 4 MiB. Paging is not switched on yet.
    ///
    /// # Errors
    /// [`MemoryInitError::Paging`] if the directory or the identity page
    /// table cannot be allocated.
    pub fn new(mapper: &'a M, mut frames: BitmapFrameAlloc<'a>) -> Result<Self, MemoryInitError> {
        let space = AddressSpace::new(mapper, &mut frames)?;
        space.identity_map(
            &mut frames,
            PhysicalAddress::zero(),
            IDENTITY_MAP_BYTES,
            PageFlags::KERNEL_RW,
        )?;
        info!(
            "page directory at {}, {} MiB identity mapped",
            space.root_page(),
            IDENTITY_MAP_BYTES >> 20
        );

        Ok(Self {
            mapper,
            frames,
            space,
            heap: KernelHeap::new(HeapConfig::default()),
            access: HeapAccess::PageTables,
        })
    }

    /// Load CR3 and set CR0.PG. Heap memory is dereferenced directly from
    /// then on.
    ///
    /// # Safety
    /// Must run at CPL0 with the running code, its stack and the frame
    /// bitmap inside the identity-mapped window.
    pub unsafe fn activate_paging(&mut self) {
        // SAFETY: forwarded to the caller.
        unsafe { self.space.activate() };
        self.access = HeapAccess::Direct;
        info!("paging enabled");
    }

    /// Create the page tables for the whole heap range, then map the
    /// initial arena described by `config`.
    ///
    /// The tables are taken before any heap page so that they land in the
    /// low frames the mapper reaches; heap growth never needs a new table.
    ///
    /// # Errors
    /// - [`HeapError::OutOfMemory`] if the page tables cannot be created.
    /// - Otherwise as [`KernelHeap::init`].
    ///
    /// On failure the heap's empty page tables are given back.
    pub fn init_heap(&mut self, config: HeapConfig) -> Result<(), HeapError> {
        if self.heap.is_initialized() {
            return Err(HeapError::AlreadyInitialized);
        }
        config.validate()?;

        let reserved = self.space.reserve_tables(
            &mut self.frames,
            config.start,
            config.max_size,
            PageFlags::KERNEL_RW,
        );
        let result = match reserved {
            Ok(tables) => {
                debug!("{tables} page tables reserved for the heap at {}", config.start);
                self.heap = KernelHeap::new(config);
                let (heap, mut backing) = self.split_heap();
                heap.init(&mut backing)
            }
            Err(e) => {
                warn!("cannot reserve heap page tables: {e}");
                Err(HeapError::OutOfMemory)
            }
        };

        if result.is_err() {
            self.space
                .release_tables(&mut self.frames, config.start, config.max_size);
        }
        result
    }

    /// Direct access to heap memory, e.g. for reading back a payload.
    pub fn heap_backing(&mut self) -> PagedHeapBacking<'_, 'a, M> {
        self.split_heap().1
    }

    fn split_heap(&mut self) -> (&mut KernelHeap, PagedHeapBacking<'_, 'a, M>) {
        let backing = PagedHeapBacking {
            frames: &mut self.frames,
            space: &self.space,
            mapper: self.mapper,
            access: self.access,
        };
        (&mut self.heap, backing)
    }

    #[must_use]
    pub const fn access(&self) -> HeapAccess {
        self.access
    }

    #[must_use]
    pub const fn frames(&self) -> &BitmapFrameAlloc<'a> {
        &self.frames
    }

    #[must_use]
    pub const fn address_space(&self) -> &AddressSpace<'a, M> {
        &self.space
    }

    #[must_use]
    pub const fn heap(&self) -> &KernelHeap {
        &self.heap
    }

    pub fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
        self.frames.allocate_frame()
    }

    pub fn free_frame(&mut self, pa: PhysicalAddress) {
        self.frames.free_frame(pa);
    }

    #[must_use]
    pub const fn frame_stats(&self) -> FrameStats {
        self.frames.stats()
    }

    /// Map the page containing `va` onto the frame containing `pa`, taking a
    /// page-table frame from the bitmap if the region has none.
    ///
    /// # Errors
    /// - [`MapError::OutOfMemory`] if a page table was needed and no frame was free.
    /// - [`MapError::UnreachableTable`] if the free frame lies outside what
    ///   the mapper reaches.
    pub fn map(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        self.space.map(&mut self.frames, va, pa, flags)
    }

    /// Clear the mapping of `va`. The frame stays allocated.
    pub fn unmap(&mut self, va: VirtualAddress) -> Option<PhysicalPage> {
        self.space.unmap(va)
    }

    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space.translate(va)
    }

    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.space.is_mapped(va)
    }

    #[must_use]
    pub fn walk(&self, va: VirtualAddress) -> PageWalk {
        self.space.walk(va)
    }

    /// # Errors
    /// As [`KernelHeap::allocate`].
    pub fn allocate(&mut self, size: u32) -> Result<VirtualAddress, HeapError> {
        let (heap, mut backing) = self.split_heap();
        heap.allocate(&mut backing, size)
    }

    /// # Errors
    /// As [`KernelHeap::allocate_zeroed`].
    pub fn allocate_zeroed(&mut self, count: u32, size: u32) -> Result<VirtualAddress, HeapError> {
        let (heap, mut backing) = self.split_heap();
        heap.allocate_zeroed(&mut backing, count, size)
    }

    /// # Errors
    /// As [`KernelHeap::reallocate`].
    pub fn reallocate(
        &mut self,
        ptr: Option<VirtualAddress>,
        new_size: u32,
    ) -> Result<Option<VirtualAddress>, HeapError> {
        let (heap, mut backing) = self.split_heap();
        heap.reallocate(&mut backing, ptr, new_size)
    }

    /// # Errors
    /// As [`KernelHeap::free`].
    pub fn free(&mut self, ptr: VirtualAddress) -> Result<(), HeapError> {
        let (heap, mut backing) = self.split_heap();
        heap.free(&mut backing, ptr)
    }

    pub fn allocated_size_of(&mut self, ptr: VirtualAddress) -> Option<u32> {
        let (heap, backing) = self.split_heap();
        heap.allocated_size_of(&backing, ptr)
    }

    pub fn heap_stats(&mut self) -> HeapStats {
        let (heap, backing) = self.split_heap();
        heap.stats(&backing)
    }

    /// # Errors
    /// As [`KernelHeap::validate`].
    pub fn heap_validate(&mut self) -> Result<u32, HeapValidationError> {
        let (heap, backing) = self.split_heap();
        heap.validate(&backing)
    }
}
