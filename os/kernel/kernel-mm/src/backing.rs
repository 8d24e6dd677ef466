//! Heap memory seen through the kernel's own page tables.

use core::ptr;
use kernel_alloc::frame_alloc::BitmapFrameAlloc;
use kernel_alloc::heap::{HeapBacking, HeapError};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::{AddressSpace, PageFlags, PhysMapper};
use log::{debug, error};

/// How heap bytes are reached.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HeapAccess {
    /// Translate each heap page through the page tables and touch the frame
    /// through the [`PhysMapper`]. Works before paging is switched on.
    PageTables,
    /// Dereference heap virtual addresses directly. Only valid once the
    /// address space is active.
    Direct,
}

/// [`HeapBacking`] that takes heap frames from the frame bitmap and maps
/// them into the kernel address space.
pub struct PagedHeapBacking<'s, 'a, M: PhysMapper> {
    pub(crate) frames: &'s mut BitmapFrameAlloc<'a>,
    pub(crate) space: &'s AddressSpace<'a, M>,
    pub(crate) mapper: &'a M,
    pub(crate) access: HeapAccess,
}

impl<M: PhysMapper> PagedHeapBacking<'_, '_, M> {
    /// Split `[va, va + len)` at page boundaries and hand every piece's
    /// host pointer (or `None` if unmapped), buffer offset and length to `f`.
    #[allow(clippy::cast_possible_truncation)]
    fn for_each_piece(
        &self,
        va: VirtualAddress,
        len: usize,
        mut f: impl FnMut(Option<*mut u8>, usize, usize),
    ) {
        if self.access == HeapAccess::Direct {
            f(Some(va.as_u32() as usize as *mut u8), 0, len);
            return;
        }

        let mut done = 0usize;
        while done < len {
            let at = va + done as u32;
            let in_page = (PAGE_SIZE - at.offset().as_u32()) as usize;
            let n = in_page.min(len - done);
            let host = self
                .space
                .translate(at)
                .map(|pa| self.mapper.phys_to_ptr(pa));
            if host.is_none() {
                error!("heap access to unmapped page at {at}");
            }
            f(host, done, n);
            done += n;
        }
    }
}

impl<M: PhysMapper> HeapBacking for PagedHeapBacking<'_, '_, M> {
    fn map_page(&mut self, va: VirtualAddress) -> Result<(), HeapError> {
        let frame = self.frames.allocate_frame().ok_or(HeapError::OutOfMemory)?;
        if let Err(e) = self.space.map(&mut *self.frames, va, frame, PageFlags::KERNEL_RW) {
            debug!("cannot map heap page: {e}");
            self.frames.free_frame(frame);
            return Err(HeapError::OutOfMemory);
        }
        Ok(())
    }

    fn unmap_page(&mut self, va: VirtualAddress) {
        if let Some(page) = self.space.unmap(va) {
            self.frames.free_frame(page.base());
        }
    }

    /// Unmapped pieces read as zero, which no header accepts as valid.
    fn read(&self, va: VirtualAddress, buf: &mut [u8]) {
        let dst = buf.as_mut_ptr();
        self.for_each_piece(va, buf.len(), |host, at, n| match host {
            // SAFETY: `host` covers `n` bytes of a mapped heap page; `dst`
            // covers `buf`, which never aliases heap memory handed out here.
            Some(src) => unsafe { ptr::copy_nonoverlapping(src, dst.add(at), n) },
            // SAFETY: `at + n <= buf.len()`.
            None => unsafe { ptr::write_bytes(dst.add(at), 0, n) },
        });
    }

    fn write(&mut self, va: VirtualAddress, data: &[u8]) {
        let src = data.as_ptr();
        self.for_each_piece(va, data.len(), |host, at, n| {
            if let Some(dst) = host {
                // SAFETY: as in `read`, with the roles swapped.
                unsafe { ptr::copy_nonoverlapping(src.add(at), dst, n) };
            }
        });
    }
}
