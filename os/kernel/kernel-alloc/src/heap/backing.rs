use crate::heap::HeapError;
use kernel_memory_addresses::VirtualAddress;

/// Memory behind the heap arena.
///
/// The heap only ever touches addresses inside pages it obtained through
/// [`map_page`](Self::map_page), so implementations may assume every
/// `read`/`write`/`fill`/`copy` range lies in such pages. A range may cross
/// page boundaries.
pub trait HeapBacking {
    /// Back the page at `va` (page-aligned) with a fresh writable frame.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if no frame (or page table) can be obtained.
    fn map_page(&mut self, va: VirtualAddress) -> Result<(), HeapError>;

    /// Undo [`map_page`](Self::map_page): drop the mapping and release its frame.
    fn unmap_page(&mut self, va: VirtualAddress);

    fn read(&self, va: VirtualAddress, buf: &mut [u8]);

    fn write(&mut self, va: VirtualAddress, data: &[u8]);

    /// Set `len` bytes starting at `va` to `byte`.
    fn fill(&mut self, va: VirtualAddress, len: u32, byte: u8) {
        let chunk = [byte; 64];
        let mut done = 0u32;
        while done < len {
            let n = (len - done).min(64);
            self.write(va + done, &chunk[..n as usize]);
            done += n;
        }
    }

    /// Copy `len` bytes from `src` to `dst`. The ranges must not overlap.
    fn copy(&mut self, dst: VirtualAddress, src: VirtualAddress, len: u32) {
        let mut chunk = [0u8; 64];
        let mut done = 0u32;
        while done < len {
            let n = (len - done).min(64) as usize;
            self.read(src + done, &mut chunk[..n]);
            self.write(dst + done, &chunk[..n]);
            #[allow(clippy::cast_possible_truncation)]
            {
                done += n as u32;
            }
        }
    }
}
