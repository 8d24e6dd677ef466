use crate::PageFlags;
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalPage;

/// A single 32-bit x86 paging entry in its raw bitfield form.
///
/// Page directory entries and page table entries share this layout; the
/// differences are noted per field.
///
/// ### Bit layout
///
/// | Bits   | Name / Mnemonic | Meaning |
/// |--------|-----------------|---------|
/// | 0      | `P`             | Valid entry if set |
/// | 1      | `RW`            | Writable if set |
/// | 2      | `US`            | User-mode accessible if set |
/// | 3      | `PWT`           | Write-through caching |
/// | 4      | `PCD`           | Disable caching |
/// | 5      | `A`             | Accessed |
/// | 6      | `D`             | Dirty (PTE only) |
/// | 7      | `PS` / `PAT`    | 4 MiB page (PDE) or PAT (PTE); kept 0 here |
/// | 8      | `G`             | Global (PTE only) |
/// | 9–11   | OS avail        | Ignored by hardware |
/// | 12–31  | `frame`         | Physical frame bits [31:12] |
///
/// ### Example
/// ```rust
/// # use kernel_vmem::{PageEntryBits, PageFlags};
/// # use kernel_vmem::addresses::PhysicalPage;
/// let e = PageEntryBits::from_flags(PageFlags::PRESENT | PageFlags::WRITABLE)
///     .with_frame_page(PhysicalPage::from_index(0x100));
/// assert!(e.present());
/// assert_eq!(e.into_bits(), 0x0010_0003);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on first write through a PTE.
    pub dirty: bool,

    /// Page Size in a PDE, PAT in a PTE (bit 7). Always 0 for mappings
    /// created here, since only 4 KiB pages are used.
    pub large_page: bool,

    /// Global (G, bit 8). Ignored in a PDE.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,

    /// Physical frame number (bits 12..=31).
    #[bits(20)]
    frame_number: u32,
}

impl PageEntryBits {
    /// Entry with exactly the bits of `flags` set and no frame.
    #[inline]
    #[must_use]
    pub const fn from_flags(flags: PageFlags) -> Self {
        Self::from_bits(flags.bits())
    }

    /// The low flag bits as [`PageFlags`]; bits not modelled there are dropped.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn frame_page(&self) -> PhysicalPage {
        PhysicalPage::from_index(self.frame_number())
    }

    #[inline]
    #[must_use]
    pub const fn with_frame_page(self, page: PhysicalPage) -> Self {
        self.with_frame_number(page.frame_index())
    }
}
