//! # Kernel Boot Information
//!
//! The loader hands the kernel a Multiboot information block. The only part
//! the memory-management core consumes is the memory map: a run of
//! size-prefixed records, each describing one physical range.
//!
//! ```rust
//! # use kernel_info::boot::*;
//! // One available record: size=20, base=1 MiB, length=15 MiB, type=1
//! let mut raw = [0u8; 24];
//! raw[0..4].copy_from_slice(&20u32.to_le_bytes());
//! raw[4..12].copy_from_slice(&0x10_0000u64.to_le_bytes());
//! raw[12..20].copy_from_slice(&0xF0_0000u64.to_le_bytes());
//! raw[20..24].copy_from_slice(&1u32.to_le_bytes());
//!
//! let mut entries = MultibootMmapIter::new(&raw);
//! let e = entries.next().unwrap();
//! assert_eq!(e.base, 0x10_0000);
//! assert_eq!(e.end(), 0x100_0000);
//! assert!(e.is_available());
//! assert!(entries.next().is_none());
//! ```

use kernel_memory_addresses::PhysicalAddress;

/// Memory-map record type, as reported by the firmware.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Usable RAM.
    Available = 1,
    /// Reserved by the firmware or a device.
    Reserved = 2,
    /// ACPI tables; usable once they have been read.
    AcpiReclaimable = 3,
    /// ACPI non-volatile storage; must be preserved.
    AcpiNvs = 4,
    /// Defective RAM.
    BadMemory = 5,
    /// Anything else; treated like [`Reserved`](Self::Reserved).
    Unknown = 0,
}

impl MemoryRegionKind {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Available,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadMemory,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Reserved => "reserved",
            Self::AcpiReclaimable => "ACPI reclaimable",
            Self::AcpiNvs => "ACPI NVS",
            Self::BadMemory => "bad memory",
            Self::Unknown => "unknown",
        }
    }
}

/// One boot memory-map record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    /// Physical start of the range.
    pub base: u64,
    /// Length of the range in bytes.
    pub length: u64,
    /// Raw record type; `1` means available.
    pub kind: u32,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self {
            base,
            length,
            kind: kind as u32,
        }
    }

    /// One past the last byte of the range.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn region_kind(&self) -> MemoryRegionKind {
        MemoryRegionKind::from_raw(self.kind)
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.kind == MemoryRegionKind::Available as u32
    }
}

/// Size in bytes of a record body following its `size` prefix.
const MMAP_RECORD_BODY: usize = 20;

/// Walks the size-prefixed memory-map records of a Multiboot information
/// block.
///
/// Each record starts with a `u32` size that does not count itself; the next
/// record begins `size + 4` bytes later. Truncated trailing records are
/// ignored.
#[derive(Clone, Debug)]
pub struct MultibootMmapIter<'a> {
    raw: &'a [u8],
    offset: usize,
}

impl<'a> MultibootMmapIter<'a> {
    #[must_use]
    pub const fn new(raw: &'a [u8]) -> Self {
        Self { raw, offset: 0 }
    }
}

fn read_u32(raw: &[u8], at: usize) -> Option<u32> {
    let bytes = raw.get(at..at + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u64(raw: &[u8], at: usize) -> Option<u64> {
    let bytes = raw.get(at..at + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

impl Iterator for MultibootMmapIter<'_> {
    type Item = MemoryMapEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let at = self.offset;
        let size = read_u32(self.raw, at)? as usize;
        if size < MMAP_RECORD_BODY {
            // a zero or short size would never advance past a valid record
            self.offset = self.raw.len();
            return None;
        }

        let entry = MemoryMapEntry {
            base: read_u64(self.raw, at + 4)?,
            length: read_u64(self.raw, at + 12)?,
            kind: read_u32(self.raw, at + 20)?,
        };
        self.offset = at + 4 + size;
        Some(entry)
    }
}

/// Multiboot (v1) flag: `mmap_length` / `mmap_addr` are valid.
pub const MULTIBOOT_FLAG_MMAP: u32 = 1 << 6;

/// The leading part of the Multiboot (v1) information block, up to and
/// including the memory map fields.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct MultibootInfo {
    pub flags: u32,
    /// KiB of conventional memory below 1 MiB.
    pub mem_lower: u32,
    /// KiB of memory above 1 MiB.
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    /// Length of the memory map buffer in **bytes**.
    pub mmap_length: u32,
    /// Physical address of the first memory map record.
    pub mmap_addr: u32,
}

impl MultibootInfo {
    /// Physical location and byte length of the memory map, if the loader
    /// supplied one.
    #[must_use]
    pub const fn memory_map(&self) -> Option<(PhysicalAddress, u32)> {
        if self.flags & MULTIBOOT_FLAG_MMAP == 0 {
            return None;
        }
        Some((PhysicalAddress::new(self.mmap_addr), self.mmap_length))
    }
}

/// Physical bounds of the loaded kernel image.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernelImage {
    /// First byte of the image.
    pub start: PhysicalAddress,
    /// One past the last byte of the image (including `.bss`).
    pub end: PhysicalAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(size: u32, base: u64, length: u64, kind: u32) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&size.to_le_bytes());
        v.extend_from_slice(&base.to_le_bytes());
        v.extend_from_slice(&length.to_le_bytes());
        v.extend_from_slice(&kind.to_le_bytes());
        v.resize(4 + size as usize, 0);
        v
    }

    #[test]
    fn iterates_size_prefixed_records() {
        let mut raw = record(20, 0, 0x9_FC00, 1);
        raw.extend(record(20, 0x9_FC00, 0x400, 2));
        raw.extend(record(20, 0x10_0000, 0x7EE_0000, 1));

        let entries: Vec<_> = MultibootMmapIter::new(&raw).collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].region_kind(), MemoryRegionKind::Reserved);
        assert_eq!(entries[2].end(), 0x7FE_0000);
    }

    #[test]
    fn honors_larger_record_sizes() {
        let mut raw = record(28, 0, 0x1000, 1);
        raw.extend(record(20, 0x1000, 0x1000, 3));

        let entries: Vec<_> = MultibootMmapIter::new(&raw).collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].base, 0x1000);
        assert_eq!(entries[1].region_kind(), MemoryRegionKind::AcpiReclaimable);
    }

    #[test]
    fn stops_on_truncated_or_zero_sized_records() {
        let mut raw = record(20, 0, 0x1000, 1);
        raw.extend_from_slice(&[20, 0, 0, 0, 1, 2]);
        assert_eq!(MultibootMmapIter::new(&raw).count(), 1);

        let raw = record(0, 0, 0, 0);
        assert_eq!(MultibootMmapIter::new(&raw).count(), 0);
    }

    #[test]
    fn memory_map_requires_flag() {
        let mut info = MultibootInfo {
            mmap_addr: 0x9000,
            mmap_length: 72,
            ..MultibootInfo::default()
        };
        assert!(info.memory_map().is_none());

        info.flags |= MULTIBOOT_FLAG_MMAP;
        assert_eq!(info.memory_map(), Some((PhysicalAddress::new(0x9000), 72)));
    }

    #[test]
    fn unknown_kinds_are_not_available() {
        let e = MemoryMapEntry {
            base: 0,
            length: 0x1000,
            kind: 12,
        };
        assert_eq!(e.region_kind(), MemoryRegionKind::Unknown);
        assert_eq!(e.region_kind().as_str(), "unknown");
        assert!(!e.is_available());
    }
}
