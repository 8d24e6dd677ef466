//! On-heap block header layout.
//!
//! Every block, free or allocated, starts with a 20-byte header:
//!
//! ```text
//! offset  0: magic  (0xDEADBEEF)
//! offset  4: size   (header + payload, bytes, multiple of 4)
//! offset  8: flags  (bit 0: free)
//! offset 12: next   (VA of the following block, 0 if last)
//! offset 16: prev   (VA of the preceding block, 0 if first)
//! ```
//!
//! All fields are little-endian `u32`; payloads therefore stay 4-byte aligned.

use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;

/// Sentinel stored in every live header.
pub const BLOCK_MAGIC: u32 = 0xDEAD_BEEF;

/// Bytes occupied by a [`BlockHeader`] in heap memory.
pub const HEADER_SIZE: u32 = 20;

/// Smallest payload worth splitting off into its own free block.
pub(crate) const SPLIT_SLACK: u32 = 16;

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
struct BlockFlags {
    free: bool,
    #[bits(31)]
    __: u32,
}

/// Decoded block header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub magic: u32,
    /// Total block size, header included.
    pub size: u32,
    pub free: bool,
    pub next: Option<VirtualAddress>,
    pub prev: Option<VirtualAddress>,
}

impl BlockHeader {
    /// A fresh free header with a valid magic.
    #[must_use]
    pub const fn new_free(
        size: u32,
        prev: Option<VirtualAddress>,
        next: Option<VirtualAddress>,
    ) -> Self {
        Self {
            magic: BLOCK_MAGIC,
            size,
            free: true,
            next,
            prev,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.magic == BLOCK_MAGIC
    }

    /// Payload capacity in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.size.saturating_sub(HEADER_SIZE)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE as usize] {
        let link = |v: Option<VirtualAddress>| v.map_or(0, VirtualAddress::as_u32);
        let mut raw = [0u8; HEADER_SIZE as usize];
        raw[0..4].copy_from_slice(&self.magic.to_le_bytes());
        raw[4..8].copy_from_slice(&self.size.to_le_bytes());
        raw[8..12].copy_from_slice(&BlockFlags::new().with_free(self.free).into_bits().to_le_bytes());
        raw[12..16].copy_from_slice(&link(self.next).to_le_bytes());
        raw[16..20].copy_from_slice(&link(self.prev).to_le_bytes());
        raw
    }

    #[must_use]
    pub fn from_bytes(raw: &[u8; HEADER_SIZE as usize]) -> Self {
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let link = |v: u32| (v != 0).then(|| VirtualAddress::new(v));
        Self {
            magic: word(0),
            size: word(4),
            free: BlockFlags::from_bits(word(8)).free(),
            next: link(word(12)),
            prev: link(word(16)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_little_endian() {
        let h = BlockHeader {
            magic: BLOCK_MAGIC,
            size: 0x40,
            free: true,
            next: Some(VirtualAddress::new(0xC040_0040)),
            prev: None,
        };
        let raw = h.to_bytes();
        assert_eq!(&raw[0..4], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&raw[4..8], &[0x40, 0, 0, 0]);
        assert_eq!(&raw[8..12], &[1, 0, 0, 0]);
        assert_eq!(&raw[12..16], &[0x40, 0x00, 0x40, 0xC0]);
        assert_eq!(&raw[16..20], &[0, 0, 0, 0]);
        assert_eq!(BlockHeader::from_bytes(&raw), h);
    }

    #[test]
    fn zeroed_memory_is_not_a_block() {
        let h = BlockHeader::from_bytes(&[0; HEADER_SIZE as usize]);
        assert!(!h.is_valid());
        assert!(!h.free);
        assert_eq!(h.next, None);
        assert_eq!(h.capacity(), 0);
    }
}
