//! # Memory Layout

/// Everything below this physical address is legacy memory (real-mode IVT,
/// BIOS data, VGA, option ROMs) and is never handed out as a free frame.
pub const LOW_MEMORY_END: u32 = 0x0010_0000; // 1 MiB

/// Bytes identity-mapped (virtual == physical) before paging is enabled, so
/// the code performing the switch keeps running and the kernel image, the
/// frame bitmap and early page tables stay reachable.
pub const IDENTITY_MAP_BYTES: u32 = 0x0040_0000; // 4 MiB

/// Fixed virtual start of the kernel heap arena.
pub const HEAP_START: u32 = 0xC040_0000;

/// Bytes mapped for the heap at initialization.
pub const HEAP_INITIAL_SIZE: u32 = 0x0010_0000; // 1 MiB

/// Upper bound on the heap arena; growth beyond this fails.
pub const HEAP_MAX_SIZE: u32 = 0x0100_0000; // 16 MiB

/// Memory-map records starting at or above this physical address are ignored;
/// without PAE the processor cannot address them.
pub const PHYSICAL_ADDRESS_LIMIT: u64 = 0x1_0000_0000; // 4 GiB

const _: () = {
    assert!(LOW_MEMORY_END.is_multiple_of(4096));
    assert!(IDENTITY_MAP_BYTES.is_multiple_of(0x40_0000));
    assert!(IDENTITY_MAP_BYTES > LOW_MEMORY_END);
    assert!(HEAP_START.is_multiple_of(4096));
    assert!(HEAP_START >= IDENTITY_MAP_BYTES);
    assert!(HEAP_INITIAL_SIZE.is_multiple_of(4096));
    assert!(HEAP_MAX_SIZE.is_multiple_of(4096));
    assert!(HEAP_INITIAL_SIZE <= HEAP_MAX_SIZE);
    assert!(HEAP_START.checked_add(HEAP_MAX_SIZE).is_some());
};
