//! # Kernel Configuration and Boot Interface
//!
//! Data structures and layout constants shared between the boot stub and the
//! memory-management core of the kernel.
//!
//! ## Architecture
//!
//! ### Boot Information ([`boot`])
//! The bootloader-to-kernel handoff:
//! * **Multiboot information block**: flags word, optional memory map
//! * **Memory map records**: `{ base, length, type }`, size-prefixed in memory
//! * **Kernel image bounds**: the physical range the loader placed the kernel in
//!
//! ### Memory Layout ([`memory`])
//! Where things live once paging is on:
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Identity map (first 4 MiB)     │
//!             │  low memory, kernel image,      │
//!             │  frame bitmap                   │
//! 0x0040_0000 ├─────────────────────────────────┤
//!             │        (unmapped)               │
//! HEAP_START  ├─────────────────────────────────┤ 0xC040_0000
//!             │  Kernel heap, grows upward      │
//!             │  to at most HEAP_MAX_SIZE       │
//!             ├─────────────────────────────────┤ 0xC140_0000
//!             │        (unmapped)               │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │     Low Memory (< 1 MiB)        │
//!             │  (BIOS, VGA, legacy devices)    │
//! 0x0010_0000 ├─────────────────────────────────┤
//!             │       Kernel Image              │
//!             ├─────────────────────────────────┤
//!             │       Frame Bitmap              │
//!             ├─────────────────────────────────┤
//!             │    Available RAM                │
//!             │  (managed by the frame bitmap)  │
//!             └─────────────────────────────────┘
//! ```
//!
//! All constants are `const` values with compile-time assertions on their
//! relationships.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
