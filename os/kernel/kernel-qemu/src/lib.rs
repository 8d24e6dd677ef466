//! # QEMU Debug Console Logging
//!
//! A [`log::Log`] sink for kernels running under QEMU. Every record is
//! written byte by byte to the debug console I/O port `0x402`, which QEMU
//! forwards to the host when started with `-debugcon`:
//!
//! ```bash
//! qemu-system-i386 -kernel kernel.bin -debugcon stdio
//! ```
//!
//! ## Output format
//!
//! ```text
//! [INFO] kernel_mm::global: memory initialized (128 MB, 300 pages used)
//! [WARN] kernel_alloc::heap: double free of 0xC0400014
//! ```
//!
//! The formatting ([`write_record`]) is independent of the port and can be
//! pointed at any [`core::fmt::Write`].
//!
//! ## Features
//!
//! * `enabled` (default): perform the port writes on x86 targets. Without it,
//!   or on other architectures, output is discarded.
//!
//! ## Setup
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::{LevelFilter, info};
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//!
//! LOGGER.init().expect("logger already set");
//! info!("kernel subsystem initialized");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{QemuLogger, write_record};

#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// The port number for QEMU's debug port.
    pub const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Write a single byte to QEMU's debug port.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        #[cfg(all(feature = "enabled", any(target_arch = "x86", target_arch = "x86_64")))]
        unsafe {
            outb(QEMU_DEBUG_PORT, c);
        }
        #[cfg(not(all(feature = "enabled", any(target_arch = "x86", target_arch = "x86_64"))))]
        let _ = c;
    }

    #[cfg(all(feature = "enabled", any(target_arch = "x86", target_arch = "x86_64")))]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    unsafe fn outb(port: u16, val: u8) {
        unsafe {
            core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") val,
            options(nomem, nostack, preserves_flags)
            );
        }
    }

    /// [`Write`] adapter over [`dbg_putc`].
    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                dbg_putc(b);
            }
            Ok(())
        }
    }
}
