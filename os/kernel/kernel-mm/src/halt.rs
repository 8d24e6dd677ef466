//! The end of the line for unrecoverable kernel errors.

use core::fmt;
use log::error;

/// Log `reason` and stop the CPU for good.
pub fn fatal(reason: fmt::Arguments<'_>) -> ! {
    error!("fatal: {reason}");
    halt_forever()
}

/// Disable interrupts and halt, forever.
///
/// Spins on targets without the `asm` feature.
pub fn halt_forever() -> ! {
    loop {
        #[cfg(all(feature = "asm", target_arch = "x86"))]
        // SAFETY: stopping the CPU has no memory effects.
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
        #[cfg(not(all(feature = "asm", target_arch = "x86")))]
        core::hint::spin_loop();
    }
}
