//! # Page Fault Reporting
//!
//! Nothing is ever mapped on demand, so every page fault is a kernel bug:
//! the handler decodes the error code, dumps the table walk for the faulting
//! address and halts.

use crate::{global, halt};
use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::PageWalk;
use log::error;

/// Page-fault error code pushed by the processor (32-bit paging).
///
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool, // bit 0

    /// 0 = read, 1 = write.
    pub write: bool, // bit 1

    /// 0 = supervisor, 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// A reserved bit was set in a paging structure entry.
    pub reserved_bit: bool, // bit 3

    /// Instruction fetch (only reported with NX support).
    pub instruction_fetch: bool, // bit 4

    #[bits(27)]
    __: u32,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page (nothing is mapped there)"
        } else if self.instruction_fetch() {
            "Instruction fetch from a protected page"
        } else if self.write() {
            "Write access to a protected page"
        } else {
            "Read access to a protected page"
        }
    }
}

impl fmt::Display for PageFaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cause = if self.present() {
            "Page protection violation"
        } else {
            "Page not present"
        };
        let access = if self.write() { "(write)" } else { "(read)" };
        let mode = if self.user() {
            "(user mode)"
        } else {
            "(kernel mode)"
        };
        write!(f, "{cause} {access} {mode}")
    }
}

/// Log everything known about a fault at `va`.
pub fn report_page_fault(va: VirtualAddress, err: PageFaultError, walk: Option<&PageWalk>) {
    error!(
        "PAGE FAULT at {va}: {err} (error code {:#x})",
        err.into_bits()
    );
    error!("{}", err.explain());
    match walk {
        Some(walk) => error!("table walk: {walk}"),
        None => error!("table walk unavailable"),
    }
}

/// Body of the page fault exception handler: report, then halt.
///
/// `error_code` is the value the processor pushed for the exception.
pub fn page_fault_handler(error_code: u32) -> ! {
    let va = fault_address();
    let err = PageFaultError::from_bits(error_code);
    let walk = global::walk(va);
    report_page_fault(va, err, walk.as_ref());
    halt::halt_forever()
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
fn fault_address() -> VirtualAddress {
    use kernel_registers::LoadRegisterUnsafe;
    use kernel_registers::cr2::Cr2;

    // SAFETY: only called from the page fault handler, at CPL0.
    unsafe { Cr2::load_unsafe() }.fault_address()
}

#[cfg(not(all(feature = "asm", target_arch = "x86")))]
const fn fault_address() -> VirtualAddress {
    VirtualAddress::zero()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_error_bits() {
        let err = PageFaultError::from_bits(0b0_0111);
        assert!(err.present());
        assert!(err.write());
        assert!(err.user());
        assert!(!err.reserved_bit());
        assert!(!err.instruction_fetch());
    }

    #[test]
    fn describes_kernel_read_of_unmapped_page() {
        let err = PageFaultError::from_bits(0);
        assert_eq!(err.to_string(), "Page not present (read) (kernel mode)");
        assert_eq!(err.explain(), "Non-present page (nothing is mapped there)");
    }

    #[test]
    fn describes_user_write_protection_violation() {
        let err = PageFaultError::new()
            .with_present(true)
            .with_write(true)
            .with_user(true);
        assert_eq!(err.into_bits(), 0b111);
        assert_eq!(
            err.to_string(),
            "Page protection violation (write) (user mode)"
        );
        assert_eq!(err.explain(), "Write access to a protected page");
    }

    #[test]
    fn reserved_bit_wins_the_explanation() {
        let err = PageFaultError::from_bits(0b1001);
        assert_eq!(err.explain(), "Reserved bit set in a paging structure");
    }
}
