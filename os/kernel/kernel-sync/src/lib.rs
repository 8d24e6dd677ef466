//! # Kernel synchronization primitives
//!
//! The kernel runs on a single core; the only contention a lock can see is
//! an interrupt handler preempting the lock holder. Code reachable from
//! such a handler uses [`SpinLock::try_lock`] / [`SpinLock::try_with_lock`]
//! and treats a held lock as failure, since spinning would never end.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
