//! # Kernel synchronization primitives
//!
//! Spin locks and the per-core interrupt seam shared by the page allocator
//! and the device drivers.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{Cpu, InterruptControl, IrqGuard};
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
