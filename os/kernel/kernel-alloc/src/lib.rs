//! # Kernel Physical Page Allocation
//!
//! Hands out fixed-size 4 KiB physical pages from per-core free lists.
//!
//! ```text
//!   core 0        core 1               core N-1
//! ┌────────┐    ┌────────┐           ┌────────┐
//! │ lock 0 │    │ lock 1 │    ...    │lock N-1│
//! │ head ──┼─┐  │ head   │           │ head   │
//! └────────┘ │  └────────┘           └────────┘
//!            ▼
//!         [page] ──► [page] ──► [page] ──► ∅     link stored inside the page
//! ```
//!
//! * **Allocation** pops from the executing core's list; when that list is
//!   empty it steals a single page from the other cores, locking one list at
//!   a time.
//! * **Freeing** validates the page and pushes it onto the executing core's
//!   list, regardless of which core handed it out.
//! * Interrupts stay disabled from the moment the core id is read until the
//!   last list lock is released, so the id can't go stale and an interrupt
//!   handler can't spin on a lock its own core already holds.
//!
//! Pages are filled with junk bytes on both transitions (see
//! [`ALLOC_JUNK`] and [`FREE_JUNK`]) to surface use of uninitialized or
//! dangling memory.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kernel_alloc::{MAX_CORES, PageAllocator};
//! use kernel_memory_addresses::{OffsetMapper, PhysicalAddress};
//! use kernel_sync::irq::X86Cpu;
//!
//! let mapper = unsafe { OffsetMapper::new(0xFFFF_8880_0000_0000) };
//! let mut pages: PageAllocator<_, _, MAX_CORES> = PageAllocator::new(X86Cpu, mapper);
//! unsafe { pages.init(PhysicalAddress::new(0x0020_0000), PhysicalAddress::new(0x0800_0000)) };
//!
//! if let Some(page) = pages.allocate() {
//!     pages.free(page);
//! }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod free_list;
mod page_alloc;

pub use page_alloc::{ALLOC_JUNK, FREE_JUNK, InvalidPage, Page, PageAllocator};

/// Upper bound on the number of cores the kernel brings up.
pub const MAX_CORES: usize = 8;
