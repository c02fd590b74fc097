//! # Intel e1000 Network Driver
//!
//! Driver for the 8254x family of gigabit Ethernet controllers as emulated
//! by QEMU (`-device e1000`), built around two descriptor rings in memory
//! shared with the card.
//!
//! ```text
//!            software                          device
//!   TX: transmit() ──► [desc @ TDT] ──────► fetch, send, set DD
//!                        ▲                        │
//!                        └────── reuse slot ◄─────┘
//!
//!   RX: [desc @ RDT+1] ◄── write packet, set DD ◄── wire
//!            │
//!            └─► deliver(buf) ─► new buffer ─► RDT = slot
//! ```
//!
//! A descriptor belongs to the device until the device sets its `DD` bit.
//! Software only touches descriptors it owns and publishes new ones by
//! moving the tail register, after a memory barrier.
//!
//! ## Seams
//!
//! | Seam | Kernel | Tests |
//! |------|--------|-------|
//! | [`RegisterAccess`] | [`Mmio`] on BAR 0 | register file in RAM |
//! | [`BufferPool`] | [`MbufPool`] | counting pool |
//! | [`Cpu`](kernel_sync::Cpu) | `X86Cpu` | thread-local flag |
//! | [`PhysMapper`](kernel_memory_addresses::PhysMapper) | direct map | identity |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kernel_e1000::{DmaRings, E1000, E1000Config, MbufPool, Mmio, RING_SIZE};
//! use kernel_memory_addresses::{OffsetMapper, PhysicalAddress};
//! use kernel_sync::irq::X86Cpu;
//!
//! static RINGS: DmaRings<RING_SIZE> = DmaRings::new();
//!
//! let mapper = unsafe { OffsetMapper::new(0xFFFF_8880_0000_0000) };
//! let regs = unsafe { Mmio::from_physical(&mapper, PhysicalAddress::new(0xFEB8_0000)) };
//! let nic: E1000<'_, _, _, _, _> =
//!     E1000::init(regs, &RINGS, MbufPool::new(), X86Cpu, mapper, E1000Config::default());
//!
//! // From the interrupt handler:
//! nic.handle_interrupt(|packet| drop(packet));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod desc;
mod driver;
mod mbuf;
pub mod regs;
mod rx;
mod tx;

pub use desc::{
    Descriptor, DescriptorRing, DmaRings, RING_ALIGN, RxDescriptor, RxStatus, TxCommand,
    TxDescriptor, TxStatus,
};
pub use driver::{E1000, E1000Config, E1000Stats, QEMU_MAC, RxExhaustion, TransmitBusy};
pub use mbuf::{BufferPool, MBUF_DEFAULT_HEADROOM, MBUF_SIZE, Mbuf, MbufError, MbufPool, PacketBuffer};
pub use regs::{Mmio, Register, RegisterAccess};
pub use rx::{RX_BUFFER_BYTES, RxRing};
pub use tx::TxRing;

/// Descriptors per ring unless configured otherwise.
pub const RING_SIZE: usize = 16;
