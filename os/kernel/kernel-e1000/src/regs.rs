//! # e1000 register block
//!
//! Offsets, typed register layouts and the [`RegisterAccess`] seam through
//! which the driver touches the device.
//!
//! ## References
//! - Intel 8254x Family of Gigabit Ethernet Controllers Software Developer's
//!   Manual, §13 "Register Descriptions"

use core::ptr::NonNull;

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysMapper, PhysicalAddress};

/// Byte offset of a 32-bit device register.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Register(usize);

impl Register {
    /// Device Control.
    pub const CTL: Self = Self(0x0000);
    /// Interrupt Cause Read (write 1s to clear).
    pub const ICR: Self = Self(0x00C0);
    /// Interrupt Mask Set/Read.
    pub const IMS: Self = Self(0x00D0);
    /// Receive Control.
    pub const RCTL: Self = Self(0x0100);
    /// Transmit Control.
    pub const TCTL: Self = Self(0x0400);
    /// Transmit Inter Packet Gap.
    pub const TIPG: Self = Self(0x0410);
    pub const RDBAL: Self = Self(0x2800);
    pub const RDBAH: Self = Self(0x2804);
    pub const RDLEN: Self = Self(0x2808);
    pub const RDH: Self = Self(0x2810);
    pub const RDT: Self = Self(0x2818);
    /// Receive interrupt delay timer.
    pub const RDTR: Self = Self(0x2820);
    /// Receive interrupt absolute delay timer.
    pub const RADV: Self = Self(0x282C);
    pub const TDBAL: Self = Self(0x3800);
    pub const TDBAH: Self = Self(0x3804);
    pub const TDLEN: Self = Self(0x3808);
    pub const TDH: Self = Self(0x3810);
    pub const TDT: Self = Self(0x3818);
    /// Multicast Table Array, first entry.
    pub const MTA: Self = Self(0x5200);
    /// Receive Address Low, entry 0.
    pub const RAL0: Self = Self(0x5400);
    /// Receive Address High, entry 0.
    pub const RAH0: Self = Self(0x5404);

    /// Number of 32-bit entries in the multicast table.
    pub const MTA_ENTRIES: usize = 128;

    /// The `index`-th multicast table entry.
    ///
    /// # Panics
    /// If `index >= MTA_ENTRIES`.
    #[must_use]
    pub const fn mta(index: usize) -> Self {
        assert!(index < Self::MTA_ENTRIES, "MTA index out of range");
        Self(Self::MTA.0 + 4 * index)
    }

    /// Byte offset from the register base.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }
}

/// Read and write access to the device's 32-bit registers.
///
/// [`Mmio`] is the real thing; tests substitute a register file in RAM.
pub trait RegisterAccess {
    fn read(&self, reg: Register) -> u32;
    fn write(&self, reg: Register, value: u32);
}

impl<R: RegisterAccess + ?Sized> RegisterAccess for &R {
    #[inline]
    fn read(&self, reg: Register) -> u32 {
        (**self).read(reg)
    }

    #[inline]
    fn write(&self, reg: Register, value: u32) {
        (**self).write(reg, value);
    }
}

/// Memory-mapped register block (PCI BAR 0).
#[derive(Debug)]
pub struct Mmio {
    base: NonNull<u32>,
}

// Safety: register accesses are single volatile 32-bit operations.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    /// Size of the register window decoded by the device.
    pub const WINDOW: usize = 0x2_0000;

    /// # Safety
    /// `base` must point to the device's mapped register window (uncached,
    /// at least [`WINDOW`](Self::WINDOW) bytes) for the lifetime of the value.
    #[must_use]
    pub const unsafe fn new(base: NonNull<u8>) -> Self {
        Self { base: base.cast() }
    }

    /// Map the register window at physical address `bar` through `mapper`.
    ///
    /// # Safety
    /// Same as [`Mmio::new`] for the pointer `mapper` returns.
    ///
    /// # Panics
    /// If the mapper yields a null pointer.
    pub unsafe fn from_physical<M: PhysMapper + ?Sized>(mapper: &M, bar: PhysicalAddress) -> Self {
        let Some(base) = NonNull::new(mapper.phys_to_ptr(bar)) else {
            panic!("e1000: register window at {bar} is not mapped");
        };
        unsafe { Self::new(base) }
    }

    #[inline]
    fn at(&self, reg: Register) -> *mut u32 {
        debug_assert!(reg.offset() < Self::WINDOW && reg.offset() % 4 == 0);
        unsafe { self.base.as_ptr().byte_add(reg.offset()) }
    }
}

impl RegisterAccess for Mmio {
    #[inline]
    fn read(&self, reg: Register) -> u32 {
        unsafe { self.at(reg).read_volatile() }
    }

    #[inline]
    fn write(&self, reg: Register, value: u32) {
        unsafe { self.at(reg).write_volatile(value) }
    }
}

/// `CTL`: Device Control.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct DeviceControl {
    #[bits(22)]
    _r0: u32,

    /// Bit 22: RST. Self-clearing device reset.
    pub rst: bool,

    #[bits(9)]
    _r1: u32,
}

/// `TCTL`: Transmit Control.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct TransmitControl {
    #[bits(1)]
    _r0: u8,

    /// Bit 1: EN. Transmitter enable.
    pub en: bool,

    #[bits(1)]
    _r1: u8,

    /// Bit 3: PSP. Pad short packets to 64 bytes.
    pub psp: bool,

    /// Bits 4-11: CT. Collision threshold (retransmit attempts).
    #[bits(8)]
    pub ct: u8,

    /// Bits 12-21: COLD. Collision distance.
    #[bits(10)]
    pub cold: u16,

    #[bits(10)]
    _r2: u16,
}

/// `TIPG`: Transmit Inter Packet Gap, in byte times.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct TransmitIpg {
    #[bits(10)]
    pub ipgt: u16,

    #[bits(10)]
    pub ipgr1: u16,

    #[bits(10)]
    pub ipgr2: u16,

    #[bits(2)]
    _r0: u8,
}

/// `RCTL`: Receive Control.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct ReceiveControl {
    #[bits(1)]
    _r0: u8,

    /// Bit 1: EN. Receiver enable.
    pub en: bool,

    #[bits(13)]
    _r1: u16,

    /// Bit 15: BAM. Accept broadcast frames.
    pub bam: bool,

    /// Bits 16-17: BSIZE. Receive buffer size, see [`ReceiveControl::BSIZE_2048`].
    #[bits(2)]
    pub bsize: u8,

    #[bits(8)]
    _r2: u8,

    /// Bit 26: SECRC. Strip the Ethernet CRC before handing the frame up.
    pub secrc: bool,

    #[bits(5)]
    _r3: u8,
}

impl ReceiveControl {
    /// `BSIZE` encoding for 2048-byte buffers.
    pub const BSIZE_2048: u8 = 0b00;
}

/// `ICR` / `IMS`: interrupt causes and their mask.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct InterruptCauses {
    /// Bit 0: TXDW. Transmit descriptor written back.
    pub txdw: bool,
    /// Bit 1: TXQE. Transmit queue empty.
    pub txqe: bool,
    /// Bit 2: LSC. Link status change.
    pub lsc: bool,
    /// Bit 3: RXSEQ. Receive sequence error.
    pub rxseq: bool,
    /// Bit 4: RXDMT0. Receive descriptor minimum threshold reached.
    pub rxdmt0: bool,
    #[bits(1)]
    _r0: u8,
    /// Bit 6: RXO. Receiver overrun.
    pub rxo: bool,
    /// Bit 7: RXDW. Receive descriptor written back.
    pub rxdw: bool,
    #[bits(24)]
    _r1: u32,
}

impl InterruptCauses {
    /// Written to `ICR` to acknowledge everything.
    pub const ALL: u32 = 0xFFFF_FFFF;
}

/// `RAH`: upper half of a receive address filter entry.
#[bitfield(u32, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct ReceiveAddressHigh {
    /// MAC bytes 4 and 5, little endian.
    pub mac_high: u16,

    /// Bits 16-17: ASEL. Address select (0 = destination address).
    #[bits(2)]
    pub asel: u8,

    #[bits(13)]
    _r0: u16,

    /// Bit 31: AV. Entry is valid.
    pub av: bool,
}

/// `RAL` value for MAC bytes 0..4.
#[must_use]
pub const fn receive_address_low(mac: [u8; 6]) -> u32 {
    u32::from_le_bytes([mac[0], mac[1], mac[2], mac[3]])
}

/// `RAH` value for MAC bytes 4..6, marked valid.
#[must_use]
pub const fn receive_address_high(mac: [u8; 6]) -> ReceiveAddressHigh {
    ReceiveAddressHigh::new()
        .with_mac_high(u16::from_le_bytes([mac[4], mac[5]]))
        .with_av(true)
}
