//! Hardware descriptors and the DMA memory they live in.
//!
//! A descriptor belongs to the device until the device sets its `DD`
//! (descriptor done) status bit; from then on software owns it until it
//! reprograms the slot and moves the tail register past it.

use core::cell::UnsafeCell;

use bitfield_struct::bitfield;

/// Rings must start on, and span a multiple of, this many bytes.
pub const RING_ALIGN: usize = 128;

/// A fixed-layout record shared with the device.
pub trait Descriptor: Copy {
    /// The all-zero descriptor.
    const EMPTY: Self;
}

/// Legacy transmit descriptor.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TxDescriptor {
    /// Physical address of the packet data.
    pub addr: u64,
    pub length: u16,
    /// Checksum offset.
    pub cso: u8,
    /// Raw [`TxCommand`].
    pub cmd: u8,
    /// Raw [`TxStatus`].
    pub status: u8,
    /// Checksum start.
    pub css: u8,
    pub special: u16,
}

impl TxDescriptor {
    #[inline]
    #[must_use]
    pub const fn command(&self) -> TxCommand {
        TxCommand::from_bits(self.cmd)
    }

    #[inline]
    #[must_use]
    pub const fn status(&self) -> TxStatus {
        TxStatus::from_bits(self.status)
    }
}

impl Descriptor for TxDescriptor {
    const EMPTY: Self = Self {
        addr: 0,
        length: 0,
        cso: 0,
        cmd: 0,
        status: 0,
        css: 0,
        special: 0,
    };
}

/// Receive descriptor.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RxDescriptor {
    /// Physical address of the receive buffer.
    pub addr: u64,
    /// Bytes written into the buffer by the device.
    pub length: u16,
    pub csum: u16,
    /// Raw [`RxStatus`].
    pub status: u8,
    pub errors: u8,
    pub special: u16,
}

impl RxDescriptor {
    #[inline]
    #[must_use]
    pub const fn status(&self) -> RxStatus {
        RxStatus::from_bits(self.status)
    }
}

impl Descriptor for RxDescriptor {
    const EMPTY: Self = Self {
        addr: 0,
        length: 0,
        csum: 0,
        status: 0,
        errors: 0,
        special: 0,
    };
}

const _: () = assert!(size_of::<TxDescriptor>() == 16);
const _: () = assert!(size_of::<RxDescriptor>() == 16);

/// Transmit descriptor command byte.
#[bitfield(u8, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct TxCommand {
    /// Bit 0: EOP. Last descriptor of the packet.
    pub eop: bool,
    /// Bit 1: IFCS. Insert the frame check sequence.
    pub ifcs: bool,
    /// Bit 2: IC. Insert checksum.
    pub ic: bool,
    /// Bit 3: RS. Report status (write back `DD`).
    pub rs: bool,
    #[bits(1)]
    _r0: u8,
    /// Bit 5: DEXT. Extended descriptor format.
    pub dext: bool,
    /// Bit 6: VLE. VLAN enable.
    pub vle: bool,
    /// Bit 7: IDE. Interrupt delay enable.
    pub ide: bool,
}

/// Transmit descriptor status byte.
#[bitfield(u8, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct TxStatus {
    /// Bit 0: DD. Descriptor done.
    pub dd: bool,
    /// Bit 1: EC. Excess collisions.
    pub ec: bool,
    /// Bit 2: LC. Late collision.
    pub lc: bool,
    #[bits(5)]
    _r0: u8,
}

/// Receive descriptor status byte.
#[bitfield(u8, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct RxStatus {
    /// Bit 0: DD. Descriptor done.
    pub dd: bool,
    /// Bit 1: EOP. Last descriptor of the packet.
    pub eop: bool,
    /// Bit 2: IXSM. Ignore checksum indication.
    pub ixsm: bool,
    /// Bit 3: VP. Packet is 802.1Q tagged.
    pub vp: bool,
    #[bits(1)]
    _r0: u8,
    /// Bit 5: TCPCS. TCP checksum calculated.
    pub tcpcs: bool,
    /// Bit 6: IPCS. IP checksum calculated.
    pub ipcs: bool,
    /// Bit 7: PIF. Passed in-exact filter.
    pub pif: bool,
}

/// `N` descriptors in device-visible memory.
///
/// The device reads and writes these bytes behind the compiler's back, so
/// every access is a volatile copy of a whole descriptor through `&self`.
#[repr(C, align(128))]
pub struct DescriptorRing<D, const N: usize> {
    slots: [UnsafeCell<D>; N],
}

// Safety: slots are only accessed with volatile whole-descriptor copies; the
// driver serializes software access behind its lock.
unsafe impl<D: Send, const N: usize> Sync for DescriptorRing<D, N> {}

impl<D: Descriptor, const N: usize> DescriptorRing<D, N> {
    /// Size of the descriptor array in bytes, as programmed into `*DLEN`.
    pub const BYTES: usize = N * size_of::<D>();

    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { UnsafeCell::new(D::EMPTY) }; N],
        }
    }

    /// Copy of descriptor `index`.
    ///
    /// # Panics
    /// If `index >= N`.
    #[inline]
    #[must_use]
    pub fn read(&self, index: usize) -> D {
        unsafe { self.slots[index].get().read_volatile() }
    }

    /// Overwrite descriptor `index`.
    ///
    /// # Panics
    /// If `index >= N`.
    #[inline]
    pub fn write(&self, index: usize, desc: D) {
        unsafe { self.slots[index].get().write_volatile(desc) }
    }

    /// Read-modify-write of descriptor `index`.
    #[inline]
    pub fn update(&self, index: usize, f: impl FnOnce(&mut D)) {
        let mut desc = self.read(index);
        f(&mut desc);
        self.write(index, desc);
    }

    /// First byte of the ring, for translating to the DMA base address.
    #[inline]
    #[must_use]
    pub const fn as_ptr(&self) -> *const u8 {
        self.slots.as_ptr().cast()
    }
}

impl<D: Descriptor, const N: usize> Default for DescriptorRing<D, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// DMA memory for one transmit and one receive ring.
///
/// Usually a `static`; the driver borrows it for its whole life. The memory
/// must be reachable by the device at the address the driver's mapper
/// reports for it.
#[derive(Default)]
pub struct DmaRings<const N: usize> {
    pub tx: DescriptorRing<TxDescriptor, N>,
    pub rx: DescriptorRing<RxDescriptor, N>,
}

impl<const N: usize> DmaRings<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tx: DescriptorRing::new(),
            rx: DescriptorRing::new(),
        }
    }
}
