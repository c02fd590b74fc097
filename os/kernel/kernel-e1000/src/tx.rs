use kernel_memory_addresses::PhysMapper;

use crate::desc::{Descriptor, DescriptorRing, TxCommand, TxDescriptor, TxStatus};
use crate::mbuf::PacketBuffer;

/// Software side of the transmit ring.
///
/// Pairs every descriptor with the buffer whose bytes it points at. A buffer
/// stays parked in its slot after the device is done with it and is only
/// dropped when the slot is reused.
pub struct TxRing<'r, B, const N: usize> {
    desc: &'r DescriptorRing<TxDescriptor, N>,
    parked: [Option<B>; N],
}

impl<'r, B: PacketBuffer, const N: usize> TxRing<'r, B, N> {
    /// Wrap `desc` without touching it.
    pub fn new(desc: &'r DescriptorRing<TxDescriptor, N>) -> Self {
        Self {
            desc,
            parked: core::array::from_fn(|_| None),
        }
    }

    /// Zero every descriptor and hand it to software (`DD` set).
    ///
    /// Parked buffers are released.
    pub fn reset(&mut self) {
        let done = TxDescriptor {
            status: TxStatus::new().with_dd(true).into_bits(),
            ..TxDescriptor::EMPTY
        };
        for (i, slot) in self.parked.iter_mut().enumerate() {
            self.desc.write(i, done);
            *slot = None;
        }
    }

    /// Whether software owns descriptor `index`.
    #[must_use]
    pub fn is_done(&self, index: usize) -> bool {
        self.desc.read(index).status().dd()
    }

    /// Queue `buf` in slot `index` (the current tail).
    ///
    /// Returns the new tail, or hands `buf` back untouched if the device
    /// still owns the slot. The caller publishes the new tail to the device
    /// after a memory barrier.
    ///
    /// # Errors
    /// `Err(buf)` while the slot's `DD` bit is clear.
    ///
    /// # Panics
    /// If `index >= N` or the buffer is larger than a descriptor can describe.
    pub fn enqueue<M: PhysMapper + ?Sized>(&mut self, index: usize, buf: B, mapper: &M) -> Result<usize, B> {
        if !self.is_done(index) {
            return Err(buf);
        }

        let Ok(length) = u16::try_from(buf.len()) else {
            panic!("e1000: {} byte packet exceeds a transmit descriptor", buf.len());
        };

        // The device has finished with the previous occupant.
        self.parked[index] = None;
        self.desc.write(
            index,
            TxDescriptor {
                addr: mapper.virt_to_phys(buf.head()).as_u64(),
                length,
                cmd: TxCommand::new().with_rs(true).with_eop(true).into_bits(),
                status: 0,
                ..TxDescriptor::EMPTY
            },
        );
        self.parked[index] = Some(buf);

        Ok((index + 1) % N)
    }

    /// Number of slots with a buffer attached.
    #[must_use]
    pub fn parked(&self) -> usize {
        self.parked.iter().filter(|b| b.is_some()).count()
    }
}
