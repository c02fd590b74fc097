use core::sync::atomic::{Ordering, fence};

use kernel_memory_addresses::PhysMapper;

use crate::desc::{Descriptor, DescriptorRing, RxDescriptor};
use crate::mbuf::{BufferPool, PacketBuffer};

/// Bytes the device may write per receive descriptor (`RCTL.BSIZE` = 2048).
pub const RX_BUFFER_BYTES: usize = 2048;

/// Software side of the receive ring.
///
/// Every slot the device may write into has a buffer parked in it. A slot is
/// empty only between [`take`](Self::take) and the next
/// [`install`](Self::install).
pub struct RxRing<'r, B, const N: usize> {
    desc: &'r DescriptorRing<RxDescriptor, N>,
    parked: [Option<B>; N],
}

impl<'r, B: PacketBuffer, const N: usize> RxRing<'r, B, N> {
    /// Wrap `desc` without touching it.
    pub fn new(desc: &'r DescriptorRing<RxDescriptor, N>) -> Self {
        Self {
            desc,
            parked: core::array::from_fn(|_| None),
        }
    }

    /// Give every slot a fresh buffer from `pool`.
    ///
    /// # Panics
    /// If the pool runs dry; the device can't run with holes in the ring.
    pub fn fill<P, M>(&mut self, pool: &P, mapper: &M)
    where
        P: BufferPool<Buffer = B> + ?Sized,
        M: PhysMapper + ?Sized,
    {
        for index in 0..N {
            let Some(buf) = pool.allocate() else {
                panic!("e1000: out of receive buffers while filling slot {index} of {N}");
            };
            self.desc.write(index, RxDescriptor::EMPTY);
            drop(self.install(index, buf, mapper));
        }
    }

    /// Whether the device has written back descriptor `index`.
    #[must_use]
    pub fn is_ready(&self, index: usize) -> bool {
        self.desc.read(index).status().dd()
    }

    /// Whether a buffer is parked in slot `index`.
    #[must_use]
    pub fn is_armed(&self, index: usize) -> bool {
        self.parked[index].is_some()
    }

    /// Remove the filled buffer from a ready slot, sized to what the device
    /// wrote.
    ///
    /// Returns `None` if the slot holds no buffer, i.e. another context is
    /// currently delivering it.
    ///
    /// # Panics
    /// If the device reports more bytes than a receive buffer holds.
    pub fn take(&mut self, index: usize) -> Option<B> {
        let desc = self.desc.read(index);
        let mut buf = self.parked[index].take()?;
        // Payload reads must not be hoisted above the DD check.
        fence(Ordering::Acquire);
        let length = usize::from(desc.length);
        assert!(
            length <= RX_BUFFER_BYTES,
            "e1000: device reported {length} bytes in slot {index}, buffers hold {RX_BUFFER_BYTES}"
        );
        buf.set_len(length);
        Some(buf)
    }

    /// Point slot `index` at `buf` and hand it back to the device.
    ///
    /// Returns the buffer that was parked there before, if any. The caller
    /// moves the tail register after a memory barrier.
    ///
    /// # Panics
    /// If `buf` has room for fewer than [`RX_BUFFER_BYTES`] from its head.
    pub fn install<M: PhysMapper + ?Sized>(&mut self, index: usize, buf: B, mapper: &M) -> Option<B> {
        assert!(
            buf.capacity() >= RX_BUFFER_BYTES,
            "e1000: receive buffer holds {} bytes, the device writes up to {RX_BUFFER_BYTES}",
            buf.capacity()
        );
        let addr = mapper.virt_to_phys(buf.head()).as_u64();
        self.desc.update(index, |d| {
            d.addr = addr;
            d.status = 0;
        });
        self.parked[index].replace(buf)
    }
}
