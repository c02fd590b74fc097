use core::fmt;
use core::sync::atomic::{Ordering, fence};

use kernel_memory_addresses::PhysMapper;
use kernel_sync::{Cpu, SpinLock};

use crate::RING_SIZE;
use crate::desc::{DescriptorRing, DmaRings, RING_ALIGN, RxDescriptor, TxDescriptor};
use crate::mbuf::{BufferPool, PacketBuffer};
use crate::regs::{
    DeviceControl, InterruptCauses, ReceiveControl, Register, RegisterAccess, TransmitControl,
    TransmitIpg, receive_address_high, receive_address_low,
};
use crate::rx::RxRing;
use crate::tx::TxRing;

/// QEMU's default MAC address for the emulated card.
pub const QEMU_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// Largest descriptor ring the 20-bit `*DLEN` registers can describe.
const MAX_RING_BYTES: usize = 0x000F_FF80;

/// What to do when no replacement receive buffer can be allocated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RxExhaustion {
    /// Panic. The ring never runs with a hole in it.
    #[default]
    Halt,
    /// Allocate the replacement before delivery; without one, drop the
    /// packet and give its buffer straight back to the device.
    DropPacket,
}

/// Runtime configuration of an [`E1000`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct E1000Config {
    /// Station address programmed into receive address entry 0.
    pub mac: [u8; 6],
    pub rx_exhaustion: RxExhaustion,
}

impl Default for E1000Config {
    fn default() -> Self {
        Self {
            mac: QEMU_MAC,
            rx_exhaustion: RxExhaustion::Halt,
        }
    }
}

/// Packet counters since [`E1000::init`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct E1000Stats {
    pub transmitted: u64,
    /// `transmit` calls refused because the ring was full.
    pub tx_busy: u64,
    pub received: u64,
    /// Packets dropped under [`RxExhaustion::DropPacket`].
    pub rx_dropped: u64,
}

/// The transmit ring is full; the buffer is handed back unchanged.
#[derive(thiserror::Error)]
#[error("e1000: transmit ring full")]
pub struct TransmitBusy<B>(pub B);

impl<B> TransmitBusy<B> {
    /// The buffer that couldn't be sent.
    pub fn into_inner(self) -> B {
        self.0
    }
}

impl<B> fmt::Debug for TransmitBusy<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransmitBusy(..)")
    }
}

/// Everything behind the driver lock.
struct Inner<'r, R, B, const N: usize> {
    regs: R,
    tx: TxRing<'r, B, N>,
    rx: RxRing<'r, B, N>,
    stats: E1000Stats,
}

/// Driver for the Intel 8254x ("e1000") network card.
///
/// One spin lock covers both rings and the register block. It is always
/// taken with interrupts disabled, so the interrupt handler and thread
/// context can share it on the same core, and it is released around every
/// upcall so the receiver may transmit from inside the callback.
pub struct E1000<'r, R, P: BufferPool, C: Cpu, M: PhysMapper, const N: usize = RING_SIZE> {
    inner: SpinLock<Inner<'r, R, P::Buffer, N>>,
    pool: P,
    cpu: C,
    mapper: M,
    config: E1000Config,
}

impl<'r, R, P, C, M, const N: usize> E1000<'r, R, P, C, M, N>
where
    R: RegisterAccess,
    P: BufferPool,
    C: Cpu,
    M: PhysMapper,
{
    /// Reset the card, set up both rings in `rings` and enable it.
    ///
    /// # Panics
    /// - If the ring size in bytes isn't a non-zero multiple of 128.
    /// - If `pool` can't supply a buffer for every receive slot.
    pub fn init(regs: R, rings: &'r DmaRings<N>, pool: P, cpu: C, mapper: M, config: E1000Config) -> Self {
        let ring_bytes = DescriptorRing::<TxDescriptor, N>::BYTES;
        assert!(
            N > 0 && ring_bytes % RING_ALIGN == 0,
            "e1000: {N} descriptors ({ring_bytes} bytes) is not a multiple of {RING_ALIGN} bytes"
        );
        assert!(ring_bytes <= MAX_RING_BYTES, "e1000: {N} descriptors exceed the ring length register");

        // Quiesce and reset.
        regs.write(Register::IMS, 0);
        let ctl = DeviceControl::from_bits(regs.read(Register::CTL)).with_rst(true);
        regs.write(Register::CTL, ctl.into_bits());
        regs.write(Register::IMS, 0);
        fence(Ordering::SeqCst);

        let mut tx = TxRing::new(&rings.tx);
        tx.reset();
        let tx_base = mapper.virt_to_phys(rings.tx.as_ptr());
        debug_assert!(tx_base.is_aligned_to(RING_ALIGN as u64));
        regs.write(Register::TDBAL, tx_base.low_u32());
        regs.write(Register::TDBAH, tx_base.high_u32());
        regs.write(Register::TDLEN, reg(ring_bytes));
        regs.write(Register::TDH, 0);
        regs.write(Register::TDT, 0);

        let mut rx = RxRing::new(&rings.rx);
        rx.fill(&pool, &mapper);
        let rx_base = mapper.virt_to_phys(rings.rx.as_ptr());
        debug_assert!(rx_base.is_aligned_to(RING_ALIGN as u64));
        regs.write(Register::RDBAL, rx_base.low_u32());
        regs.write(Register::RDBAH, rx_base.high_u32());
        regs.write(Register::RDH, 0);
        regs.write(Register::RDT, reg(N - 1));
        regs.write(Register::RDLEN, reg(DescriptorRing::<RxDescriptor, N>::BYTES));
        log::debug!("e1000: tx ring at {tx_base}, rx ring at {rx_base}, {N} descriptors each");

        regs.write(Register::RAL0, receive_address_low(config.mac));
        regs.write(Register::RAH0, receive_address_high(config.mac).into_bits());
        for i in 0..Register::MTA_ENTRIES {
            regs.write(Register::mta(i), 0);
        }

        let tctl = TransmitControl::new()
            .with_en(true)
            .with_psp(true)
            .with_ct(0x10)
            .with_cold(0x40);
        regs.write(Register::TCTL, tctl.into_bits());
        let tipg = TransmitIpg::new().with_ipgt(10).with_ipgr1(8).with_ipgr2(6);
        regs.write(Register::TIPG, tipg.into_bits());

        let rctl = ReceiveControl::new()
            .with_en(true)
            .with_bam(true)
            .with_bsize(ReceiveControl::BSIZE_2048)
            .with_secrc(true);
        regs.write(Register::RCTL, rctl.into_bits());

        // Interrupt on every received packet, no coalescing.
        regs.write(Register::RDTR, 0);
        regs.write(Register::RADV, 0);
        regs.write(Register::IMS, InterruptCauses::new().with_rxdw(true).into_bits());

        let [a, b, c, d, e, f] = config.mac;
        log::info!("e1000: up, mac {a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{f:02x}");

        Self {
            inner: SpinLock::new(Inner {
                regs,
                tx,
                rx,
                stats: E1000Stats::default(),
            }),
            pool,
            cpu,
            mapper,
            config,
        }
    }

    /// Queue `buf` for transmission.
    ///
    /// On success the driver owns the buffer until the device is done with
    /// it and the slot comes around again.
    ///
    /// # Errors
    /// [`TransmitBusy`] with the buffer if the descriptor at the tail is still
    /// owned by the device. Nothing is changed in that case.
    pub fn transmit(&self, buf: P::Buffer) -> Result<(), TransmitBusy<P::Buffer>> {
        let mut guard = self.inner.lock_irq(&self.cpu);
        let inner = &mut *guard;

        let index = inner.regs.read(Register::TDT) as usize;
        match inner.tx.enqueue(index, buf, &self.mapper) {
            Ok(tail) => {
                // Descriptor contents before the tail move.
                fence(Ordering::SeqCst);
                inner.regs.write(Register::TDT, reg(tail));
                inner.stats.transmitted += 1;
                Ok(())
            }
            Err(buf) => {
                inner.stats.tx_busy += 1;
                log::trace!("e1000: transmit ring full at slot {index}");
                Err(TransmitBusy(buf))
            }
        }
    }

    /// Hand every packet the device has written back to `deliver`, in ring
    /// order, and return the slots to the device.
    ///
    /// The lock is dropped around each `deliver` call; `deliver` may call
    /// [`transmit`](Self::transmit). Returns the number of packets delivered.
    ///
    /// # Panics
    /// Under [`RxExhaustion::Halt`] if no replacement buffer is available.
    pub fn receive<F: FnMut(P::Buffer)>(&self, mut deliver: F) -> usize {
        let mut delivered = 0;
        let mut guard = self.inner.lock_irq(&self.cpu);
        loop {
            let index = (guard.regs.read(Register::RDT) as usize + 1) % N;
            if !guard.rx.is_ready(index) {
                break;
            }

            let replacement = match self.config.rx_exhaustion {
                RxExhaustion::Halt => None,
                RxExhaustion::DropPacket => match self.pool.allocate() {
                    Some(fresh) => Some(fresh),
                    None => {
                        if !self.recycle(&mut *guard, index) {
                            break;
                        }
                        continue;
                    }
                },
            };

            let Some(buf) = guard.rx.take(index) else {
                // Another context is delivering this slot right now.
                break;
            };
            guard.stats.received += 1;

            drop(guard);
            deliver(buf);
            delivered += 1;
            guard = self.inner.lock_irq(&self.cpu);

            let fresh = match replacement.or_else(|| self.pool.allocate()) {
                Some(fresh) => fresh,
                None => panic!("e1000: receive buffer pool exhausted"),
            };
            rearm(&mut *guard, index, fresh, &self.mapper);
        }
        delivered
    }

    /// Interrupt entry: drain the receive ring, then acknowledge all causes.
    pub fn handle_interrupt<F: FnMut(P::Buffer)>(&self, deliver: F) -> usize {
        let delivered = self.receive(deliver);
        self.inner
            .lock_irq(&self.cpu)
            .regs
            .write(Register::ICR, InterruptCauses::ALL);
        delivered
    }

    /// Counters since init.
    pub fn stats(&self) -> E1000Stats {
        self.inner.lock_irq(&self.cpu).stats
    }

    /// The station address the card filters on.
    pub const fn mac(&self) -> [u8; 6] {
        self.config.mac
    }

    /// Re-arm slot `index` with the buffer already in it, skipping delivery.
    ///
    /// Returns `false` if the slot is empty (another context owns it).
    fn recycle(&self, inner: &mut Inner<'r, R, P::Buffer, N>, index: usize) -> bool {
        let Some(buf) = inner.rx.take(index) else {
            return false;
        };
        inner.stats.rx_dropped += 1;
        log::warn!("e1000: no receive buffer, dropped packet in slot {index}");
        rearm(inner, index, buf, &self.mapper);
        true
    }
}

/// Give slot `index` back to the device with `buf` and advance the tail.
fn rearm<R: RegisterAccess, B: PacketBuffer, M: PhysMapper + ?Sized, const N: usize>(
    inner: &mut Inner<'_, R, B, N>,
    index: usize,
    buf: B,
    mapper: &M,
) {
    drop(inner.rx.install(index, buf, mapper));
    fence(Ordering::SeqCst);
    inner.regs.write(Register::RDT, reg(index));
}

/// Ring indices and sizes as register values; bounded by `MAX_RING_BYTES`.
#[allow(clippy::cast_possible_truncation)]
const fn reg(value: usize) -> u32 {
    value as u32
}
