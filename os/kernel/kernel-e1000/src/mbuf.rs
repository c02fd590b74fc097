//! Packet buffers.
//!
//! The driver only needs to know where a buffer's bytes start, how many of
//! them are valid and how many fit ([`PacketBuffer`]), and where to get fresh
//! ones ([`BufferPool`]). [`Mbuf`] is the kernel's implementation.

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use core::ptr::NonNull;
use core::slice;

/// Storage size of an [`Mbuf`]; matches `RCTL.BSIZE = 2048`.
pub const MBUF_SIZE: usize = 2048;

/// Headroom the network layer reserves for link, IP and transport headers.
pub const MBUF_DEFAULT_HEADROOM: usize = 128;

/// A buffer the device can DMA into or out of.
pub trait PacketBuffer {
    /// First valid byte.
    fn head(&self) -> *const u8;

    /// Number of valid bytes starting at [`head`](Self::head).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set the number of valid bytes, e.g. after the device filled the buffer.
    ///
    /// # Panics
    /// Implementations panic if `len > self.capacity()`.
    fn set_len(&mut self, len: usize);

    /// Bytes writable starting at [`head`](Self::head).
    fn capacity(&self) -> usize;
}

/// A source of empty packet buffers.
pub trait BufferPool {
    type Buffer: PacketBuffer;

    /// A fresh buffer, or `None` if memory is exhausted.
    fn allocate(&self) -> Option<Self::Buffer>;
}

impl<P: BufferPool + ?Sized> BufferPool for &P {
    type Buffer = P::Buffer;

    #[inline]
    fn allocate(&self) -> Option<Self::Buffer> {
        (**self).allocate()
    }
}

/// Header manipulation that would leave the buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MbufError {
    #[error("mbuf: need {needed} bytes of headroom, have {available}")]
    NoHeadroom { needed: usize, available: usize },
    #[error("mbuf: need {needed} bytes of tailroom, have {available}")]
    NoTailroom { needed: usize, available: usize },
    #[error("mbuf: need {needed} bytes of data, have {available}")]
    TooShort { needed: usize, available: usize },
}

/// A 2048-byte packet buffer with movable head and tail.
///
/// ```text
/// |<-- headroom -->|<------ data (len) ------>|<-- tailroom -->|
/// 0              head                   head + len          MBUF_SIZE
/// ```
pub struct Mbuf {
    buf: NonNull<u8>,
    head: usize,
    len: usize,
}

// Safety: an Mbuf exclusively owns its heap storage.
unsafe impl Send for Mbuf {}
unsafe impl Sync for Mbuf {}

impl Mbuf {
    const LAYOUT: Layout = match Layout::from_size_align(MBUF_SIZE, 64) {
        Ok(layout) => layout,
        Err(_) => panic!("invalid mbuf layout"),
    };

    /// An empty buffer with `headroom` bytes reserved in front.
    ///
    /// Returns `None` if the global allocator is out of memory.
    ///
    /// # Panics
    /// If `headroom > MBUF_SIZE`.
    #[must_use]
    pub fn new(headroom: usize) -> Option<Self> {
        assert!(headroom <= MBUF_SIZE, "mbuf headroom {headroom} exceeds {MBUF_SIZE}");
        let buf = NonNull::new(unsafe { alloc_zeroed(Self::LAYOUT) })?;
        Some(Self {
            buf,
            head: headroom,
            len: 0,
        })
    }

    /// The valid bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.buf.as_ptr().add(self.head), self.len) }
    }

    #[must_use]
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.buf.as_ptr().add(self.head), self.len) }
    }

    #[must_use]
    pub const fn headroom(&self) -> usize {
        self.head
    }

    #[must_use]
    pub const fn tailroom(&self) -> usize {
        MBUF_SIZE - self.head - self.len
    }

    /// Grow the data by `n` bytes at the front and return them.
    ///
    /// # Errors
    /// [`MbufError::NoHeadroom`] if fewer than `n` bytes precede the data.
    pub fn push(&mut self, n: usize) -> Result<&mut [u8], MbufError> {
        if n > self.head {
            return Err(MbufError::NoHeadroom {
                needed: n,
                available: self.head,
            });
        }
        self.head -= n;
        self.len += n;
        Ok(&mut self.data_mut()[..n])
    }

    /// Strip `n` bytes from the front and return them.
    ///
    /// # Errors
    /// [`MbufError::TooShort`] if the data holds fewer than `n` bytes.
    pub fn pull(&mut self, n: usize) -> Result<&[u8], MbufError> {
        if n > self.len {
            return Err(MbufError::TooShort {
                needed: n,
                available: self.len,
            });
        }
        let start = self.head;
        self.head += n;
        self.len -= n;
        Ok(unsafe { slice::from_raw_parts(self.buf.as_ptr().add(start), n) })
    }

    /// Grow the data by `n` bytes at the back and return them.
    ///
    /// # Errors
    /// [`MbufError::NoTailroom`] if fewer than `n` bytes follow the data.
    pub fn put(&mut self, n: usize) -> Result<&mut [u8], MbufError> {
        let available = self.tailroom();
        if n > available {
            return Err(MbufError::NoTailroom { needed: n, available });
        }
        let old = self.len;
        self.len += n;
        Ok(&mut self.data_mut()[old..])
    }

    /// Drop `n` bytes from the back.
    ///
    /// # Errors
    /// [`MbufError::TooShort`] if the data holds fewer than `n` bytes.
    pub fn trim(&mut self, n: usize) -> Result<(), MbufError> {
        if n > self.len {
            return Err(MbufError::TooShort {
                needed: n,
                available: self.len,
            });
        }
        self.len -= n;
        Ok(())
    }
}

impl PacketBuffer for Mbuf {
    fn head(&self) -> *const u8 {
        unsafe { self.buf.as_ptr().add(self.head) }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity(), "mbuf length {len} exceeds capacity {}", self.capacity());
        self.len = len;
    }

    fn capacity(&self) -> usize {
        MBUF_SIZE - self.head
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.buf.as_ptr(), Self::LAYOUT) };
    }
}

impl core::fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mbuf")
            .field("head", &self.head)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Allocates [`Mbuf`]s from the kernel heap.
#[derive(Debug, Copy, Clone, Default)]
pub struct MbufPool {
    headroom: usize,
}

impl MbufPool {
    /// Buffers with no headroom; receive buffers start at the first byte.
    #[must_use]
    pub const fn new() -> Self {
        Self { headroom: 0 }
    }

    /// Buffers with `headroom` bytes reserved for headers.
    ///
    /// Any headroom leaves less than a full frame behind the head, so such
    /// pools serve the transmit side only; the receive ring rejects their
    /// buffers.
    ///
    /// # Panics
    /// If `headroom > MBUF_SIZE`.
    #[must_use]
    pub const fn with_headroom(headroom: usize) -> Self {
        assert!(headroom <= MBUF_SIZE, "mbuf headroom exceeds the buffer size");
        Self { headroom }
    }

    #[must_use]
    pub const fn headroom(&self) -> usize {
        self.headroom
    }
}

impl BufferPool for MbufPool {
    type Buffer = Mbuf;

    fn allocate(&self) -> Option<Mbuf> {
        let m = Mbuf::new(self.headroom);
        if m.is_none() {
            log::warn!("mbuf pool: out of memory");
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pull_round_trip_a_header() {
        let mut m = MbufPool::with_headroom(MBUF_DEFAULT_HEADROOM).allocate().unwrap();
        m.put(4).unwrap().copy_from_slice(b"data");
        m.push(2).unwrap().copy_from_slice(b"hd");
        assert_eq!(m.data(), b"hddata");
        assert_eq!(m.headroom(), MBUF_DEFAULT_HEADROOM - 2);

        assert_eq!(m.pull(2).unwrap(), b"hd");
        assert_eq!(m.data(), b"data");
        m.trim(1).unwrap();
        assert_eq!(m.data(), b"dat");
    }

    #[test]
    fn out_of_bounds_operations_fail_without_change() {
        let mut m = Mbuf::new(8).unwrap();
        assert_eq!(
            m.push(9).unwrap_err(),
            MbufError::NoHeadroom {
                needed: 9,
                available: 8
            }
        );
        assert_eq!(m.pull(1).unwrap_err(), MbufError::TooShort { needed: 1, available: 0 });
        assert!(m.trim(1).is_err());
        assert!(m.put(MBUF_SIZE - 8 + 1).is_err());

        assert_eq!(m.headroom(), 8);
        assert_eq!(m.len(), 0);
        assert!(m.put(MBUF_SIZE - 8).is_ok());
        assert_eq!(m.tailroom(), 0);
    }

    #[test]
    fn capacity_counts_from_head() {
        let mut m = MbufPool::new().allocate().unwrap();
        assert_eq!(m.capacity(), MBUF_SIZE);
        m.set_len(64);
        assert_eq!(m.data().len(), 64);

        let m = Mbuf::new(100).unwrap();
        assert_eq!(m.capacity(), MBUF_SIZE - 100);
    }

    #[test]
    #[should_panic(expected = "exceeds capacity")]
    fn set_len_beyond_capacity_panics() {
        let mut m = Mbuf::new(0).unwrap();
        m.set_len(MBUF_SIZE + 1);
    }

    #[test]
    fn error_messages() {
        let e = MbufError::NoTailroom {
            needed: 10,
            available: 3,
        };
        assert_eq!(e.to_string(), "mbuf: need 10 bytes of tailroom, have 3");
    }
}
