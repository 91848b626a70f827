//! # Packet Buffers
//!
//! The unit of exchange between the socket, the windows and the
//! application is an owned packet buffer ([`SkBuff`]): payload bytes plus
//! the parsed per-packet metadata the windows key on. Payloads are
//! reference-counted (`bytes::Bytes`), so a buffer held by a window and a
//! reassembly list at once costs one allocation; it is freed when the last
//! holder drops.
//!
//! [`BufferPool`] is the backing slab: a capped LIFO free-list of
//! payload-sized buffers giving O(1) reuse with no fragmentation on the
//! hot path. Each window owns its own pool; there is no cross-window
//! sharing.

use bytes::{Bytes, BytesMut};

use crate::tsi::Tsi;

// ─── Fragment metadata ──────────────────────────────────────────────────────

/// Fragment-group fields carried by the fragment option of a data packet.
///
/// An APDU larger than one TSDU is split over consecutive sequence numbers;
/// every fragment names the group's first sequence, its own byte offset and
/// the total APDU length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    pub first_sqn: u32,
    pub offset: u32,
    pub apdu_len: u32,
}

// ─── SkBuff ─────────────────────────────────────────────────────────────────

/// An owned packet buffer: TSDU payload plus window metadata.
///
/// Cloning is cheap — the payload is shared, not copied.
#[derive(Debug, Clone)]
pub struct SkBuff {
    /// Session the packet belongs to.
    pub tsi: Tsi,
    /// Assigned (send) or parsed (receive) sequence number.
    pub sequence: u32,
    /// Send or receive timestamp, PGM microseconds.
    pub tstamp: u64,
    /// Present when the packet is one fragment of a larger APDU.
    pub fragment: Option<FragmentInfo>,
    /// TSDU bytes.
    pub payload: Bytes,
}

impl SkBuff {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// ─── BufferPool ─────────────────────────────────────────────────────────────

/// Capped LIFO free-list of payload buffers.
///
/// `alloc` pops a recycled buffer or grows the heap; `recycle` returns a
/// buffer when its refcount proves it unshared, up to `max_free` retained
/// buffers. Excess stays allocated until shutdown only in the sense that
/// dropped buffers return to the global allocator, not the pool.
pub struct BufferPool {
    free: Vec<BytesMut>,
    buf_size: usize,
    max_free: usize,
    /// Buffers handed out and not yet recycled or dropped elsewhere.
    outstanding: u64,
}

impl BufferPool {
    /// Create a pool of `buf_size`-byte buffers, pre-allocating
    /// `preallocate` of them, retaining at most `max_free` on the
    /// free-list.
    pub fn new(buf_size: usize, preallocate: usize, max_free: usize) -> Self {
        let max_free = max_free.max(preallocate);
        let mut free = Vec::with_capacity(max_free.min(4096));
        for _ in 0..preallocate {
            free.push(BytesMut::with_capacity(buf_size));
        }
        BufferPool {
            free,
            buf_size,
            max_free,
            outstanding: 0,
        }
    }

    /// Take a cleared buffer with at least `buf_size` capacity.
    pub fn alloc(&mut self) -> BytesMut {
        self.outstanding += 1;
        match self.free.pop() {
            Some(buf) => buf,
            None => {
                tracing::trace!(buf_size = self.buf_size, "free-list empty, growing");
                BytesMut::with_capacity(self.buf_size)
            }
        }
    }

    /// Return a frozen payload to the pool. Recycles the allocation when
    /// this was the last reference, otherwise the other holders keep it
    /// alive and the pool forgets it.
    pub fn release(&mut self, payload: Bytes) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if let Ok(mut buf) = payload.try_into_mut() {
            if self.free.len() < self.max_free {
                buf.clear();
                self.free.push(buf);
            }
        }
    }

    /// Buffers currently handed out.
    pub fn outstanding(&self) -> u64 {
        self.outstanding
    }

    /// Buffers parked on the free-list.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}
