//! Pooled byte buffers for chunk payloads
//!
//! Every buffer handed out by a [`BufferPool`] is wrapped in a [`PooledBuffer`]
//! which returns it to the pool when dropped, so a buffer is released exactly
//! once on every exit path.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Source of reusable byte buffers
pub trait BufferPool: Send + Sync + fmt::Debug {
    /// Hand out an empty buffer with at least `capacity` bytes of capacity
    fn acquire(&self, capacity: usize) -> Vec<u8>;

    /// Take a buffer back
    fn release(&self, buffer: Vec<u8>);

    /// Current accounting for this pool
    fn stats(&self) -> PoolStats;
}

/// Buffer accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub acquired: usize,
    pub released: usize,
    pub outstanding: usize,
    pub peak_outstanding: usize,
    pub cached: usize,
}

/// Keep at most this many idle buffers per size class
const MAX_CACHED_PER_CLASS: usize = 8;

/// Pool of heap buffers bucketed by power-of-two capacity
#[derive(Debug, Default)]
pub struct DirectBufferPool {
    free: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
    outstanding: AtomicUsize,
    peak_outstanding: AtomicUsize,
}

impl DirectBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn size_class(capacity: usize) -> usize {
        capacity.max(64).next_power_of_two()
    }

    fn track_acquire(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;

        // Update peak if necessary
        loop {
            let peak = self.peak_outstanding.load(Ordering::SeqCst);
            if now <= peak {
                break;
            }
            if self
                .peak_outstanding
                .compare_exchange(peak, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
    }
}

impl BufferPool for DirectBufferPool {
    fn acquire(&self, capacity: usize) -> Vec<u8> {
        let class = Self::size_class(capacity);
        let cached = self.free.lock().get_mut(&class).and_then(|list| list.pop());
        self.track_acquire();

        match cached {
            Some(mut buffer) => {
                buffer.clear();
                buffer
            }
            None => Vec::with_capacity(class),
        }
    }

    fn release(&self, buffer: Vec<u8>) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);

        // Only recycle buffers that still match their class exactly
        let class = buffer.capacity();
        if class.is_power_of_two() && class >= 64 {
            let mut free = self.free.lock();
            let list = free.entry(class).or_default();
            if list.len() < MAX_CACHED_PER_CLASS {
                list.push(buffer);
            }
        }
    }

    fn stats(&self) -> PoolStats {
        let cached = self.free.lock().values().map(Vec::len).sum();
        PoolStats {
            acquired: self.acquired.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
            outstanding: self.outstanding.load(Ordering::SeqCst),
            peak_outstanding: self.peak_outstanding.load(Ordering::SeqCst),
            cached,
        }
    }
}

/// A buffer that goes back to its pool when dropped
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Option<Arc<dyn BufferPool>>,
}

impl PooledBuffer {
    /// Acquire a buffer with at least `capacity` bytes from `pool`
    pub fn acquire(pool: &Arc<dyn BufferPool>, capacity: usize) -> Self {
        Self {
            buffer: pool.acquire(capacity),
            pool: Some(Arc::clone(pool)),
        }
    }

    /// Wrap an already allocated buffer that belongs to no pool
    pub fn unpooled(buffer: Vec<u8>) -> Self {
        Self { buffer, pool: None }
    }

    /// Release the buffer now instead of at end of scope
    pub fn discard(self) {
        drop(self);
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.buffer));
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buffer.len())
            .field("capacity", &self.buffer.capacity())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}
