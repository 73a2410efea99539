//! Reusable read buffers for the UDP listeners.
//!
//! Every socket read borrows one fixed-capacity buffer from the shared
//! pool and returns it when the [`Buffer`] guard drops, whichever way the
//! read path exits. Capacity equals the configured socket read buffer, so
//! one buffer always holds one full datagram.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// A pool of fixed-capacity byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buffer_size` bytes, keeping at
    /// most `max_idle` of them around between reads.
    #[must_use]
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            max_idle,
            free: Mutex::new(Vec::with_capacity(max_idle)),
        })
    }

    /// Borrow a buffer.
    ///
    /// The buffer's length is reset to the pool's buffer size regardless of
    /// what the previous holder left behind.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> Buffer {
        let mut data = self
            .free
            .lock()
            .expect("buffer pool mutex poisoned")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size));
        data.resize(self.buffer_size, 0);
        Buffer {
            data,
            pool: Arc::clone(self),
        }
    }

    /// The size of every buffer this pool hands out.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn release(&self, data: Vec<u8>) {
        let mut free = self.free.lock().expect("buffer pool mutex poisoned");
        if free.len() < self.max_idle {
            free.push(data);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().expect("buffer pool mutex poisoned").len()
    }
}

/// A borrowed buffer; returns itself to the pool on drop.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.data));
    }
}
