//! Bounded byte queue between the download and the flash writer
//!
//! One producer pushes network data, one consumer drains it at flash speed.
//! When the queue is full the producer waits, which is what throttles the
//! transfer to the flash write rate. Byte order is preserved across the
//! wraparound point and `len() + free() == capacity()` always holds.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Cursors {
    storage: Box<[u8]>,
    read: usize,
    write: usize,
    used: usize,
}

impl Cursors {
    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn push(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.capacity() - self.used);
        let first = count.min(self.capacity() - self.write);

        self.storage[self.write..self.write + first].copy_from_slice(&data[..first]);
        self.storage[..count - first].copy_from_slice(&data[first..count]);

        self.write = (self.write + count) % self.capacity();
        self.used += count;
        count
    }

    fn pop(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.used);
        let first = count.min(self.capacity() - self.read);

        out[..first].copy_from_slice(&self.storage[self.read..self.read + first]);
        out[first..count].copy_from_slice(&self.storage[..count - first]);

        self.read = (self.read + count) % self.capacity();
        self.used -= count;
        count
    }
}

/// Single-producer single-consumer byte ring
pub struct RingBuffer {
    cursors: Mutex<Cursors>,
    data_ready: Notify,
    space_ready: Notify,
}

impl RingBuffer {
    /// Create a ring with the given capacity.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            cursors: Mutex::new(Cursors {
                storage: vec![0u8; capacity].into_boxed_slice(),
                read: 0,
                write: 0,
                used: 0,
            }),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Cursors> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Bytes committed and not yet read
    pub fn len(&self) -> usize {
        self.lock().used
    }

    /// Bytes that can be pushed without waiting
    pub fn free(&self) -> usize {
        let cursors = self.lock();
        cursors.capacity() - cursors.used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push as much of `data` as fits right now; returns the bytes taken
    pub fn try_push(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let pushed = self.lock().push(data);
        if pushed > 0 {
            self.data_ready.notify_one();
        }
        pushed
    }

    /// Pop up to `out.len()` bytes; returns the bytes copied
    pub fn try_pop(&self, out: &mut [u8]) -> usize {
        let popped = self.lock().pop(out);
        if popped > 0 {
            self.space_ready.notify_one();
        }
        popped
    }

    /// Pop exactly `out.len()` bytes, or nothing if fewer are committed
    pub fn pop_exact(&self, out: &mut [u8]) -> bool {
        let mut cursors = self.lock();
        if cursors.used < out.len() {
            return false;
        }
        cursors.pop(out);
        drop(cursors);
        self.space_ready.notify_one();
        true
    }

    /// Drop all buffered bytes
    pub fn clear(&self) {
        let mut cursors = self.lock();
        cursors.read = 0;
        cursors.write = 0;
        cursors.used = 0;
        drop(cursors);
        self.space_ready.notify_one();
    }

    /// Push `data`, waiting for space for at most `timeout`.
    ///
    /// Returns the number of bytes pushed, which is short of `data.len()`
    /// only if the consumer did not free enough space in time.
    pub async fn push_timeout(&self, data: &[u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut pushed = 0;

        loop {
            pushed += self.try_push(&data[pushed..]);
            if pushed == data.len() {
                return pushed;
            }

            if tokio::time::timeout_at(deadline, self.space_ready.notified())
                .await
                .is_err()
            {
                return pushed + self.try_push(&data[pushed..]);
            }
        }
    }

    /// Wait until at least `len` bytes are committed, for at most `timeout`
    pub async fn wait_readable(&self, len: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if self.len() >= len {
                return true;
            }

            if tokio::time::timeout_at(deadline, self.data_ready.notified())
                .await
                .is_err()
            {
                return self.len() >= len;
            }
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cursors = self.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &cursors.capacity())
            .field("read", &cursors.read)
            .field("write", &cursors.write)
            .field("used", &cursors.used)
            .finish()
    }
}
