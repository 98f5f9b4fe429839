//! Fixed set of chunk buffers sized when the engine is built
//!
//! The flash writer checks one buffer out per session instead of
//! allocating per chunk. Dropping the [`PooledBuffer`] returns it.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

struct PoolInner {
    free: Mutex<Vec<Box<[u8]>>>,
    buffer_size: usize,
}

impl PoolInner {
    fn give_back(&self, buffer: Box<[u8]>) {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buffer);
    }
}

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let free = (0..count)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                buffer_size,
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Buffers currently available for checkout
    pub fn available(&self) -> usize {
        self.inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Take a zeroed buffer, or `None` if all are checked out
    pub fn checkout(&self) -> Option<PooledBuffer> {
        let mut buffer = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()?;
        buffer.fill(0);
        Some(PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(&self.inner),
        })
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`]
pub struct PooledBuffer {
    buffer: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.give_back(buffer);
        }
    }
}
