//! Reusable relay buffers.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Upper bound on idle buffers kept for reuse
const MAX_RETAINED: usize = 1024;

/// BufferPool hands out fixed-size byte buffers and takes them back when
/// the handle is dropped. Cloning is cheap; clones share the same pool.
#[derive(Clone, Debug)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    buf_size: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// new creates an empty pool of buffers of `buf_size` bytes
    pub fn new(buf_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buf_size: buf_size.max(1),
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    /// get takes an idle buffer or allocates a fresh one
    pub fn get(&self) -> PooledBuffer {
        let reused = match self.inner.idle.lock() {
            Ok(mut idle) => idle.pop(),
            Err(_) => None,
        };
        let buf = reused.unwrap_or_else(|| vec![0u8; self.inner.buf_size]);
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    /// idle_count is the number of buffers waiting for reuse
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.inner.buf_size {
            return;
        }
        if let Ok(mut idle) = self.inner.idle.lock() {
            if idle.len() < MAX_RETAINED {
                idle.push(buf);
            }
        }
    }
}

/// PooledBuffer returns its storage to the pool on drop
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: BufferPool,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.put(buf);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_have_configured_size() {
        let pool = BufferPool::new(4096);
        let buf = pool.get();
        assert_eq!(buf.len(), 4096);
        assert_eq!(pool.buf_size(), 4096);
    }

    #[test]
    fn test_dropped_buffer_is_reused() {
        let pool = BufferPool::new(64);
        assert_eq!(pool.idle_count(), 0);

        let mut buf = pool.get();
        buf[0] = 0xAB;
        let ptr = buf.as_ptr();
        drop(buf);
        assert_eq!(pool.idle_count(), 1);

        let again = pool.get();
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_concurrent_get_put() {
        let pool = BufferPool::new(128);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let buf = pool.get();
                        assert_eq!(buf.len(), 128);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.idle_count() <= 8);
    }
}
