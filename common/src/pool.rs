//! Reusable byte buffers.
//!
//! Two pools back the engine: a fixed 32 KiB pool for streaming copies and
//! compares, and a size-classed power-of-two pool for whole-part buffers.
//! Buffers come out wrapped in guards that return them on drop, so no
//! failure path leaks.

use std::sync::{Arc, Mutex};

pub const STREAM_BUF_SIZE: usize = 32 << 10;

/// Largest part buffer class: 8 GiB.
const MAX_CLASS: usize = 33;

pub struct BufferPool {
    size: usize,
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            bufs: Mutex::new(Vec::new()),
        })
    }

    pub fn acquire(self: &Arc<Self>) -> PoolBuf {
        let buf = self
            .bufs
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size]);
        PoolBuf {
            pool: self.clone(),
            buf,
        }
    }
}

pub struct PoolBuf {
    pool: Arc<BufferPool>,
    buf: Vec<u8>,
}

impl PoolBuf {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.bufs.lock().unwrap().push(buf);
    }
}

/// `ceil(log2(n))`, the size class of a buffer of `n` bytes.
pub fn power_of_two(n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    (usize::BITS - (n - 1).leading_zeros()) as usize
}

/// Size-classed pool for part buffers. Acquire returns a guard sliced to the
/// requested length, backed by the next power-of-two class.
pub struct SizedPools {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl SizedPools {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            classes: (0..=MAX_CLASS).map(|_| Mutex::new(Vec::new())).collect(),
        })
    }

    pub fn acquire(self: &Arc<Self>, len: usize) -> SizedBuf {
        let class = power_of_two(len);
        assert!(class <= MAX_CLASS, "part buffer of {} bytes", len);
        let buf = self.classes[class]
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; 1 << class]);
        debug_assert!(buf.len() == 1 << class);
        SizedBuf {
            pool: self.clone(),
            class,
            len,
            buf,
        }
    }
}

pub struct SizedBuf {
    pool: Arc<SizedPools>,
    class: usize,
    len: usize,
    buf: Vec<u8>,
}

impl SizedBuf {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

impl Drop for SizedBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.classes[self.class].lock().unwrap().push(buf);
    }
}
