//! Receive-buffer reuse for the dispatcher and its transfers.
//!
//! Every live transfer needs one max-size datagram buffer; recycling them
//! keeps the working set bounded by the concurrent-transfer cap instead of
//! growing with request churn. Single-threaded by construction, so the pool
//! is a plain `RefCell` behind an `Rc`.

use std::cell::RefCell;

use bytes::BytesMut;

use crate::MAX_PACKET_SIZE;

const POOL_CAPACITY: usize = 16;

pub(crate) struct BufferPool {
    pool: RefCell<Vec<BytesMut>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            pool: RefCell::new(Vec::with_capacity(POOL_CAPACITY)),
            buffer_size: MAX_PACKET_SIZE,
        }
    }

    /// A cleared buffer sized for the largest possible datagram.
    pub fn acquire(&self) -> BytesMut {
        let mut buf = self
            .pool
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        buf.clear();
        buf.resize(self.buffer_size, 0);
        buf
    }

    /// Hand a buffer back; dropped instead if the pool is full.
    pub fn release(&self, mut buf: BytesMut) {
        let mut pool = self.pool.borrow_mut();
        if pool.len() < POOL_CAPACITY {
            buf.clear();
            pool.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_buffers_up_to_capacity() {
        let pool = BufferPool::new();
        let buf = pool.acquire();
        assert_eq!(buf.len(), MAX_PACKET_SIZE);
        pool.release(buf);
        assert_eq!(pool.pool.borrow().len(), 1);

        for _ in 0..POOL_CAPACITY + 4 {
            pool.release(BytesMut::new());
        }
        assert_eq!(pool.pool.borrow().len(), POOL_CAPACITY);
    }
}
