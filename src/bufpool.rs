use std::sync::Mutex;

/// Largest buffer the pool will retain; anything bigger is dropped on
/// release so one oversized sync does not pin memory forever.
const MAX_POOLED_CAPACITY: usize = 1 << 24;

/// A pool of reusable scratch buffers bounding per-operation allocation on
/// the sync and write paths.
#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    pool: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Creates a pool whose buffers start out with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pool: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> Vec<u8> {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.pop()
            .unwrap_or_else(|| Vec::with_capacity(self.capacity))
    }

    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buf.clear();
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if pool.len() < 8 {
            pool.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse() {
        let pool = BufferPool::new(64);
        let mut buf = pool.get();
        buf.extend_from_slice(b"scratch");
        let cap = buf.capacity();
        pool.put(buf);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn test_oversized_dropped() {
        let pool = BufferPool::new(64);
        pool.put(Vec::with_capacity(MAX_POOLED_CAPACITY + 1));
        assert_eq!(pool.get().capacity(), 64);
    }
}
