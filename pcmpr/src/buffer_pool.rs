//! Size-class buffer cache.
//!
//! Chunk source and destination buffers are recycled across assignments so
//! codec calls do not pay an allocation per chunk. Requests are rounded up
//! to the nearest registered power-of-two class; sizes outside the class
//! range fall through to the plain allocator.

use std::sync::{Mutex, OnceLock};

const MIN_CLASS_SHIFT: u32 = 12; // 4 KiB
const MAX_CLASS_SHIFT: u32 = 27; // 128 MiB
/// Buffers kept per class. Enough for a full worker ring without letting an
/// idle pool pin large amounts of memory.
const MAX_FREE_PER_CLASS: usize = 64;

struct SizeClass {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

pub struct BufferPool {
    classes: Vec<SizeClass>,
}

static GLOBAL_POOL: OnceLock<BufferPool> = OnceLock::new();

impl BufferPool {
    fn new() -> Self {
        let classes = (MIN_CLASS_SHIFT..=MAX_CLASS_SHIFT)
            .map(|shift| SizeClass {
                size: 1usize << shift,
                free: Mutex::new(Vec::new()),
            })
            .collect();
        Self { classes }
    }

    /// The process-wide pool. Size-class tables are initialized once.
    pub fn global() -> &'static BufferPool {
        GLOBAL_POOL.get_or_init(BufferPool::new)
    }

    fn class_index(&self, len: usize) -> Option<usize> {
        if len > self.classes[self.classes.len() - 1].size {
            return None;
        }
        Some(
            self.classes
                .iter()
                .position(|c| c.size >= len)
                .expect("len within max class"),
        )
    }

    /// Get an empty buffer with capacity for at least `len` bytes.
    pub fn get(&self, len: usize) -> Vec<u8> {
        match self.class_index(len) {
            Some(idx) => {
                let mut free = self.classes[idx].free.lock().expect("pool lock");
                free.pop()
                    .unwrap_or_else(|| Vec::with_capacity(self.classes[idx].size))
            }
            None => Vec::with_capacity(len),
        }
    }

    /// Return a buffer to its class free list.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        // Buffers with capacities not matching a class exactly were either
        // allocated outside the pool or grown by a caller; drop them.
        if let Some(idx) = self.classes.iter().position(|c| c.size == buf.capacity()) {
            let mut free = self.classes[idx].free.lock().expect("pool lock");
            if free.len() < MAX_FREE_PER_CLASS {
                free.push(buf);
            }
        }
    }
}
