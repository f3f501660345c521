//! Pooled byte buffers
//!
//! Cache reads and producer outputs move through exact-length buffers drawn
//! from a shared pool of power-of-two blocks, so steady-state request traffic
//! stops allocating once the pool is warm. A [`PooledBuffer`] exposes exactly
//! the requested length (the backing block may be larger) and returns its
//! block to the pool when dropped, which makes use-after-return and
//! double-return unrepresentable. The pool keeps a bounded number of blocks
//! per size class and lets the rest free normally.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::trace;

/// Smallest block handed out, matching the common read-chunk floor.
const MIN_BLOCK_SIZE: usize = 4096;

/// Largest block the pool retains; bigger requests bypass pooling.
const MAX_RETAINED_BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Size classes from `MIN_BLOCK_SIZE` doubling up to `MAX_RETAINED_BLOCK_SIZE`.
const CLASS_COUNT: usize = 12;

/// Blocks kept per size class; surplus returns fall through to the allocator.
const MAX_RETAINED_PER_CLASS: usize = 32;

/// Shared allocator for transient cache I/O buffers.
///
/// Cloning is cheap and every clone feeds the same free lists.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    shelves: [Mutex<Vec<Vec<u8>>>; CLASS_COUNT],
}

impl BufferPool {
    /// Create an empty pool; blocks are minted on demand and retained on drop.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                shelves: std::array::from_fn(|_| Mutex::new(Vec::new())),
            }),
        }
    }

    /// Hand out a zeroed buffer of exactly `size` bytes.
    ///
    /// The backing block comes from the smallest size class that fits, so the
    /// allocation may be larger than `size`; the buffer never shows the
    /// excess. Size 0 is valid and yields an empty view.
    #[must_use]
    pub fn allocate(&self, size: usize) -> PooledBuffer {
        let Some(class) = size_class(size) else {
            trace!(size, "allocating oversized buffer outside the pool");
            return PooledBuffer {
                data: vec![0u8; size],
                class: None,
                pool: Weak::new(),
            };
        };

        let mut block = self
            .inner
            .pop_block(class)
            .unwrap_or_else(|| Vec::with_capacity(block_size(class)));
        block.clear();
        block.resize(size, 0);

        PooledBuffer {
            data: block,
            class: Some(class),
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Number of idle blocks currently held across all size classes.
    #[must_use]
    pub fn retained_blocks(&self) -> usize {
        self.inner
            .shelves
            .iter()
            .map(|shelf| lock_shelf(shelf).len())
            .sum()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolInner {
    fn pop_block(&self, class: usize) -> Option<Vec<u8>> {
        lock_shelf(&self.shelves[class]).pop()
    }

    fn reclaim(&self, class: usize, block: Vec<u8>) {
        let mut shelf = lock_shelf(&self.shelves[class]);
        #[cfg(debug_assertions)]
        {
            let incoming = block.as_ptr();
            debug_assert!(
                shelf.iter().all(|held| held.as_ptr() != incoming),
                "buffer block reclaimed twice"
            );
        }
        if shelf.len() < MAX_RETAINED_PER_CLASS {
            shelf.push(block);
        }
    }
}

// A free list cannot be left mid-mutation by a panic we care about; recover
// the guard instead of propagating poison.
fn lock_shelf(shelf: &Mutex<Vec<Vec<u8>>>) -> MutexGuard<'_, Vec<Vec<u8>>> {
    shelf.lock().unwrap_or_else(PoisonError::into_inner)
}

fn size_class(size: usize) -> Option<usize> {
    if size > MAX_RETAINED_BLOCK_SIZE {
        return None;
    }
    let rounded = size.max(1).next_power_of_two().max(MIN_BLOCK_SIZE);
    Some((rounded / MIN_BLOCK_SIZE).trailing_zeros() as usize)
}

fn block_size(class: usize) -> usize {
    MIN_BLOCK_SIZE << class
}

/// An exact-length byte buffer on loan from a [`BufferPool`].
///
/// Dereferences to `[u8]` over the valid region only. Dropping the buffer
/// returns its block to the pool.
pub struct PooledBuffer {
    data: Vec<u8>,
    class: Option<usize>,
    pool: Weak<PoolInner>,
}

impl PooledBuffer {
    /// Capacity of the backing block, for diagnostics.
    #[must_use]
    pub fn block_capacity(&self) -> usize {
        self.data.capacity()
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("block_capacity", &self.data.capacity())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(class) = self.class
            && let Some(inner) = self.pool.upgrade()
        {
            inner.reclaim(class, std::mem::take(&mut self.data));
        }
    }
}
