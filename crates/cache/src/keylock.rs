//! Per-key asynchronous locking
//!
//! Regenerating a cache entry must happen at most once per key at a time, so
//! concurrent requests for the same artifact serialize while requests for
//! different artifacts proceed in parallel. [`KeyedLock`] keeps one fair
//! async mutex per active key in a table guarded by a short-held mutex that
//! is never held across an await. Entries are reference counted by holders
//! plus waiters and are removed when the count reaches zero, so the table
//! stays bounded however many distinct keys pass through.
//!
//! Acquisition is cancellation safe: a caller that drops its `acquire`
//! future, or exceeds [`KeyedLock::acquire_timeout`], leaves the queue
//! without disturbing the remaining waiters' order and without leaking the
//! table entry.
//!
//! Re-acquiring a key the caller already holds deadlocks; nested acquisition
//! of the same key is the caller's bug by contract.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

use crate::error::{Error, Result};

/// Grants exclusive per-key critical sections to async callers.
///
/// Clones share one table. Waiters for the same key wake in FIFO order.
#[derive(Clone, Default)]
pub struct KeyedLock {
    table: Arc<LockTable>,
}

#[derive(Default)]
struct LockTable {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    mutex: Arc<AsyncMutex<()>>,
    /// Holders plus queued waiters; the entry lives while this is non-zero.
    waiters: usize,
}

/// Decrements the waiter count when dropped, whether the acquisition
/// completed, timed out, or was cancelled mid-wait.
struct Registration {
    table: Arc<LockTable>,
    key: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.table.release(&self.key);
    }
}

/// Exclusive access to one key, released on drop.
pub struct KeyGuard {
    // Field order is drop order: the mutex must be released before the
    // registration decrements the count, otherwise a fresh entry could be
    // created for a key whose mutex is still held.
    _permit: OwnedMutexGuard<()>,
    registration: Registration,
}

impl fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard")
            .field("key", &self.registration.key)
            .finish()
    }
}

impl KeyedLock {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other caller holds `key`, then take it.
    ///
    /// Dropping the returned future while it waits removes this caller from
    /// the queue and leaves the lock state untouched.
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let (mutex, registration) = self.register(key);
        let permit = mutex.lock_owned().await;
        trace!(key = %key, "keyed lock acquired");
        KeyGuard {
            _permit: permit,
            registration,
        }
    }

    /// Like [`acquire`](Self::acquire), but give up after `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockCancelled`] when the limit elapses first.
    pub async fn acquire_timeout(&self, key: &str, limit: Duration) -> Result<KeyGuard> {
        match tokio::time::timeout(limit, self.acquire(key)).await {
            Ok(guard) => Ok(guard),
            Err(_elapsed) => {
                trace!(key = %key, ?limit, "keyed lock wait abandoned");
                Err(Error::lock_cancelled(key))
            }
        }
    }

    /// Number of keys with at least one holder or waiter, for monitoring
    /// that the table is pruned.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        lock_entries(&self.table.entries).len()
    }

    fn register(&self, key: &str) -> (Arc<AsyncMutex<()>>, Registration) {
        let mut entries = lock_entries(&self.table.entries);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            mutex: Arc::new(AsyncMutex::new(())),
            waiters: 0,
        });
        entry.waiters += 1;
        let mutex = Arc::clone(&entry.mutex);
        drop(entries);

        (
            mutex,
            Registration {
                table: Arc::clone(&self.table),
                key: key.to_string(),
            },
        )
    }
}

impl LockTable {
    fn release(&self, key: &str) {
        let mut entries = lock_entries(&self.entries);
        let Some(entry) = entries.get_mut(key) else {
            debug_assert!(false, "released a key with no table entry: {key}");
            return;
        };
        entry.waiters -= 1;
        if entry.waiters == 0 {
            entries.remove(key);
            trace!(key = %key, "keyed lock entry pruned");
        }
    }
}

// Table mutations are plain map operations; a poisoned mutex cannot leave
// them half-applied, so recover the guard instead of propagating poison.
fn lock_entries(
    entries: &Mutex<HashMap<String, Entry>>,
) -> MutexGuard<'_, HashMap<String, Entry>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}
