//! Request coordination
//!
//! The coordinator is the composition point a serving layer calls once per
//! request. It owns the decision sequence; storage, hashing, locking and
//! production stay behind their own seams and are injected at construction.
//!
//! # Architecture
//!
//! ```text
//!   Checking ---fresh--------------------------> serve cached bytes
//!      | miss or stale
//!      v
//!   Locking (keyed, FIFO)
//!      | granted
//!      v
//!   Recheck ---became fresh-------------------> serve cached bytes
//!      | still stale
//!      v
//!   Producing (external pipeline, at most one per key at a time)
//!      | bytes
//!      v
//!   Writing (temp + rename) ------------------> serve produced bytes
//! ```
//!
//! The recheck exists because the lock is only requested after a miss: by
//! the time it is granted, a racing caller may already have produced and
//! written the entry, and that result must be served instead of produced
//! again. Production failures pass through unchanged; nothing is retried
//! here.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::hash::{extension_from_key, hashed_name};
use crate::keylock::KeyedLock;
use crate::pool::{BufferPool, PooledBuffer};
use crate::store::{ArtifactStore, DiskCache};

/// One artifact lookup as seen by the coordinator.
#[derive(Debug, Clone)]
pub struct ArtifactRequest {
    /// Opaque fingerprint of the requested artifact; equal requests carry
    /// byte-identical keys.
    pub key: String,
    /// Source artifact consulted by the source-aware staleness policy.
    pub source: Option<PathBuf>,
    /// Entries last written at or before this instant count as stale.
    pub min_fresh: SystemTime,
}

impl ArtifactRequest {
    /// Request the artifact for `key` with the given freshness floor.
    #[must_use]
    pub fn new(key: impl Into<String>, min_fresh: SystemTime) -> Self {
        Self {
            key: key.into(),
            source: None,
            min_fresh,
        }
    }

    /// Attach the source path the staleness check may compare against.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Failure surfaced by a [`Producer`], passed through uninterpreted.
pub type ProduceError = Box<dyn std::error::Error + Send + Sync>;

/// External pipeline that regenerates an artifact the cache cannot serve.
///
/// Invoked only inside the per-key critical section, so at most one
/// production per key runs at a time however many requests race.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Produce the artifact bytes for `request`, allocating the output from
    /// `pool`.
    ///
    /// # Errors
    ///
    /// Implementations return their own failure, which the coordinator
    /// wraps as [`Error::Production`] without interpreting it.
    async fn produce(
        &self,
        request: &ArtifactRequest,
        pool: &BufferPool,
    ) -> std::result::Result<PooledBuffer, ProduceError>;
}

/// Serves artifact requests from the cache, regenerating entries through a
/// [`Producer`] when they are absent or stale.
pub struct Coordinator<S = DiskCache> {
    store: S,
    producer: Arc<dyn Producer>,
    locks: KeyedLock,
    pool: BufferPool,
    config: CacheConfig,
    lock_timeout: Option<Duration>,
}

impl Coordinator<DiskCache> {
    /// Build a coordinator over a [`DiskCache`] rooted at
    /// `config.cache_root`, with one buffer pool shared by the store and
    /// the producer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the configuration is invalid.
    pub fn with_disk_store(config: CacheConfig, producer: Arc<dyn Producer>) -> Result<Self> {
        let pool = BufferPool::new();
        let store = DiskCache::new(config.clone(), pool.clone())?;
        Self::new(store, producer, pool, config)
    }
}

impl<S: ArtifactStore> Coordinator<S> {
    /// Wire a coordinator from explicit parts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the configuration is invalid.
    pub fn new(
        store: S,
        producer: Arc<dyn Producer>,
        pool: BufferPool,
        config: CacheConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            producer,
            locks: KeyedLock::new(),
            pool,
            config,
            lock_timeout: None,
        })
    }

    /// Bound how long a request may wait for the per-key lock; waits past
    /// the limit fail with [`Error::LockCancelled`].
    #[must_use]
    pub fn with_lock_timeout(mut self, limit: Duration) -> Self {
        self.lock_timeout = Some(limit);
        self
    }

    /// The pool backing this coordinator's buffers.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Number of keys currently locked or waited on, for monitoring.
    #[must_use]
    pub fn active_locks(&self) -> usize {
        self.locks.entry_count()
    }

    /// Serve the artifact for `request`, from cache when fresh, otherwise by
    /// producing and writing it exactly once per key however many identical
    /// requests arrive concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] for cache I/O failures,
    /// [`Error::SourceUnavailable`] when the source-aware policy finds no
    /// source (terminal), [`Error::Production`] wrapping the pipeline's own
    /// failure, and [`Error::LockCancelled`] when a configured lock wait
    /// limit elapses.
    pub async fn fetch(&self, request: &ArtifactRequest) -> Result<PooledBuffer> {
        let extension = extension_from_key(&request.key, &self.config.default_extension);
        let name = hashed_name(&request.key, self.config.name_length, extension)?;
        let source = request.source.as_deref();

        // Checking: the common case is served without touching the lock.
        let info = self
            .store
            .check_staleness(&name, source, request.min_fresh)
            .await?;
        if !info.expired && let Some(buffer) = self.store.get(&name).await? {
            debug!(key = %request.key, name = %name, "cache hit");
            return Ok(buffer);
        }

        debug!(key = %request.key, name = %name, "cache miss or stale");

        // Locking: all concurrent requesters of this key line up here; the
        // first one through regenerates for the rest.
        let _guard = match self.lock_timeout {
            Some(limit) => self.locks.acquire_timeout(&request.key, limit).await?,
            None => self.locks.acquire(&request.key).await,
        };

        // Recheck: a racing caller may have refreshed the entry while this
        // one waited for the lock.
        let info = self
            .store
            .check_staleness(&name, source, request.min_fresh)
            .await?;
        if !info.expired && let Some(buffer) = self.store.get(&name).await? {
            debug!(key = %request.key, name = %name, "entry refreshed while waiting");
            return Ok(buffer);
        }

        // Producing and Writing.
        debug!(key = %request.key, name = %name, "producing");
        let produced = self
            .producer
            .produce(request, &self.pool)
            .await
            .map_err(|err| Error::production(&request.key, err))?;
        let written_at = self.store.set(&name, &produced).await?;
        debug!(
            key = %request.key,
            name = %name,
            bytes = produced.len(),
            written_at = ?written_at,
            "produced and written"
        );

        Ok(produced)
    }
}
