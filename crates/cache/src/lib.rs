//! Sharded on-disk caching for derived image artifacts
//!
//! This crate answers one question for a serving layer: given the
//! fingerprint of an expensive, deterministic transformation, hand back the
//! result bytes, regenerating them at most once however many identical
//! requests arrive at the same time.
//!
//! - Deterministic addressing: a key hashes to a short uppercase hex name
//!   that doubles as a sharded path under the cache root
//! - Staleness policies: a caller-supplied freshness floor, optionally
//!   combined with the source artifact's last-write time
//! - Single-producer regeneration: a per-key FIFO async lock plus a
//!   double-checked re-read collapse concurrent misses onto one producer
//! - Pooled I/O: reads and producer outputs move through exact-length
//!   buffers recycled by a shared pool
//!
//! # Architecture
//!
//! ```text
//!                       +-------------+
//!    request key -----> | Coordinator | ----------> bytes (PooledBuffer)
//!                       +-------------+
//!                        |    |     |
//!          hash the key  |    |     | at most one producer per key
//!                        v    |     v
//!                  HashedName |   KeyedLock
//!                             v
//!                         DiskCache ---- sharded tree under cache_root
//!                             |
//!                         BufferPool
//! ```
//!
//! Hosts construct a [`CacheConfig`], implement [`Producer`] over their
//! processing pipeline, and call [`Coordinator::fetch`] per request. The
//! storage seam is the [`ArtifactStore`] trait; [`DiskCache`] is the shipped
//! implementation.

mod error;

pub mod config;
pub mod coordinator;
pub mod hash;
pub mod keylock;
pub mod pool;
pub mod store;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use config::CacheConfig;
pub use coordinator::{ArtifactRequest, Coordinator, ProduceError, Producer};
pub use hash::{HashedName, extension_from_key, hashed_name};
pub use keylock::{KeyGuard, KeyedLock};
pub use pool::{BufferPool, PooledBuffer};
pub use store::{ArtifactStore, DiskCache, EntryInfo};
