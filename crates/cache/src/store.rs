//! Sharded on-disk artifact storage
//!
//! Entries live under the configured cache root at a path derived from the
//! hashed name: one single-character directory per hex character, then the
//! full name as the file name. The shard depth equals the hex length, so an
//! 8-character name for `img/cat.jpg?w=200` lands at
//!
//! ```text
//! <cache_root>/2/6/D/D/B/4/8/2/26DDB482.jpg
//! ```
//!
//! which bounds per-directory entry counts however many artifacts accumulate.
//! Reads fill exact-length pooled buffers and either complete fully or fail;
//! writes go to a temporary file in the leaf directory, are synced, then
//! renamed over the final path so readers never observe a torn entry.
//! Eviction is deliberately absent; entries are only ever superseded in
//! place.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::hash::HashedName;
use crate::pool::{BufferPool, PooledBuffer};

/// Freshness report for one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    /// Whether the entry must be regenerated before serving.
    pub expired: bool,
    /// Last-write time, `None` when the entry does not exist.
    pub last_modified: Option<SystemTime>,
    /// Entry size in bytes, 0 when the entry does not exist.
    pub length: u64,
}

impl EntryInfo {
    const fn missing() -> Self {
        Self {
            expired: true,
            last_modified: None,
            length: 0,
        }
    }
}

/// Storage capability consumed by the coordinator.
///
/// [`DiskCache`] is the shipped implementation; hosts may substitute their
/// own backing store as long as it honors the same absent-versus-error
/// distinction.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Read the full content of `name` into an exact-length pooled buffer.
    ///
    /// A missing entry is `Ok(None)`, not an error. A returned buffer is
    /// always fully populated; partial reads surface as errors instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the entry exists but cannot be read.
    async fn get(&self, name: &HashedName) -> Result<Option<PooledBuffer>>;

    /// Judge whether the entry for `name` can still be served.
    ///
    /// Entries last written at or before `min_fresh` are expired. When the
    /// source-aware policy applies, the entry must additionally have been
    /// written after the source at `source` was last modified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceUnavailable`] when the source-aware policy is
    /// in effect and the source is gone (terminal; the caller must not
    /// retry), and [`Error::Storage`] for metadata failures.
    async fn check_staleness(
        &self,
        name: &HashedName,
        source: Option<&Path>,
        min_fresh: SystemTime,
    ) -> Result<EntryInfo>;

    /// Durably write `content` as the entry for `name`, creating shard
    /// directories as needed, and return the entry's new last-write time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when directory creation, the write, or the
    /// final rename fails.
    async fn set(&self, name: &HashedName, content: &[u8]) -> Result<SystemTime>;
}

/// Cache storage on the local filesystem.
pub struct DiskCache {
    config: CacheConfig,
    pool: BufferPool,
}

impl DiskCache {
    /// Create a store over `config.cache_root`, validating the configuration
    /// eagerly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the configuration is invalid.
    pub fn new(config: CacheConfig, pool: BufferPool) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, pool })
    }

    /// Physical path for `name`: one directory per hex character, then the
    /// full name as the leaf file name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PathEscape`] if the built path does not stay under
    /// the cache root. Validated names cannot trigger this; the check
    /// encodes the containment invariant rather than correcting anything.
    pub fn entry_path(&self, name: &HashedName) -> Result<PathBuf> {
        let mut path = self.config.cache_root.clone();
        let mut shard = [0u8; 4];
        for ch in name.hex().chars() {
            path.push(ch.encode_utf8(&mut shard));
        }
        path.push(name.as_str());

        if !path.starts_with(&self.config.cache_root) {
            return Err(Error::path_escape(path));
        }
        Ok(path)
    }

    async fn stat_entry(&self, path: &Path) -> Result<Option<(SystemTime, u64)>> {
        match fs::metadata(path).await {
            Ok(metadata) => {
                let modified = metadata
                    .modified()
                    .map_err(|err| Error::storage(err, path, "stat"))?;
                Ok(Some((modified, metadata.len())))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::storage(err, path, "stat")),
        }
    }
}

#[async_trait]
impl ArtifactStore for DiskCache {
    async fn get(&self, name: &HashedName) -> Result<Option<PooledBuffer>> {
        let path = self.entry_path(name)?;

        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                trace!(name = %name, "cache entry absent");
                return Ok(None);
            }
            Err(err) => return Err(Error::storage(err, &path, "open")),
        };

        let metadata = file
            .metadata()
            .await
            .map_err(|err| Error::storage(err, &path, "stat"))?;
        let length = usize::try_from(metadata.len()).map_err(|_| {
            Error::invalid_argument(format!(
                "cache entry exceeds addressable memory: {} bytes",
                metadata.len()
            ))
        })?;

        let mut buffer = self.pool.allocate(length);
        file.read_exact(&mut buffer)
            .await
            .map_err(|err| Error::storage(err, &path, "read"))?;

        debug!(name = %name, bytes = length, "cache entry read");
        Ok(Some(buffer))
    }

    async fn check_staleness(
        &self,
        name: &HashedName,
        source: Option<&Path>,
        min_fresh: SystemTime,
    ) -> Result<EntryInfo> {
        let path = self.entry_path(name)?;

        if self.config.check_source_changed && let Some(source_path) = source {
            // The source is consulted first: without it the entry can be
            // neither validated nor regenerated.
            let source_modified = match fs::metadata(source_path).await {
                Ok(metadata) => metadata
                    .modified()
                    .map_err(|err| Error::storage(err, source_path, "stat"))?,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(Error::source_unavailable(source_path));
                }
                Err(err) => return Err(Error::storage(err, source_path, "stat")),
            };

            let Some((entry_modified, length)) = self.stat_entry(&path).await? else {
                return Ok(EntryInfo::missing());
            };
            let expired = entry_modified <= min_fresh || source_modified >= entry_modified;
            trace!(name = %name, expired, "source-aware staleness checked");
            return Ok(EntryInfo {
                expired,
                last_modified: Some(entry_modified),
                length,
            });
        }

        let Some((entry_modified, length)) = self.stat_entry(&path).await? else {
            return Ok(EntryInfo::missing());
        };
        let expired = entry_modified <= min_fresh;
        trace!(name = %name, expired, "staleness checked");
        Ok(EntryInfo {
            expired,
            last_modified: Some(entry_modified),
            length,
        })
    }

    async fn set(&self, name: &HashedName, content: &[u8]) -> Result<SystemTime> {
        let path = self.entry_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| Error::storage(err, parent, "create directory"))?;
        }

        // Same-key writers are excluded by the coordinator's keyed lock, so
        // a name-derived temporary path cannot collide.
        let temp = path.with_file_name(format!("{}.tmp", name.as_str()));
        if let Err(err) = write_temp(&temp, content).await {
            let _ = fs::remove_file(&temp).await;
            return Err(Error::storage(err, &temp, "write"));
        }
        if let Err(err) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(Error::storage(err, &path, "rename"));
        }

        let metadata = fs::metadata(&path)
            .await
            .map_err(|err| Error::storage(err, &path, "stat"))?;
        let modified = metadata
            .modified()
            .map_err(|err| Error::storage(err, &path, "stat"))?;

        debug!(name = %name, bytes = content.len(), "cache entry written");
        Ok(modified)
    }
}

async fn write_temp(temp: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(temp).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    Ok(())
}
