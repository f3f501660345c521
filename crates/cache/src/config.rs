//! Cache configuration
//!
//! Hosts construct a [`CacheConfig`] once at startup and hand it to
//! [`DiskCache::new`](crate::store::DiskCache::new), which validates it
//! eagerly. Nothing in this crate reads configuration files or environment
//! variables; the struct derives serde so hosts can embed it in their own
//! configuration formats.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Smallest permitted hashed-name length, in hex characters.
pub const MIN_NAME_LENGTH: u8 = 2;

/// Largest permitted hashed-name length: the full SHA-256 digest in hex.
pub const MAX_NAME_LENGTH: u8 = 64;

/// Default hashed-name length, in hex characters.
///
/// Twelve characters encode 48 digest bits. Shorter names give shallower
/// directory trees at a higher collision probability; the right value is a
/// deployment decision, not a fixed constant.
pub const DEFAULT_NAME_LENGTH: u8 = 12;

/// Extension used when a cache key carries no recognizable one.
pub const DEFAULT_EXTENSION: &str = "jpg";

/// Validated settings for a [`DiskCache`](crate::store::DiskCache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory under which every cached artifact lives.
    pub cache_root: PathBuf,

    /// Hashed-name length in hex characters; also the shard-tree depth.
    ///
    /// Must be even (digest bytes render as hex pairs) and within
    /// [`MIN_NAME_LENGTH`]..=[`MAX_NAME_LENGTH`].
    #[serde(default = "default_name_length")]
    pub name_length: u8,

    /// Whether staleness checks also compare against the source artifact's
    /// last-write time.
    #[serde(default)]
    pub check_source_changed: bool,

    /// Extension assumed when a key does not name a recognized format.
    #[serde(default = "default_extension")]
    pub default_extension: String,
}

fn default_name_length() -> u8 {
    DEFAULT_NAME_LENGTH
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

impl CacheConfig {
    /// Create a configuration with defaults for everything but the root.
    #[must_use]
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            name_length: DEFAULT_NAME_LENGTH,
            check_source_changed: false,
            default_extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    /// Check every field eagerly, before the first path is built.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the root is empty, the name
    /// length is out of bounds or odd, or the default extension is not a
    /// non-empty alphanumeric token.
    pub fn validate(&self) -> Result<()> {
        if self.cache_root.as_os_str().is_empty() {
            return Err(Error::invalid_argument("cache_root must not be empty"));
        }
        if self.name_length < MIN_NAME_LENGTH || self.name_length > MAX_NAME_LENGTH {
            return Err(Error::invalid_argument(format!(
                "name_length must be within {MIN_NAME_LENGTH}..={MAX_NAME_LENGTH}, got {}",
                self.name_length
            )));
        }
        if self.name_length % 2 != 0 {
            return Err(Error::invalid_argument(format!(
                "name_length must be even, got {}",
                self.name_length
            )));
        }
        if self.default_extension.is_empty()
            || !self
                .default_extension
                .bytes()
                .all(|b| b.is_ascii_alphanumeric())
        {
            return Err(Error::invalid_argument(format!(
                "default_extension must be a non-empty alphanumeric token, got {:?}",
                self.default_extension
            )));
        }
        Ok(())
    }
}
