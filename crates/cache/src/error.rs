//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {message}")]
    #[diagnostic(
        code(pixelgrove::cache::invalid_argument),
        help("Hash lengths must be even and within 2..=64; extensions must be alphanumeric")
    )]
    InvalidArgument {
        /// Error message describing the rejected argument
        message: String,
    },

    /// I/O error during cache operations
    #[error("I/O {operation} failed: {}", path.display())]
    #[diagnostic(
        code(pixelgrove::cache::storage),
        help("Check file permissions and ensure the cache root is writable")
    )]
    Storage {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error
        path: Box<Path>,
        /// Operation that failed (e.g., "read", "write", "create directory")
        operation: String,
    },

    /// A constructed path resolved outside the cache root
    #[error("Path escapes the cache root: {}", path.display())]
    #[diagnostic(
        code(pixelgrove::cache::path_escape),
        help("Cache names may contain only hex characters and an alphanumeric extension")
    )]
    PathEscape {
        /// The rejected path
        path: Box<Path>,
    },

    /// The source artifact required by the source-aware staleness policy is missing
    #[error("Source artifact does not exist: {}", path.display())]
    #[diagnostic(
        code(pixelgrove::cache::source_unavailable),
        help("The cached entry cannot be validated or regenerated; do not retry")
    )]
    SourceUnavailable {
        /// The missing source path
        path: Box<Path>,
    },

    /// The external production pipeline failed
    #[error("Artifact production failed for key: {key}")]
    #[diagnostic(code(pixelgrove::cache::production))]
    Production {
        /// The cache key whose production failed
        key: String,
        /// The pipeline's failure, passed through uninterpreted
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Waiting for the per-key lock was cancelled or timed out
    #[error("Lock acquisition cancelled for key: {key}")]
    #[diagnostic(
        code(pixelgrove::cache::lock_cancelled),
        help("Another producer held the key past the configured wait limit")
    )]
    LockCancelled {
        /// The key whose acquisition was abandoned
        key: String,
    },
}

impl Error {
    /// Create an invalid argument error
    #[must_use]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: msg.into(),
        }
    }

    /// Create a storage error with path context
    #[must_use]
    pub fn storage(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Storage {
            source,
            path: path.as_ref().into(),
            operation: operation.into(),
        }
    }

    /// Create a path escape rejection
    #[must_use]
    pub fn path_escape(path: impl AsRef<Path>) -> Self {
        Self::PathEscape {
            path: path.as_ref().into(),
        }
    }

    /// Create a missing source error
    #[must_use]
    pub fn source_unavailable(path: impl AsRef<Path>) -> Self {
        Self::SourceUnavailable {
            path: path.as_ref().into(),
        }
    }

    /// Wrap an external production failure
    #[must_use]
    pub fn production(
        key: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Production {
            key: key.into(),
            source: source.into(),
        }
    }

    /// Create a lock cancellation error
    #[must_use]
    pub fn lock_cancelled(key: impl Into<String>) -> Self {
        Self::LockCancelled { key: key.into() }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
