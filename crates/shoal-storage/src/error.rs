//! Error types for the storage engine.

use std::io;

use thiserror::Error;

/// Errors returned by store, log, and catalog operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store is closed or destroyed and cannot serve the request.
    #[error("store {0} is not open")]
    NotOpen(String),

    /// A destroy was attempted while the store is still accepting writes.
    #[error("store {0} must be paused first")]
    NotPaused(String),

    /// A destroy without `force` was attempted on a non-empty store.
    #[error("store {0} is not empty")]
    NotEmpty(String),

    /// The shared memory budget is exhausted.
    #[error("write rejected: shared cache budget exceeded")]
    OutOfMemory,

    /// A log or snapshot file failed structural validation.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Catalog metadata failed to encode or decode.
    #[error("catalog meta error: {0}")]
    Meta(#[from] serde_json::Error),

    /// Underlying filesystem error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
