//! Server-wide error kinds.
//!
//! Per-request failures are serialized into a `-ERR <text>` wire reply
//! and the connection stays open; only session-map and catalog
//! invariant violations escalate to panics (those are bugs, not
//! errors). The kinds mirror the dispatch path's needs: `Busy` for
//! requests during shutdown, `NotFound` for missing sessions/keys,
//! `Auth` for the password gate, `Parse` for malformed commands.

use thiserror::Error;

use shoal_storage::StorageError;

/// An error surfaced to a client or a subsystem caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Busy(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    Parse(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Timeout(String),
}

impl Error {
    /// Short kind tag, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::Busy(_) => "BUSY",
            Error::Internal(_) => "INTERNAL",
            Error::Parse(_) => "PARSE",
            Error::Auth(_) => "AUTH",
            Error::Timeout(_) => "TIMEOUT",
        }
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotOpen(_) => Error::Internal("store not open".into()),
            StorageError::OutOfMemory => {
                Error::Internal("write rejected: out of memory".into())
            }
            other => Error::Internal(other.to_string()),
        }
    }
}
