//! Error types for the persistence layer.
//!
//! Every fallible operation in the crate returns [`PersistError`]. The
//! variants mirror the failure modes of the engine:
//!
//! - lookup misses (`NotFound`, `NoneFound`, `Superseded`)
//! - persistence policy rejections (`Disabled`, `BelowPersistenceThreshold`, `UndatedEntry`)
//! - record state (`AlreadyExpired`, `MalformedRecord`)
//! - infrastructure (`DirectoryUnavailable`, `Io`, `Json`, codec failures)

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, PersistError>;

/// Errors produced by the persistence engine.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Persistence is switched off. This is a steady-state signal, not a
    /// failure, and is never logged by the execution policy.
    #[error("persistence is disabled")]
    Disabled,

    #[error("codec not found: {0}")]
    CodecNotFound(String),

    #[error("codec '{codec}' failed: {reason}")]
    Codec { codec: String, reason: String },

    #[error("entry ttl of {duration_ms}ms is below the persistence threshold of {minimum_ms}ms")]
    BelowPersistenceThreshold { duration_ms: u64, minimum_ms: u64 },

    #[error("entries without an explicit ttl are not persisted")]
    UndatedEntry,

    #[error("record {file} expired at {expire_at}")]
    AlreadyExpired { file: String, expire_at: i64 },

    #[error("no persistence handle for key {0}")]
    NotFound(String),

    #[error("no persistence handle matches key {0}")]
    NoneFound(String),

    /// The handle was replaced by a newer one for the same key before the
    /// operation got its lock. Callers holding a key re-resolve and retry.
    #[error("persistence handle for key {0} was superseded")]
    Superseded(String),

    #[error("malformed record in {path}: {reason}")]
    MalformedRecord { path: PathBuf, reason: String },

    #[error("persistence directory {root} is unavailable (first missing segment: {missing}): {source}")]
    DirectoryUnavailable {
        root: PathBuf,
        missing: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PersistError {
    /// Returns true for the "persistence disabled" control-flow signal.
    pub fn is_disabled(&self) -> bool {
        matches!(self, PersistError::Disabled)
    }

    /// Returns true for errors that are expected in normal operation:
    /// lookup misses and entries the policy chose not to persist.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            PersistError::Disabled
                | PersistError::NotFound(_)
                | PersistError::NoneFound(_)
                | PersistError::Superseded(_)
                | PersistError::BelowPersistenceThreshold { .. }
                | PersistError::UndatedEntry
        )
    }

    pub(crate) fn codec(codec: &str, reason: impl ToString) -> Self {
        PersistError::Codec {
            codec: codec.to_string(),
            reason: reason.to_string(),
        }
    }
}
