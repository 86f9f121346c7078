//! Unified error handling for the node.

use tally_engine::Error as EngineError;

/// Store error type.
///
/// Every variant carries enough context (collection, archive) for the caller
/// to act on it. Variants hold strings only so errors can be cloned into
/// reports and logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unique constraint violated in '{collection}': {field} = {value}")]
    UniqueConstraintViolation {
        collection: String,
        field: String,
        value: String,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("integrity check failed for archive '{archive}': expected checksum {expected}, got {actual}")]
    IntegrityCheckFailed {
        archive: String,
        expected: String,
        actual: String,
    },

    #[error("archive '{archive}' has schema version {archive_version}, incompatible with live version {live_version}")]
    VersionIncompatible {
        archive: String,
        archive_version: String,
        live_version: String,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("storage I/O error: {0}")]
    StorageIo(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("restore failed ({cause}) and rollback failed ({rollback})")]
    RollbackFailed { cause: String, rollback: String },
}

impl StoreError {
    /// Wrap an IO error with the path or operation it came from.
    pub fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        StoreError::StorageIo(format!("{context}: {err}"))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::StoreUnavailable(_))
    }
}

impl From<EngineError> for StoreError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::CollectionNotFound(name) => {
                StoreError::NotFound(format!("collection '{name}'"))
            }
            EngineError::DocumentNotFound { collection, id } => {
                StoreError::NotFound(format!("document '{id}' in '{collection}'"))
            }
            EngineError::UniqueConstraintViolation {
                collection,
                field,
                value,
            } => StoreError::UniqueConstraintViolation {
                collection,
                field,
                value,
            },
            EngineError::SchemaVersionMismatch { expected, actual } => {
                StoreError::VersionIncompatible {
                    archive: "snapshot".to_string(),
                    archive_version: actual.to_string(),
                    live_version: expected.to_string(),
                }
            }
            EngineError::InvalidSnapshot(msg) => StoreError::Serialization(msg),
            other => StoreError::Validation(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, StoreError>;
