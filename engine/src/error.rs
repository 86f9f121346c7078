//! Error types for the Tally engine.

use crate::{CollectionName, SchemaVersion};
use thiserror::Error;

/// All possible errors from the Tally engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Lookup errors
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("document '{id}' not found in '{collection}'")]
    DocumentNotFound { collection: CollectionName, id: String },

    // Validation errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("invalid name '{0}': use letters, digits, '-' or '_' and do not start with '_'")]
    InvalidName(String),

    // Constraint errors
    #[error("unique constraint violated in '{collection}': {field} = {value}")]
    UniqueConstraintViolation {
        collection: CollectionName,
        field: String,
        value: String,
    },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },
}

impl Error {
    /// Whether the error was caused by malformed caller input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidPayload(_)
                | Error::MissingRequiredField(_)
                | Error::TypeMismatch { .. }
                | Error::InvalidQuery(_)
                | Error::InvalidPatch(_)
                | Error::InvalidName(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
