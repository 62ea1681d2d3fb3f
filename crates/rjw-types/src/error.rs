use thiserror::Error;

/// Errors produced by type construction and parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid guest id {id:?}: {reason}")]
    InvalidGuestId { id: String, reason: &'static str },

    #[error("unknown document type: {0}")]
    UnknownDocumentType(String),

    #[error("invalid storage key {key:?}: {reason}")]
    InvalidStorageKey { key: String, reason: &'static str },

    #[error("invalid record id: {0}")]
    InvalidRecordId(String),
}
