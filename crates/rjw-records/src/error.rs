//! Error types for record catalog operations.

use std::path::PathBuf;

use rjw_assets::AssetError;
use rjw_types::{ContentHash, DocumentType, GuestId, RecordId, StorageKey};
use thiserror::Error;

use crate::record::RecordStatus;

/// Errors that can occur during record operations.
#[derive(Debug, Error)]
pub enum RecordError {
    /// No record with this id exists.
    #[error("record not found: {0}")]
    NotFound(RecordId),

    /// The requested transition is not allowed from the record's state.
    #[error("record {record_id} cannot move from {from} to {to}")]
    InvalidState {
        record_id: RecordId,
        from: RecordStatus,
        to: RecordStatus,
    },

    /// Another generation for the same guest and document type has not
    /// reached a terminal state yet.
    #[error("generation of {document_type} for {guest_id} already in flight as {record_id}")]
    InFlight {
        guest_id: GuestId,
        document_type: DocumentType,
        record_id: RecordId,
    },

    /// The unique (guest, type, version) index already holds this version.
    #[error("version {version} of {document_type} for {guest_id} already allocated")]
    VersionConflict {
        guest_id: GuestId,
        document_type: DocumentType,
        version: u64,
    },

    /// Commit found no asset under the record's storage key.
    #[error("record {record_id}: asset {key} is not present")]
    AssetMissing { record_id: RecordId, key: StorageKey },

    /// Commit found an asset whose hash differs from the record's.
    #[error("record {record_id}: asset {key} has hash {found}, expected {expected}")]
    HashMismatch {
        record_id: RecordId,
        key: StorageKey,
        expected: ContentHash,
        found: ContentHash,
    },

    /// Asset verification failed at the store level.
    #[error("asset store error: {0}")]
    Asset(#[from] AssetError),

    /// The catalog backend is temporarily unreachable.
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The journal holds damaged bytes followed by intact frames. Nothing
    /// was truncated; the file must be repaired or moved aside.
    #[error("journal {} is damaged at byte {offset}: {reason}", path.display())]
    Corrupt {
        path: PathBuf,
        offset: usize,
        reason: String,
    },

    /// I/O error from a file-backed catalog.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecordError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Io(_) => true,
            Self::Asset(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Convenience type alias for record operations.
pub type RecordResult<T> = std::result::Result<T, RecordError>;
