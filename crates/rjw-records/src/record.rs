//! The document record and its lifecycle states.

use std::fmt;

use chrono::{DateTime, Utc};
use rjw_types::{ContentHash, DocumentRef, DocumentType, GuestId, RecordId, StorageKey};
use serde::{Deserialize, Serialize};

/// Where a document generation stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordStatus {
    /// Version allocated; nothing uploaded yet.
    Pending,
    /// Bytes uploaded under `storage_key`; not yet visible.
    Stored,
    /// Asset verified; visible to readers.
    Committed,
    /// Generation abandoned; `failure_reason` says why.
    Failed,
}

impl RecordStatus {
    /// `Committed` and `Failed` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Stored)
                | (Self::Stored, Self::Committed)
                | (Self::Pending, Self::Failed)
                | (Self::Stored, Self::Failed)
        )
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Stored => write!(f, "stored"),
            Self::Committed => write!(f, "committed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Metadata row tracking one generated document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: RecordId,
    pub guest_id: GuestId,
    pub document_type: DocumentType,
    /// Per (guest, type) version, starting at 1. Never reused.
    pub version: u64,
    pub status: RecordStatus,
    /// Set by `mark_stored`.
    pub storage_key: Option<StorageKey>,
    /// Set by `mark_stored`.
    pub content_hash: Option<ContentHash>,
    /// The guest's `last_modified` the document was rendered from.
    pub source_modified_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl DocumentRecord {
    /// A fresh `Pending` record.
    pub fn pending(
        guest_id: GuestId,
        document_type: DocumentType,
        version: u64,
        source_modified_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            guest_id,
            document_type,
            version,
            status: RecordStatus::Pending,
            storage_key: None,
            content_hash: None,
            source_modified_at,
            created_at: now,
            updated_at: now,
            committed_at: None,
            failure_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The caller-facing reference. `None` unless the record is committed.
    pub fn to_ref(&self) -> Option<DocumentRef> {
        if self.status != RecordStatus::Committed {
            return None;
        }
        Some(DocumentRef {
            guest_id: self.guest_id.clone(),
            document_type: self.document_type,
            version: self.version,
            storage_key: self.storage_key.clone()?,
            content_hash: self.content_hash?,
            committed_at: self.committed_at?,
        })
    }
}
