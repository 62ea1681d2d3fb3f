use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rjw_assets::AssetStore;
use rjw_types::{ContentHash, DocumentType, GuestId, RecordId, StorageKey};

use crate::error::{RecordError, RecordResult};
use crate::record::{DocumentRecord, RecordStatus};

/// Transactional catalog of document records.
///
/// All implementations must satisfy these invariants:
/// - At most one non-terminal record exists per (guest, document type).
/// - Versions per (guest, document type) are allocated strictly increasing
///   from 1 and never reused, even after a failure.
/// - `commit` succeeds only if the asset store holds the record's key with
///   the record's hash at the moment of the call.
/// - Read operations only ever surface `Committed` records, except `get`
///   and `list_by_status` which serve the pipeline and reconciler.
#[async_trait]
pub trait DocumentRecordStore: Send + Sync {
    /// Allocate the next version for the pair as a `Pending` record.
    ///
    /// Fails with [`RecordError::InFlight`] if a non-terminal record already
    /// exists for the pair, carrying its id so the caller can wait on it.
    async fn create_pending(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
        source_modified_at: DateTime<Utc>,
    ) -> RecordResult<DocumentRecord>;

    /// `Pending` to `Stored`, recording where the bytes went.
    async fn mark_stored(
        &self,
        id: RecordId,
        storage_key: &StorageKey,
        content_hash: &ContentHash,
    ) -> RecordResult<DocumentRecord>;

    /// `Stored` to `Committed` after re-verifying the asset.
    ///
    /// On [`RecordError::AssetMissing`] or [`RecordError::HashMismatch`] the
    /// record is left unchanged.
    async fn commit(&self, id: RecordId) -> RecordResult<DocumentRecord>;

    /// Move a non-terminal record to `Failed`.
    ///
    /// Idempotent for a record that already failed; the first reason wins.
    async fn mark_failed(&self, id: RecordId, reason: &str) -> RecordResult<DocumentRecord>;

    /// Highest committed version for the pair.
    async fn latest_committed(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
    ) -> RecordResult<Option<DocumentRecord>>;

    /// A specific version, if it is committed.
    async fn committed_version(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
        version: u64,
    ) -> RecordResult<Option<DocumentRecord>>;

    /// Every committed version of the pair, oldest first.
    async fn committed_versions(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
    ) -> RecordResult<Vec<DocumentRecord>>;

    /// A record in any state.
    async fn get(&self, id: RecordId) -> RecordResult<Option<DocumentRecord>>;

    /// Records in `status` whose last update is older than `updated_before`.
    async fn list_by_status(
        &self,
        status: RecordStatus,
        updated_before: DateTime<Utc>,
    ) -> RecordResult<Vec<DocumentRecord>>;
}

/// Check that the asset store holds what a `Stored` record claims.
pub(crate) async fn verify_asset(
    assets: &dyn AssetStore,
    record: &DocumentRecord,
) -> RecordResult<()> {
    let (Some(key), Some(expected)) = (&record.storage_key, record.content_hash) else {
        return Err(RecordError::InvalidState {
            record_id: record.id,
            from: record.status,
            to: RecordStatus::Committed,
        });
    };

    match assets.head(key).await? {
        None => Err(RecordError::AssetMissing {
            record_id: record.id,
            key: key.clone(),
        }),
        Some(meta) if meta.content_hash != expected => Err(RecordError::HashMismatch {
            record_id: record.id,
            key: key.clone(),
            expected,
            found: meta.content_hash,
        }),
        Some(_) => Ok(()),
    }
}
