use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rjw_assets::AssetStore;
use rjw_types::{ContentHash, DocumentType, GuestId, RecordId, StorageKey};

use crate::error::{RecordError, RecordResult};
use crate::record::{DocumentRecord, RecordStatus};
use crate::table::RecordTable;
use crate::traits::{verify_asset, DocumentRecordStore};

/// In-memory record catalog.
///
/// Intended for tests and single-process embedding. Nothing survives a
/// restart. Commits are verified against the asset store it was built with.
pub struct InMemoryRecordStore {
    table: RwLock<RecordTable>,
    assets: Arc<dyn AssetStore>,
}

impl InMemoryRecordStore {
    pub fn new(assets: Arc<dyn AssetStore>) -> Self {
        Self {
            table: RwLock::new(RecordTable::new()),
            assets,
        }
    }

    /// Number of records in any state.
    pub fn len(&self) -> usize {
        self.table.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().expect("lock poisoned").is_empty()
    }
}

#[async_trait]
impl DocumentRecordStore for InMemoryRecordStore {
    async fn create_pending(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
        source_modified_at: DateTime<Utc>,
    ) -> RecordResult<DocumentRecord> {
        let mut table = self.table.write().expect("lock poisoned");
        let record = table.plan_pending(guest_id, document_type, source_modified_at, Utc::now())?;
        table.apply(record.clone());
        tracing::debug!(record = %record.id, %guest_id, %document_type, version = record.version, "allocated version");
        Ok(record)
    }

    async fn mark_stored(
        &self,
        id: RecordId,
        storage_key: &StorageKey,
        content_hash: &ContentHash,
    ) -> RecordResult<DocumentRecord> {
        let mut table = self.table.write().expect("lock poisoned");
        let record = table.plan_stored(id, storage_key, content_hash, Utc::now())?;
        table.apply(record.clone());
        Ok(record)
    }

    async fn commit(&self, id: RecordId) -> RecordResult<DocumentRecord> {
        let candidate = self.table.read().expect("lock poisoned").committable(id)?;
        verify_asset(self.assets.as_ref(), &candidate).await?;

        // State may have moved while the lock was released; plan again.
        let mut table = self.table.write().expect("lock poisoned");
        let record = table.plan_committed(id, Utc::now())?;
        table.apply(record.clone());
        tracing::debug!(record = %id, version = record.version, "committed");
        Ok(record)
    }

    async fn mark_failed(&self, id: RecordId, reason: &str) -> RecordResult<DocumentRecord> {
        let mut table = self.table.write().expect("lock poisoned");
        match table.plan_failed(id, reason, Utc::now())? {
            Some(record) => {
                table.apply(record.clone());
                Ok(record)
            }
            None => table.get(id).cloned().ok_or(RecordError::NotFound(id)),
        }
    }

    async fn latest_committed(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
    ) -> RecordResult<Option<DocumentRecord>> {
        let table = self.table.read().expect("lock poisoned");
        Ok(table.latest_committed(guest_id, document_type))
    }

    async fn committed_version(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
        version: u64,
    ) -> RecordResult<Option<DocumentRecord>> {
        let table = self.table.read().expect("lock poisoned");
        Ok(table.committed_version(guest_id, document_type, version))
    }

    async fn committed_versions(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
    ) -> RecordResult<Vec<DocumentRecord>> {
        let table = self.table.read().expect("lock poisoned");
        Ok(table.committed_versions(guest_id, document_type))
    }

    async fn get(&self, id: RecordId) -> RecordResult<Option<DocumentRecord>> {
        Ok(self.table.read().expect("lock poisoned").get(id).cloned())
    }

    async fn list_by_status(
        &self,
        status: RecordStatus,
        updated_before: DateTime<Utc>,
    ) -> RecordResult<Vec<DocumentRecord>> {
        let table = self.table.read().expect("lock poisoned");
        Ok(table.list_by_status(status, updated_before))
    }
}

impl std::fmt::Debug for InMemoryRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRecordStore")
            .field("record_count", &self.len())
            .finish()
    }
}
