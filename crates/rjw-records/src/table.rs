//! In-process record table shared by the catalog backends.
//!
//! Every mutation is split into a `plan_*` step that validates and returns
//! the next version of a record without touching the table, and
//! [`RecordTable::apply`] which installs it. Backends that persist (the
//! journal) write the planned record durably between the two steps, so the
//! table never runs ahead of the durable state.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rjw_types::{ContentHash, DocumentType, GuestId, RecordId, StorageKey};

use crate::error::{RecordError, RecordResult};
use crate::record::{DocumentRecord, RecordStatus};

type VersionKey = (GuestId, DocumentType, u64);

#[derive(Debug, Default)]
pub struct RecordTable {
    records: HashMap<RecordId, DocumentRecord>,
    /// Unique (guest, type, version) index.
    versions: BTreeMap<VersionKey, RecordId>,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Install a record, replacing any earlier state of the same id.
    pub fn apply(&mut self, record: DocumentRecord) {
        self.versions.insert(
            (record.guest_id.clone(), record.document_type, record.version),
            record.id,
        );
        self.records.insert(record.id, record);
    }

    pub fn get(&self, id: RecordId) -> Option<&DocumentRecord> {
        self.records.get(&id)
    }

    fn require(&self, id: RecordId) -> RecordResult<&DocumentRecord> {
        self.records.get(&id).ok_or(RecordError::NotFound(id))
    }

    /// Records of one (guest, type) pair in version order.
    fn series<'a>(
        &'a self,
        guest_id: &GuestId,
        document_type: DocumentType,
    ) -> impl DoubleEndedIterator<Item = &'a DocumentRecord> + 'a {
        let start = (guest_id.clone(), document_type, 0);
        let end = (guest_id.clone(), document_type, u64::MAX);
        self.versions
            .range(start..=end)
            .filter_map(move |(_, id)| self.records.get(id))
    }

    /// Allocate the next version as a new `Pending` record.
    ///
    /// Fails with `InFlight` while any record of the pair is non-terminal.
    pub fn plan_pending(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
        source_modified_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RecordResult<DocumentRecord> {
        if let Some(open) = self
            .series(guest_id, document_type)
            .find(|r| !r.is_terminal())
        {
            return Err(RecordError::InFlight {
                guest_id: guest_id.clone(),
                document_type,
                record_id: open.id,
            });
        }

        let version = self
            .series(guest_id, document_type)
            .next_back()
            .map_or(1, |r| r.version + 1);
        if self
            .versions
            .contains_key(&(guest_id.clone(), document_type, version))
        {
            return Err(RecordError::VersionConflict {
                guest_id: guest_id.clone(),
                document_type,
                version,
            });
        }

        Ok(DocumentRecord::pending(
            guest_id.clone(),
            document_type,
            version,
            source_modified_at,
            now,
        ))
    }

    pub fn plan_stored(
        &self,
        id: RecordId,
        storage_key: &StorageKey,
        content_hash: &ContentHash,
        now: DateTime<Utc>,
    ) -> RecordResult<DocumentRecord> {
        let mut record = self.transition(id, RecordStatus::Stored)?;
        record.storage_key = Some(storage_key.clone());
        record.content_hash = Some(*content_hash);
        record.updated_at = now;
        Ok(record)
    }

    /// The record if it may be committed (`Stored` with key and hash).
    pub fn committable(&self, id: RecordId) -> RecordResult<DocumentRecord> {
        self.transition(id, RecordStatus::Committed)
    }

    pub fn plan_committed(&self, id: RecordId, now: DateTime<Utc>) -> RecordResult<DocumentRecord> {
        let mut record = self.transition(id, RecordStatus::Committed)?;
        record.committed_at = Some(now);
        record.updated_at = now;
        Ok(record)
    }

    /// Plan a move to `Failed`. Returns `None` if already failed.
    pub fn plan_failed(
        &self,
        id: RecordId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> RecordResult<Option<DocumentRecord>> {
        let current = self.require(id)?;
        if current.status == RecordStatus::Failed {
            return Ok(None);
        }
        let mut record = self.transition(id, RecordStatus::Failed)?;
        record.failure_reason = Some(reason.to_string());
        record.updated_at = now;
        Ok(Some(record))
    }

    fn transition(&self, id: RecordId, to: RecordStatus) -> RecordResult<DocumentRecord> {
        let current = self.require(id)?;
        if !current.status.can_transition_to(to) {
            return Err(RecordError::InvalidState {
                record_id: id,
                from: current.status,
                to,
            });
        }
        let mut next = current.clone();
        next.status = to;
        Ok(next)
    }

    pub fn latest_committed(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
    ) -> Option<DocumentRecord> {
        self.series(guest_id, document_type)
            .rev()
            .find(|r| r.status == RecordStatus::Committed)
            .cloned()
    }

    pub fn committed_version(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
        version: u64,
    ) -> Option<DocumentRecord> {
        self.versions
            .get(&(guest_id.clone(), document_type, version))
            .and_then(|id| self.records.get(id))
            .filter(|r| r.status == RecordStatus::Committed)
            .cloned()
    }

    pub fn committed_versions(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
    ) -> Vec<DocumentRecord> {
        self.series(guest_id, document_type)
            .filter(|r| r.status == RecordStatus::Committed)
            .cloned()
            .collect()
    }

    /// Records in `status` last touched before `updated_before`, oldest first.
    pub fn list_by_status(
        &self,
        status: RecordStatus,
        updated_before: DateTime<Utc>,
    ) -> Vec<DocumentRecord> {
        let mut found: Vec<DocumentRecord> = self
            .records
            .values()
            .filter(|r| r.status == status && r.updated_at < updated_before)
            .cloned()
            .collect();
        found.sort_by_key(|r| (r.updated_at, r.id));
        found
    }

    /// Every record, for compaction.
    pub fn snapshot(&self) -> Vec<DocumentRecord> {
        let mut all: Vec<DocumentRecord> = self.records.values().cloned().collect();
        all.sort_by_key(|r| r.id);
        all
    }
}
