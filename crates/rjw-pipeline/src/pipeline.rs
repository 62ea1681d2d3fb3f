use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rjw_assets::{AssetError, AssetStore, StoredRef};
use rjw_crypto::ContentHasher;
use rjw_records::{DocumentRecord, DocumentRecordStore, RecordError, RecordStatus};
use rjw_types::{ContentHash, DocumentRef, DocumentType, GuestData, GuestId, RecordId, StorageKey};
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult, Stage, StageFailure};
use crate::guests::GuestDirectory;
use crate::reconcile::Reconciler;
use crate::render::{RenderError, Renderer};

/// Store errors that may clear up on their own.
trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for AssetError {
    fn is_transient(&self) -> bool {
        AssetError::is_transient(self)
    }
}

impl Transient for RecordError {
    fn is_transient(&self) -> bool {
        RecordError::is_transient(self)
    }
}

/// Render, upload, and commit per-guest documents.
///
/// The pipeline holds no lock across a generation. The only serialized step
/// is version allocation, which the record store enforces. Everything after
/// allocation runs in a detached task, so dropping the future returned by
/// [`generate`](Self::generate) never leaves a record half done; the task
/// still drives it to `Committed` or `Failed`.
#[derive(Clone)]
pub struct DocumentPipeline {
    assets: Arc<dyn AssetStore>,
    records: Arc<dyn DocumentRecordStore>,
    guests: Arc<dyn GuestDirectory>,
    config: PipelineConfig,
}

impl DocumentPipeline {
    pub fn new(
        assets: Arc<dyn AssetStore>,
        records: Arc<dyn DocumentRecordStore>,
        guests: Arc<dyn GuestDirectory>,
    ) -> Self {
        Self {
            assets,
            records,
            guests,
            config: PipelineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn assets(&self) -> &Arc<dyn AssetStore> {
        &self.assets
    }

    pub fn records(&self) -> &Arc<dyn DocumentRecordStore> {
        &self.records
    }

    /// A reconciler over the same stores and config.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.assets),
            Arc::clone(&self.records),
            self.config.clone(),
        )
    }

    /// Produce (or reuse) the current document for a guest.
    ///
    /// If the latest committed version was rendered from the guest's current
    /// `last_modified`, its reference is returned without rendering.
    /// Otherwise a new version is allocated, rendered, uploaded and
    /// committed. A request that finds another generation in flight waits for
    /// it and then re-checks.
    pub async fn generate(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
        renderer: Arc<dyn Renderer>,
    ) -> PipelineResult<DocumentRef> {
        let started = Instant::now();
        loop {
            let guest = self
                .guests
                .get_guest(guest_id)
                .await?
                .ok_or_else(|| PipelineError::GuestNotFound(guest_id.clone()))?;

            if let Some(current) = self.current(&guest, document_type).await? {
                debug!(%guest_id, %document_type, version = current.version, "reusing committed document");
                return Ok(current);
            }

            let pending = match self.allocate(&guest, document_type).await {
                Ok(record) => record,
                Err(StageFailure::Record(RecordError::InFlight { record_id, .. })) => {
                    self.wait_for(guest_id, document_type, record_id, started).await?;
                    continue;
                }
                Err(failure) => {
                    return Err(PipelineError::stage(
                        Stage::Allocate,
                        guest_id,
                        document_type,
                        None,
                        failure,
                    ))
                }
            };

            info!(
                %guest_id,
                %document_type,
                version = pending.version,
                record = %pending.id,
                "generating document"
            );
            let generation = Generation {
                pipeline: self.clone(),
                guest,
                renderer,
                record: pending,
            };
            return tokio::spawn(generation.execute())
                .await
                .map_err(|e| PipelineError::Aborted {
                    guest_id: guest_id.clone(),
                    document_type,
                    reason: e.to_string(),
                })?;
        }
    }

    /// Highest committed version, if any.
    pub async fn latest(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
    ) -> PipelineResult<Option<DocumentRef>> {
        let record = self.records.latest_committed(guest_id, document_type).await?;
        Ok(record.as_ref().and_then(DocumentRecord::to_ref))
    }

    /// A specific committed version.
    pub async fn version(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
        version: u64,
    ) -> PipelineResult<Option<DocumentRef>> {
        let record = self
            .records
            .committed_version(guest_id, document_type, version)
            .await?;
        Ok(record.as_ref().and_then(DocumentRecord::to_ref))
    }

    /// All committed versions, oldest first.
    pub async fn versions(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
    ) -> PipelineResult<Vec<DocumentRef>> {
        let records = self.records.committed_versions(guest_id, document_type).await?;
        Ok(records.iter().filter_map(DocumentRecord::to_ref).collect())
    }

    /// The bytes of a committed document, checked against its hash.
    pub async fn fetch(&self, doc: &DocumentRef) -> PipelineResult<Bytes> {
        let bytes = self.assets.get(&doc.storage_key).await?;
        if !ContentHasher::DOCUMENT.verify(&bytes, &doc.content_hash) {
            return Err(AssetError::Corrupt {
                key: doc.storage_key.clone(),
                reason: format!("bytes do not match committed hash {}", doc.content_hash),
            }
            .into());
        }
        Ok(bytes)
    }

    /// Resolve a storage key to its committed document and bytes.
    ///
    /// Keys of records that are not committed resolve to `None`, so
    /// uncommitted uploads are never served.
    pub async fn fetch_by_key(&self, key: &StorageKey) -> PipelineResult<Option<(DocumentRef, Bytes)>> {
        let Some((guest_id, document_type, version)) = parse_key(key) else {
            return Ok(None);
        };
        let Some(doc) = self.version(&guest_id, document_type, version).await? else {
            return Ok(None);
        };
        if doc.storage_key != *key {
            return Ok(None);
        }
        let bytes = self.fetch(&doc).await?;
        Ok(Some((doc, bytes)))
    }

    /// The store's own address for a committed document.
    pub fn locate(&self, doc: &DocumentRef) -> String {
        self.assets.locate(&doc.storage_key)
    }

    async fn current(
        &self,
        guest: &GuestData,
        document_type: DocumentType,
    ) -> PipelineResult<Option<DocumentRef>> {
        let latest = self.records.latest_committed(&guest.id, document_type).await?;
        Ok(latest
            .filter(|r| r.source_modified_at == guest.last_modified)
            .and_then(|r| r.to_ref()))
    }

    async fn allocate(
        &self,
        guest: &GuestData,
        document_type: DocumentType,
    ) -> Result<DocumentRecord, StageFailure> {
        // Not retried: after a timeout the allocation may have landed, and a
        // second attempt would only find our own record in flight.
        let call = self
            .records
            .create_pending(&guest.id, document_type, guest.last_modified);
        match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StageFailure::Timeout(self.config.store_timeout)),
        }
    }

    /// Poll an in-flight record until it is terminal or the wait runs out.
    async fn wait_for(
        &self,
        guest_id: &GuestId,
        document_type: DocumentType,
        record_id: RecordId,
        started: Instant,
    ) -> PipelineResult<()> {
        debug!(%guest_id, %document_type, record = %record_id, "waiting on in-flight generation");
        loop {
            match self.records.get(record_id).await? {
                Some(record) if !record.is_terminal() => {}
                _ => return Ok(()),
            }
            if started.elapsed() >= self.config.inflight_wait {
                return Err(PipelineError::InFlight {
                    guest_id: guest_id.clone(),
                    document_type,
                    record_id,
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.config.inflight_poll).await;
        }
    }

    /// Run a store call under the store timeout, retrying transient faults
    /// and timeouts with backoff. `op` receives the 1-based attempt number.
    async fn with_retry<T, E, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, StageFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Into<StageFailure>,
    {
        let policy = &self.config.retry;
        let mut attempt = 1;
        loop {
            let failure = match tokio::time::timeout(self.config.store_timeout, op(attempt)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_transient() => return Err(e.into()),
                Ok(Err(e)) => e.into(),
                Err(_) => StageFailure::Timeout(self.config.store_timeout),
            };
            if attempt >= policy.max_attempts.max(1) {
                return Err(failure);
            }
            let delay = policy.backoff(attempt);
            warn!(operation, attempt, ?delay, error = %failure, "store call failed; retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

impl std::fmt::Debug for DocumentPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Split `{guest}/{type}/{version}-{hash prefix}` back into its parts.
fn parse_key(key: &StorageKey) -> Option<(GuestId, DocumentType, u64)> {
    let mut segments = key.segments();
    let guest_id = GuestId::new(segments.next()?).ok()?;
    let document_type = segments.next()?.parse().ok()?;
    let (version, _) = segments.next()?.split_once('-')?;
    if segments.next().is_some() {
        return None;
    }
    Some((guest_id, document_type, version.parse().ok()?))
}

/// One allocated version on its way to a terminal state.
struct Generation {
    pipeline: DocumentPipeline,
    guest: GuestData,
    renderer: Arc<dyn Renderer>,
    record: DocumentRecord,
}

impl Generation {
    async fn execute(self) -> PipelineResult<DocumentRef> {
        let (stage, failure) = match self.stages().await {
            Ok(doc) => return Ok(doc),
            Err(failed) => failed,
        };

        let record_id = self.record.id;
        let reason = format!("{stage}: {failure}");
        let records = &self.pipeline.records;
        let timeout = self.pipeline.config.store_timeout;
        match tokio::time::timeout(timeout, records.mark_failed(record_id, &reason)).await {
            Ok(Ok(_)) => {
                warn!(record = %record_id, %stage, error = %failure, "generation failed");
            }
            // The stage outcome was unknown and the record made it through.
            Ok(Err(RecordError::InvalidState { to: RecordStatus::Failed, .. })) => {
                if let Ok(Ok(Some(record))) = tokio::time::timeout(timeout, records.get(record_id)).await {
                    if let Some(doc) = record.to_ref() {
                        info!(record = %record_id, version = doc.version, "document committed despite stage error");
                        return Ok(doc);
                    }
                }
            }
            Ok(Err(e)) => {
                error!(record = %record_id, error = %e, "could not mark record failed; reconciliation will resolve it");
            }
            Err(_) => {
                error!(record = %record_id, ?timeout, "marking record failed timed out; reconciliation will resolve it");
            }
        }

        if matches!(failure, StageFailure::Asset(AssetError::Conflict { .. })) {
            error!(record = %record_id, error = %failure, "storage key collision");
        }
        Err(PipelineError::stage(
            stage,
            &self.guest.id,
            self.record.document_type,
            Some(self.record.version),
            failure,
        ))
    }

    async fn stages(&self) -> Result<DocumentRef, (Stage, StageFailure)> {
        let pipeline = &self.pipeline;
        let record = &self.record;

        let bytes = self.render().await.map_err(|e| (Stage::Render, e.into()))?;
        let hash = ContentHasher::DOCUMENT.hash(&bytes);
        let key = StorageKey::derive(&record.guest_id, record.document_type, record.version, &hash);

        let stored = self
            .upload(&key, bytes, &hash)
            .await
            .map_err(|e| (Stage::Upload, e))?;
        debug!(%key, size = stored.size, created = stored.created, "asset uploaded");

        let records = &pipeline.records;
        pipeline
            .with_retry("mark_stored", |attempt| {
                let key = &key;
                let hash = &hash;
                async move {
                    if attempt > 1 {
                        if let Some(current) = records.get(record.id).await? {
                            if current.status == RecordStatus::Stored
                                && current.storage_key.as_ref() == Some(key)
                            {
                                return Ok(current);
                            }
                        }
                    }
                    records.mark_stored(record.id, key, hash).await
                }
            })
            .await
            .map_err(|e| (Stage::MarkStored, e))?;

        let committed = pipeline
            .with_retry("commit", |attempt| async move {
                if attempt > 1 {
                    if let Some(current) = records.get(record.id).await? {
                        if current.status == RecordStatus::Committed {
                            return Ok(current);
                        }
                    }
                }
                records.commit(record.id).await
            })
            .await
            .map_err(|e| (Stage::Commit, e))?;

        let doc = committed.to_ref().ok_or_else(|| {
            let failure = RecordError::InvalidState {
                record_id: committed.id,
                from: committed.status,
                to: RecordStatus::Committed,
            };
            (Stage::Commit, StageFailure::from(failure))
        })?;
        info!(
            guest_id = %doc.guest_id,
            document_type = %doc.document_type,
            version = doc.version,
            key = %doc.storage_key,
            "document committed"
        );
        Ok(doc)
    }

    /// Render on the blocking pool under the render timeout.
    async fn render(&self) -> Result<Bytes, RenderError> {
        let limit = self.pipeline.config.render_timeout;
        let renderer = Arc::clone(&self.renderer);
        let guest = self.guest.clone();
        let document_type = self.record.document_type;
        let task = tokio::task::spawn_blocking(move || renderer.render(&guest, document_type));

        let bytes = match tokio::time::timeout(limit, task).await {
            Err(_) => return Err(RenderError::Timeout(limit)),
            Ok(Err(join)) => return Err(RenderError::Failed(format!("renderer panicked: {join}"))),
            Ok(Ok(result)) => result?,
        };
        if bytes.is_empty() {
            return Err(RenderError::InvalidInput("renderer produced no bytes".into()));
        }
        Ok(Bytes::from(bytes))
    }

    /// Upload, checking `head` before any retry so an upload whose outcome
    /// was unknown is not blindly repeated.
    async fn upload(
        &self,
        key: &StorageKey,
        bytes: Bytes,
        hash: &ContentHash,
    ) -> Result<StoredRef, StageFailure> {
        let assets = &self.pipeline.assets;
        let bytes = &bytes;
        self.pipeline
            .with_retry("put", |attempt| async move {
                if attempt > 1 {
                    if let Some(meta) = assets.head(key).await? {
                        if meta.content_hash == *hash {
                            debug!(%key, attempt, "asset already present after unknown outcome");
                            return Ok(StoredRef {
                                key: key.clone(),
                                content_hash: meta.content_hash,
                                size: meta.size,
                                created: false,
                            });
                        }
                    }
                }
                assets.put(key, bytes.clone(), hash).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::guests::InMemoryGuestDirectory;
    use crate::testing::{CountingRenderer, FlakyAssetStore};
    use crate::RetryPolicy;
    use rjw_assets::InMemoryAssetStore;
    use rjw_records::InMemoryRecordStore;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        assets: Arc<InMemoryAssetStore>,
        flaky: Arc<FlakyAssetStore>,
        records: Arc<InMemoryRecordStore>,
        guests: Arc<InMemoryGuestDirectory>,
        pipeline: DocumentPipeline,
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            store_timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                max_attempts: 4,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
            inflight_poll: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn harness(config: PipelineConfig) -> Harness {
        let assets = Arc::new(InMemoryAssetStore::new());
        let flaky = Arc::new(FlakyAssetStore::new(assets.clone()));
        let records = Arc::new(InMemoryRecordStore::new(flaky.clone()));
        let guests = Arc::new(InMemoryGuestDirectory::new());
        guests.upsert(GuestData::new(gid("g1"), "The Smiths", 2));
        let pipeline =
            DocumentPipeline::new(flaky.clone(), records.clone(), guests.clone()).with_config(config);
        Harness {
            assets,
            flaky,
            records,
            guests,
            pipeline,
        }
    }

    fn gid(s: &str) -> GuestId {
        GuestId::new(s).unwrap()
    }

    #[tokio::test]
    async fn generate_reuse_and_regenerate() {
        let h = harness(fast_config());
        let renderer = CountingRenderer::new();

        let first = h
            .pipeline
            .generate(&gid("g1"), DocumentType::Invitation, renderer.clone())
            .await
            .unwrap();
        assert_eq!(first.version, 1);
        let bytes = h.pipeline.fetch(&first).await.unwrap();
        let h1 = ContentHasher::DOCUMENT.hash(&bytes);
        assert_eq!(first.content_hash, h1);
        assert_eq!(first.storage_key.as_str(), format!("g1/invitation/1-{}", h1.prefix()));

        let again = h
            .pipeline
            .generate(&gid("g1"), DocumentType::Invitation, renderer.clone())
            .await
            .unwrap();
        assert_eq!(again, first);
        assert_eq!(renderer.calls(), 1);

        let mut guest = h.guests.get_guest(&gid("g1")).await.unwrap().unwrap();
        guest.count = 3;
        h.guests.upsert(guest);
        let second = h
            .pipeline
            .generate(&gid("g1"), DocumentType::Invitation, renderer.clone())
            .await
            .unwrap();
        assert_eq!(second.version, 2);
        let h2 = ContentHasher::DOCUMENT.hash(&h.pipeline.fetch(&second).await.unwrap());
        assert_eq!(second.storage_key.as_str(), format!("g1/invitation/2-{}", h2.prefix()));
        assert_ne!(h1, h2);
        assert_eq!(renderer.calls(), 2);

        let v1 = h
            .pipeline
            .version(&gid("g1"), DocumentType::Invitation, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v1, first);
        assert_eq!(h.pipeline.fetch(&v1).await.unwrap(), bytes);
        assert_eq!(h.pipeline.latest(&gid("g1"), DocumentType::Invitation).await.unwrap(), Some(second));
        assert_eq!(h.pipeline.versions(&gid("g1"), DocumentType::Invitation).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn document_types_are_versioned_independently() {
        let h = harness(fast_config());
        let renderer = CountingRenderer::new();
        let inv = h.pipeline.generate(&gid("g1"), DocumentType::Invitation, renderer.clone()).await.unwrap();
        let iti = h.pipeline.generate(&gid("g1"), DocumentType::Itinerary, renderer.clone()).await.unwrap();
        assert_eq!(inv.version, 1);
        assert_eq!(iti.version, 1);
        assert_ne!(inv.storage_key, iti.storage_key);
    }

    #[tokio::test]
    async fn concurrent_requests_produce_one_version() {
        let h = harness(fast_config());
        let renderer = CountingRenderer::with_delay(Duration::from_millis(50));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pipeline = h.pipeline.clone();
                let renderer = renderer.clone();
                tokio::spawn(async move {
                    pipeline.generate(&gid("g1"), DocumentType::Invitation, renderer).await
                })
            })
            .collect();

        let mut refs = Vec::new();
        for handle in handles {
            refs.push(handle.await.unwrap().unwrap());
        }
        assert!(refs.iter().all(|r| *r == refs[0]));
        assert_eq!(refs[0].version, 1);
        assert_eq!(renderer.calls(), 1);
        assert_eq!(h.assets.write_count(), 1);
        assert_eq!(h.records.len(), 1);
    }

    #[tokio::test]
    async fn unknown_guest() {
        let h = harness(fast_config());
        let err = h
            .pipeline
            .generate(&gid("nobody"), DocumentType::Invitation, CountingRenderer::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::GuestNotFound(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(h.records.is_empty());
    }

    #[tokio::test]
    async fn render_error_marks_record_failed() {
        let h = harness(fast_config());
        let broken = |_: &GuestData, _: DocumentType| -> Result<Vec<u8>, RenderError> {
            Err(RenderError::InvalidInput("missing address".into()))
        };
        let err = h
            .pipeline
            .generate(&gid("g1"), DocumentType::Itinerary, Arc::new(broken))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Render);
        assert!(!err.is_retryable());
        match &err {
            PipelineError::Stage { stage, version, .. } => {
                assert_eq!(*stage, Stage::Render);
                assert_eq!(*version, Some(1));
            }
            other => panic!("expected stage error, got {other:?}"),
        }

        let failed = h
            .records
            .list_by_status(RecordStatus::Failed, chrono::Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].failure_reason.as_deref().unwrap().contains("missing address"));

        // The failed version is burned; the next attempt gets version 2.
        let doc = h
            .pipeline
            .generate(&gid("g1"), DocumentType::Itinerary, CountingRenderer::new())
            .await
            .unwrap();
        assert_eq!(doc.version, 2);
    }

    #[tokio::test]
    async fn empty_render_is_an_error() {
        let h = harness(fast_config());
        let empty = |_: &GuestData, _: DocumentType| -> Result<Vec<u8>, RenderError> { Ok(Vec::new()) };
        let err = h
            .pipeline
            .generate(&gid("g1"), DocumentType::Invitation, Arc::new(empty))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Render);
    }

    #[tokio::test]
    async fn render_timeout() {
        let mut config = fast_config();
        config.render_timeout = Duration::from_millis(20);
        let h = harness(config);
        let err = h
            .pipeline
            .generate(
                &gid("g1"),
                DocumentType::Invitation,
                CountingRenderer::with_delay(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Stage {
                source: StageFailure::Render(RenderError::Timeout(_)),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn transient_put_failures_are_retried() {
        let h = harness(fast_config());
        h.flaky.failing_puts.store(2, Ordering::SeqCst);
        let doc = h
            .pipeline
            .generate(&gid("g1"), DocumentType::Invitation, CountingRenderer::new())
            .await
            .unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(h.flaky.put_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.assets.write_count(), 1);
    }

    #[tokio::test]
    async fn put_timeout_checks_head_before_retrying() {
        let h = harness(fast_config());
        h.flaky.stalled_puts.store(1, Ordering::SeqCst);
        let doc = h
            .pipeline
            .generate(&gid("g1"), DocumentType::Invitation, CountingRenderer::new())
            .await
            .unwrap();
        assert_eq!(doc.version, 1);
        // The stalled write landed; the retry found it through `head`.
        assert_eq!(h.flaky.put_calls.load(Ordering::SeqCst), 1);
        assert!(h.flaky.head_calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(h.assets.write_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_record() {
        let mut config = fast_config();
        config.retry.max_attempts = 2;
        let h = harness(config);
        h.flaky.failing_puts.store(10, Ordering::SeqCst);
        let err = h
            .pipeline
            .generate(&gid("g1"), DocumentType::Invitation, CountingRenderer::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.is_retryable());
        assert_eq!(h.flaky.put_calls.load(Ordering::SeqCst), 2);
        assert!(h.pipeline.latest(&gid("g1"), DocumentType::Invitation).await.unwrap().is_none());
        let failed = h
            .records
            .list_by_status(RecordStatus::Failed, chrono::Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn key_collision_is_surfaced_as_conflict() {
        let h = harness(fast_config());
        let renderer = CountingRenderer::new();
        let guest = h.guests.get_guest(&gid("g1")).await.unwrap().unwrap();
        let expected = renderer.render(&guest, DocumentType::Invitation).unwrap();
        let hash = ContentHasher::DOCUMENT.hash(&expected);
        let key = StorageKey::derive(&gid("g1"), DocumentType::Invitation, 1, &hash);

        let squatter = Bytes::from_static(b"someone else's bytes");
        let squatter_hash = ContentHasher::DOCUMENT.hash(&squatter);
        h.assets.put(&key, squatter.clone(), &squatter_hash).await.unwrap();

        let err = h
            .pipeline
            .generate(&gid("g1"), DocumentType::Invitation, renderer)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(matches!(err, PipelineError::Stage { stage: Stage::Upload, .. }));
        // Existing bytes were not overwritten.
        assert_eq!(h.assets.get(&key).await.unwrap(), squatter);
    }

    #[tokio::test]
    async fn dropped_caller_does_not_abandon_generation() {
        let h = harness(fast_config());
        let renderer = CountingRenderer::with_delay(Duration::from_millis(100));
        let caller = {
            let pipeline = h.pipeline.clone();
            let renderer = renderer.clone();
            tokio::spawn(async move {
                pipeline.generate(&gid("g1"), DocumentType::Invitation, renderer).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        caller.abort();

        let mut committed = None;
        for _ in 0..100 {
            committed = h.pipeline.latest(&gid("g1"), DocumentType::Invitation).await.unwrap();
            if committed.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(committed.unwrap().version, 1);
        assert_eq!(renderer.calls(), 1);
    }

    #[tokio::test]
    async fn stuck_in_flight_generation_times_out() {
        let mut config = fast_config();
        config.inflight_wait = Duration::from_millis(50);
        let h = harness(config);
        // Another instance allocated and then went quiet.
        let stuck = h
            .records
            .create_pending(&gid("g1"), DocumentType::Invitation, chrono::Utc::now())
            .await
            .unwrap();

        let err = h
            .pipeline
            .generate(&gid("g1"), DocumentType::Invitation, CountingRenderer::new())
            .await
            .unwrap_err();
        match err {
            PipelineError::InFlight { record_id, .. } => assert_eq!(record_id, stuck.id),
            ref other => panic!("expected InFlight, got {other:?}"),
        }
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn fetch_by_key_serves_committed_only() {
        let h = harness(fast_config());
        let doc = h
            .pipeline
            .generate(&gid("g1"), DocumentType::Invitation, CountingRenderer::new())
            .await
            .unwrap();
        let (found, bytes) = h.pipeline.fetch_by_key(&doc.storage_key).await.unwrap().unwrap();
        assert_eq!(found, doc);
        assert_eq!(ContentHasher::DOCUMENT.hash(&bytes), doc.content_hash);

        // An upload with no committed record behind it is invisible.
        let orphan = Bytes::from_static(b"orphan");
        let orphan_hash = ContentHasher::DOCUMENT.hash(&orphan);
        let orphan_key = StorageKey::derive(&gid("g1"), DocumentType::Invitation, 9, &orphan_hash);
        h.assets.put(&orphan_key, orphan, &orphan_hash).await.unwrap();
        assert!(h.pipeline.fetch_by_key(&orphan_key).await.unwrap().is_none());

        let junk = StorageKey::parse("not/a/document/key").unwrap();
        assert!(h.pipeline.fetch_by_key(&junk).await.unwrap().is_none());
        assert_eq!(h.pipeline.locate(&doc), format!("memory://{}", doc.storage_key));
    }

    #[test]
    fn parse_key_round_trips_derived_keys() {
        let hash = ContentHasher::DOCUMENT.hash(b"x");
        let key = StorageKey::derive(&gid("AB12"), DocumentType::Itinerary, 42, &hash);
        assert_eq!(parse_key(&key), Some((gid("AB12"), DocumentType::Itinerary, 42)));
        assert_eq!(parse_key(&StorageKey::parse("g1/invitation").unwrap()), None);
        assert_eq!(parse_key(&StorageKey::parse("g1/letter/1-aa").unwrap()), None);
    }
}
