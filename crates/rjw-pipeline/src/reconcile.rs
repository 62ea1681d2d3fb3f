//! Background repair of generations a crash left behind.
//!
//! A generation can stop between any two steps: the process dies, the
//! task is aborted, or `mark_failed` itself fails. The reconciler finds
//! records that stayed non-terminal past the grace period and finishes them:
//!
//! - `Stored`: re-verify and commit; on verification failure mark failed.
//! - `Pending` with exactly one asset under the version's key prefix: the
//!   upload finished but `mark_stored` did not. Record the asset's hash and
//!   commit, without uploading again.
//! - `Pending` with no asset: mark failed.
//! - `Pending` with several assets: left alone and logged.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rjw_assets::AssetStore;
use rjw_records::{DocumentRecord, DocumentRecordStore, RecordError, RecordStatus};
use rjw_types::StorageKey;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineResult;

/// What one reconciliation pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// `Stored` records committed.
    pub committed: usize,
    /// `Pending` records whose orphaned upload was adopted and committed.
    pub recovered: usize,
    /// Records marked failed.
    pub failed: usize,
    /// Records left as they were (ambiguous, raced, or a transient error).
    pub skipped: usize,
}

impl ReconcileReport {
    /// Number of records the pass looked at.
    pub fn examined(&self) -> usize {
        self.committed + self.recovered + self.failed + self.skipped
    }
}

enum Outcome {
    Committed,
    Recovered,
    Failed,
    Skipped,
}

/// Drives stale non-terminal records to a terminal state.
pub struct Reconciler {
    assets: Arc<dyn AssetStore>,
    records: Arc<dyn DocumentRecordStore>,
    config: PipelineConfig,
}

impl Reconciler {
    pub fn new(
        assets: Arc<dyn AssetStore>,
        records: Arc<dyn DocumentRecordStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            assets,
            records,
            config,
        }
    }

    /// Run passes every `reconcile_interval` until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.reconcile_interval, "reconciler started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.reconcile_once().await {
                Ok(report) if report.examined() > 0 => {
                    info!(
                        committed = report.committed,
                        recovered = report.recovered,
                        failed = report.failed,
                        skipped = report.skipped,
                        "reconciliation pass finished"
                    );
                }
                Ok(_) => debug!("reconciliation pass found nothing to do"),
                Err(e) => warn!(error = %e, "reconciliation pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconcile_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("reconciler stopped");
    }

    /// One pass over every record untouched for longer than the grace period.
    pub async fn reconcile_once(&self) -> PipelineResult<ReconcileReport> {
        self.reconcile_before(cutoff(Utc::now(), self.config.grace_period)).await
    }

    /// One pass over records last updated before `cutoff`.
    pub async fn reconcile_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let stored = self.records.list_by_status(RecordStatus::Stored, cutoff).await?;
        for record in &stored {
            let outcome = self.finish_stored(record).await;
            tally(&mut report, outcome);
        }

        let pending = self.records.list_by_status(RecordStatus::Pending, cutoff).await?;
        for record in &pending {
            let outcome = self.finish_pending(record).await;
            tally(&mut report, outcome);
        }

        Ok(report)
    }

    async fn finish_stored(&self, record: &DocumentRecord) -> Outcome {
        match self.records.commit(record.id).await {
            Ok(committed) => {
                warn!(record = %record.id, version = committed.version, "reconciliation committed stored record");
                Outcome::Committed
            }
            Err(e @ (RecordError::AssetMissing { .. } | RecordError::HashMismatch { .. })) => {
                self.fail(record, &format!("reconciliation: {e}")).await
            }
            Err(RecordError::InvalidState { .. }) => Outcome::Skipped,
            Err(e) => {
                warn!(record = %record.id, error = %e, "could not commit stored record; will retry");
                Outcome::Skipped
            }
        }
    }

    async fn finish_pending(&self, record: &DocumentRecord) -> Outcome {
        let prefix = StorageKey::version_prefix(&record.guest_id, record.document_type, record.version);
        let keys = match self.assets.list(&prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(record = %record.id, error = %e, "could not list assets; will retry");
                return Outcome::Skipped;
            }
        };

        let key = match keys.as_slice() {
            [] => return self.fail(record, "reconciliation: no asset uploaded").await,
            [key] => key,
            many => {
                warn!(record = %record.id, %prefix, count = many.len(), "several assets for one version; leaving for an operator");
                return Outcome::Skipped;
            }
        };

        let meta = match self.assets.head(key).await {
            Ok(Some(meta)) => meta,
            Ok(None) => return Outcome::Skipped,
            Err(e) => {
                warn!(record = %record.id, %key, error = %e, "could not read asset metadata; will retry");
                return Outcome::Skipped;
            }
        };

        if let Err(e) = self.records.mark_stored(record.id, key, &meta.content_hash).await {
            debug!(record = %record.id, error = %e, "pending record moved on; skipping");
            return Outcome::Skipped;
        }
        match self.records.commit(record.id).await {
            Ok(_) => {
                warn!(record = %record.id, %key, "reconciliation adopted orphaned upload");
                Outcome::Recovered
            }
            Err(e @ (RecordError::AssetMissing { .. } | RecordError::HashMismatch { .. })) => {
                self.fail(record, &format!("reconciliation: {e}")).await
            }
            Err(e) => {
                // Now `Stored`; the next pass picks it up there.
                warn!(record = %record.id, error = %e, "could not commit adopted upload; will retry");
                Outcome::Skipped
            }
        }
    }

    async fn fail(&self, record: &DocumentRecord, reason: &str) -> Outcome {
        match self.records.mark_failed(record.id, reason).await {
            Ok(_) => {
                warn!(record = %record.id, version = record.version, reason, "reconciliation failed record");
                Outcome::Failed
            }
            Err(e) => {
                error!(record = %record.id, error = %e, "could not mark record failed");
                Outcome::Skipped
            }
        }
    }
}

fn tally(report: &mut ReconcileReport, outcome: Outcome) {
    match outcome {
        Outcome::Committed => report.committed += 1,
        Outcome::Recovered => report.recovered += 1,
        Outcome::Failed => report.failed += 1,
        Outcome::Skipped => report.skipped += 1,
    }
}

fn cutoff(now: DateTime<Utc>, grace: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(grace)
        .ok()
        .and_then(|grace| now.checked_sub_signed(grace))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
