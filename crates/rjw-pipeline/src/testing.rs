//! Test doubles shared by the pipeline and reconciler tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rjw_assets::{AssetError, AssetMeta, AssetResult, AssetStore, InMemoryAssetStore, StoredRef};
use rjw_types::{ContentHash, DocumentType, GuestData, StorageKey};

use crate::render::{RenderError, Renderer};

/// Asset store that misbehaves on request.
pub(crate) struct FlakyAssetStore {
    pub inner: Arc<InMemoryAssetStore>,
    /// Fail this many upcoming puts with `Unavailable`, writing nothing.
    pub failing_puts: AtomicU32,
    /// Stall this many upcoming puts after the write has landed.
    pub stalled_puts: AtomicU32,
    pub stall: Duration,
    pub put_calls: AtomicU32,
    pub head_calls: AtomicU32,
}

impl FlakyAssetStore {
    pub fn new(inner: Arc<InMemoryAssetStore>) -> Self {
        Self {
            inner,
            failing_puts: AtomicU32::new(0),
            stalled_puts: AtomicU32::new(0),
            stall: Duration::from_millis(500),
            put_calls: AtomicU32::new(0),
            head_calls: AtomicU32::new(0),
        }
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AssetStore for FlakyAssetStore {
    async fn put(&self, key: &StorageKey, bytes: Bytes, content_hash: &ContentHash) -> AssetResult<StoredRef> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.failing_puts) {
            return Err(AssetError::Unavailable("injected fault".into()));
        }
        let stored = self.inner.put(key, bytes, content_hash).await?;
        if Self::take(&self.stalled_puts) {
            tokio::time::sleep(self.stall).await;
        }
        Ok(stored)
    }

    async fn get(&self, key: &StorageKey) -> AssetResult<Bytes> {
        self.inner.get(key).await
    }

    async fn head(&self, key: &StorageKey) -> AssetResult<Option<AssetMeta>> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.head(key).await
    }

    async fn list(&self, prefix: &str) -> AssetResult<Vec<StorageKey>> {
        self.inner.list(prefix).await
    }

    fn locate(&self, key: &StorageKey) -> String {
        self.inner.locate(key)
    }
}

/// Deterministic renderer that counts its calls.
pub(crate) struct CountingRenderer {
    pub calls: AtomicUsize,
    pub delay: Duration,
}

impl CountingRenderer {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Renderer for CountingRenderer {
    fn render(&self, guest: &GuestData, document_type: DocumentType) -> Result<Vec<u8>, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(format!(
            "{document_type}|{}|{}|{}",
            guest.display_name,
            guest.count,
            guest.last_modified.to_rfc3339()
        )
        .into_bytes())
    }
}
