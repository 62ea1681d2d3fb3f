use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rjw_types::{ContentHash, StorageKey};
use serde::{Deserialize, Serialize};

use crate::error::{AssetError, AssetResult};

/// Metadata recorded alongside every stored asset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMeta {
    pub content_hash: ContentHash,
    pub size: u64,
    pub stored_at: DateTime<Utc>,
}

/// What a successful `put` reports back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRef {
    pub key: StorageKey,
    pub content_hash: ContentHash,
    pub size: u64,
    /// `false` when the asset was already present and nothing was written.
    pub created: bool,
}

/// Durable byte storage keyed by [`StorageKey`].
///
/// All implementations must satisfy these invariants:
/// - Read-after-write consistency for a key: once `put` returns, `head`,
///   `exists` and `get` observe the asset from any caller.
/// - `put` is idempotent for a matching hash and refuses a differing one.
/// - Safe to call concurrently from many tasks.
/// - All I/O errors are propagated, never silently ignored.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Store `bytes` under `key`.
    ///
    /// If the key already holds content with `content_hash` the call succeeds
    /// without rewriting (`created == false`). If it holds different content
    /// the call fails with [`AssetError::Conflict`].
    async fn put(
        &self,
        key: &StorageKey,
        bytes: Bytes,
        content_hash: &ContentHash,
    ) -> AssetResult<StoredRef>;

    /// Read the asset, verifying it against its recorded hash.
    async fn get(&self, key: &StorageKey) -> AssetResult<Bytes>;

    /// Metadata for the asset without transferring its bytes.
    ///
    /// Returns `Ok(None)` if nothing is stored under the key.
    async fn head(&self, key: &StorageKey) -> AssetResult<Option<AssetMeta>>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> AssetResult<Vec<StorageKey>>;

    /// The store's own address for a key (turned into a download URL by the
    /// API layer).
    fn locate(&self, key: &StorageKey) -> String;

    /// Check whether an asset exists.
    async fn exists(&self, key: &StorageKey) -> AssetResult<bool> {
        Ok(self.head(key).await?.is_some())
    }
}

/// Shared outcome of `put` against an asset that is already present.
pub(crate) fn existing_outcome(
    key: &StorageKey,
    existing: &AssetMeta,
    attempted: &ContentHash,
) -> AssetResult<StoredRef> {
    if existing.content_hash == *attempted {
        Ok(StoredRef {
            key: key.clone(),
            content_hash: existing.content_hash,
            size: existing.size,
            created: false,
        })
    } else {
        Err(AssetError::Conflict {
            key: key.clone(),
            existing: existing.content_hash,
            attempted: *attempted,
        })
    }
}
