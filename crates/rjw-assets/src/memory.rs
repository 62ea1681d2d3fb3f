use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use rjw_crypto::ContentHasher;
use rjw_types::{ContentHash, StorageKey};

use crate::error::{AssetError, AssetResult};
use crate::traits::{existing_outcome, AssetMeta, AssetStore, StoredRef};

struct Entry {
    bytes: Bytes,
    meta: AssetMeta,
}

/// In-memory, HashMap-based asset store.
///
/// Intended for tests and embedding. Entries live behind a `RwLock`; the
/// number of physical writes is counted so callers can assert that a retry
/// or a reconciliation did not upload again.
pub struct InMemoryAssetStore {
    assets: RwLock<HashMap<StorageKey, Entry>>,
    writes: AtomicU64,
}

impl InMemoryAssetStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            assets: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of assets currently stored.
    pub fn len(&self) -> usize {
        self.assets.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.assets.read().expect("lock poisoned").is_empty()
    }

    /// Number of `put` calls that actually wrote bytes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Remove an asset. Returns `true` if it existed.
    ///
    /// The document core never deletes; this exists for external retention
    /// processes.
    pub fn remove(&self, key: &StorageKey) -> bool {
        self.assets
            .write()
            .expect("lock poisoned")
            .remove(key)
            .is_some()
    }
}

impl Default for InMemoryAssetStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn put(
        &self,
        key: &StorageKey,
        bytes: Bytes,
        content_hash: &ContentHash,
    ) -> AssetResult<StoredRef> {
        let computed = ContentHasher::DOCUMENT.hash(&bytes);
        if computed != *content_hash {
            return Err(AssetError::HashMismatch {
                key: key.clone(),
                expected: *content_hash,
                computed,
            });
        }

        let mut map = self.assets.write().expect("lock poisoned");
        if let Some(existing) = map.get(key) {
            return existing_outcome(key, &existing.meta, content_hash);
        }

        let meta = AssetMeta {
            content_hash: *content_hash,
            size: bytes.len() as u64,
            stored_at: Utc::now(),
        };
        map.insert(
            key.clone(),
            Entry {
                bytes,
                meta: meta.clone(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(%key, size = meta.size, "asset stored in memory");

        Ok(StoredRef {
            key: key.clone(),
            content_hash: meta.content_hash,
            size: meta.size,
            created: true,
        })
    }

    async fn get(&self, key: &StorageKey) -> AssetResult<Bytes> {
        let map = self.assets.read().expect("lock poisoned");
        let entry = map.get(key).ok_or_else(|| AssetError::NotFound(key.clone()))?;
        if !ContentHasher::DOCUMENT.verify(&entry.bytes, &entry.meta.content_hash) {
            return Err(AssetError::Corrupt {
                key: key.clone(),
                reason: "bytes do not match recorded hash".into(),
            });
        }
        Ok(entry.bytes.clone())
    }

    async fn head(&self, key: &StorageKey) -> AssetResult<Option<AssetMeta>> {
        let map = self.assets.read().expect("lock poisoned");
        Ok(map.get(key).map(|entry| entry.meta.clone()))
    }

    async fn list(&self, prefix: &str) -> AssetResult<Vec<StorageKey>> {
        let map = self.assets.read().expect("lock poisoned");
        let mut keys: Vec<StorageKey> = map
            .keys()
            .filter(|key| key.as_str().starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn locate(&self, key: &StorageKey) -> String {
        format!("memory://{key}")
    }
}

impl std::fmt::Debug for InMemoryAssetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryAssetStore")
            .field("asset_count", &self.len())
            .field("write_count", &self.write_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(s: &str) -> StorageKey {
        StorageKey::parse(s).unwrap()
    }

    fn payload(data: &'static [u8]) -> (Bytes, ContentHash) {
        (Bytes::from_static(data), ContentHasher::DOCUMENT.hash(data))
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = InMemoryAssetStore::new();
        let (bytes, hash) = payload(b"invitation for g1");
        let stored = store.put(&key("g1/invitation/1-aa"), bytes.clone(), &hash).await.unwrap();
        assert!(stored.created);
        assert_eq!(stored.size, bytes.len() as u64);
        assert_eq!(store.get(&key("g1/invitation/1-aa")).await.unwrap(), bytes);
    }

    #[tokio::test]
    async fn put_same_hash_is_idempotent() {
        let store = InMemoryAssetStore::new();
        let (bytes, hash) = payload(b"same");
        let k = key("g1/invitation/1-aa");
        store.put(&k, bytes.clone(), &hash).await.unwrap();
        let again = store.put(&k, bytes, &hash).await.unwrap();
        assert!(!again.created);
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn put_different_hash_conflicts() {
        let store = InMemoryAssetStore::new();
        let k = key("g1/invitation/1-aa");
        let (a, ha) = payload(b"first");
        let (b, hb) = payload(b"second");
        store.put(&k, a.clone(), &ha).await.unwrap();
        let err = store.put(&k, b, &hb).await.unwrap_err();
        assert!(matches!(err, AssetError::Conflict { .. }));
        // Original content untouched.
        assert_eq!(store.get(&k).await.unwrap(), a);
    }

    #[tokio::test]
    async fn put_rejects_wrong_claimed_hash() {
        let store = InMemoryAssetStore::new();
        let (bytes, _) = payload(b"actual");
        let (_, other) = payload(b"claimed");
        let err = store.put(&key("k"), bytes, &other).await.unwrap_err();
        assert!(matches!(err, AssetError::HashMismatch { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn missing_asset() {
        let store = InMemoryAssetStore::new();
        let k = key("nope");
        assert!(matches!(store.get(&k).await, Err(AssetError::NotFound(_))));
        assert!(!store.exists(&k).await.unwrap());
        assert!(store.head(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn head_reports_hash_without_bytes() {
        let store = InMemoryAssetStore::new();
        let (bytes, hash) = payload(b"meta");
        store.put(&key("a/b"), bytes, &hash).await.unwrap();
        let meta = store.head(&key("a/b")).await.unwrap().unwrap();
        assert_eq!(meta.content_hash, hash);
        assert_eq!(meta.size, 4);
    }

    #[tokio::test]
    async fn list_filters_by_prefix_sorted() {
        let store = InMemoryAssetStore::new();
        for k in ["g1/invitation/2-bb", "g1/invitation/1-aa", "g1/itinerary/1-cc", "g2/invitation/1-dd"] {
            let bytes = Bytes::from(k.as_bytes().to_vec());
            let hash = ContentHasher::DOCUMENT.hash(&bytes);
            store.put(&key(k), bytes, &hash).await.unwrap();
        }
        let listed = store.list("g1/invitation/").await.unwrap();
        let names: Vec<&str> = listed.iter().map(StorageKey::as_str).collect();
        assert_eq!(names, vec!["g1/invitation/1-aa", "g1/invitation/2-bb"]);
        assert_eq!(store.list("g1/invitation/1-").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_and_locate() {
        let store = InMemoryAssetStore::new();
        let (bytes, hash) = payload(b"x");
        let k = key("g1/invitation/1-aa");
        store.put(&k, bytes, &hash).await.unwrap();
        assert_eq!(store.locate(&k), "memory://g1/invitation/1-aa");
        assert!(store.remove(&k));
        assert!(!store.remove(&k));
    }

    #[tokio::test]
    async fn concurrent_puts_write_once() {
        let store = Arc::new(InMemoryAssetStore::new());
        let (bytes, hash) = payload(b"shared");
        let k = key("g1/invitation/1-aa");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let bytes = bytes.clone();
                let k = k.clone();
                tokio::spawn(async move { store.put(&k, bytes, &hash).await.unwrap() })
            })
            .collect();
        let mut created = 0;
        for h in handles {
            if h.await.unwrap().created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn debug_format() {
        let store = InMemoryAssetStore::new();
        let debug = format!("{store:?}");
        assert!(debug.contains("InMemoryAssetStore"));
        assert!(debug.contains("write_count"));
    }
}
