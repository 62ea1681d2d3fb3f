use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rjw_crypto::ContentHasher;
use rjw_types::{ContentHash, StorageKey};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{AssetError, AssetResult};
use crate::traits::{existing_outcome, AssetMeta, AssetStore, StoredRef};

const DATA_SUFFIX: &str = ".bin";
const META_SUFFIX: &str = ".meta";

/// Directory-backed asset store.
///
/// Each key maps to `{root}/{segments...}.bin` with a JSON sidecar
/// `{root}/{segments...}.meta` holding the [`AssetMeta`].
///
/// Put-if-absent is a hard link of a fully written and synced temp file onto
/// the data path; the link fails if another writer got there first, which
/// makes the first writer win across processes. The sidecar is written after
/// the link. A crash between the two leaves data without a sidecar; `head`
/// recomputes the hash from the data in that case and repairs the sidecar.
#[derive(Debug, Clone)]
pub struct FsAssetStore {
    root: PathBuf,
}

impl FsAssetStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> AssetResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn base_path(&self, key: &StorageKey) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.segments() {
            path.push(segment);
        }
        path
    }

    fn data_path(&self, key: &StorageKey) -> PathBuf {
        with_suffix(self.base_path(key), DATA_SUFFIX)
    }

    fn meta_path(&self, key: &StorageKey) -> PathBuf {
        with_suffix(self.base_path(key), META_SUFFIX)
    }

    async fn write_meta(&self, key: &StorageKey, meta: &AssetMeta) -> AssetResult<()> {
        let encoded =
            serde_json::to_vec(meta).map_err(|e| AssetError::Serialization(e.to_string()))?;
        let meta_path = self.meta_path(key);
        let tmp = temp_path(&meta_path);
        write_synced(&tmp, &encoded).await?;
        // rename replaces atomically, so readers see either the old or new sidecar.
        if let Err(e) = fs::rename(&tmp, &meta_path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_meta(&self, key: &StorageKey) -> AssetResult<Option<AssetMeta>> {
        match fs::read(self.meta_path(key)).await {
            Ok(raw) => match serde_json::from_slice::<AssetMeta>(&raw) {
                Ok(meta) => Ok(Some(meta)),
                Err(e) => {
                    warn!(%key, error = %e, "unreadable asset sidecar; rebuilding from data");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Rebuild the sidecar of an asset whose data exists.
    async fn rebuild_meta(&self, key: &StorageKey, data: &[u8]) -> AssetResult<AssetMeta> {
        let stored_at = match fs::metadata(self.data_path(key)).await?.modified() {
            Ok(time) => DateTime::<Utc>::from(time),
            Err(_) => Utc::now(),
        };
        let meta = AssetMeta {
            content_hash: ContentHasher::DOCUMENT.hash(data),
            size: data.len() as u64,
            stored_at,
        };
        self.write_meta(key, &meta).await?;
        warn!(%key, "repaired missing asset sidecar");
        Ok(meta)
    }
}

#[async_trait]
impl AssetStore for FsAssetStore {
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

        if let Some(existing) = self.head(key).await? {
            return existing_outcome(key, &existing, content_hash);
        }

        let data_path = self.data_path(key);
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = temp_path(&data_path);
        write_synced(&tmp, &bytes).await?;

        let linked = fs::hard_link(&tmp, &data_path).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Lost the race to a concurrent writer; judge by what it stored.
                let existing = self
                    .head(key)
                    .await?
                    .ok_or_else(|| AssetError::NotFound(key.clone()))?;
                return existing_outcome(key, &existing, content_hash);
            }
            Err(e) => return Err(e.into()),
        }

        let meta = AssetMeta {
            content_hash: *content_hash,
            size: bytes.len() as u64,
            stored_at: Utc::now(),
        };
        self.write_meta(key, &meta).await?;
        debug!(%key, size = meta.size, "asset written");

        Ok(StoredRef {
            key: key.clone(),
            content_hash: meta.content_hash,
            size: meta.size,
            created: true,
        })
    }

    async fn get(&self, key: &StorageKey) -> AssetResult<Bytes> {
        let data = match fs::read(self.data_path(key)).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(AssetError::NotFound(key.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let meta = match self.read_meta(key).await? {
            Some(meta) => meta,
            None => self.rebuild_meta(key, &data).await?,
        };
        if !ContentHasher::DOCUMENT.verify(&data, &meta.content_hash) {
            return Err(AssetError::Corrupt {
                key: key.clone(),
                reason: format!("bytes do not match recorded hash {}", meta.content_hash),
            });
        }
        Ok(Bytes::from(data))
    }

    async fn head(&self, key: &StorageKey) -> AssetResult<Option<AssetMeta>> {
        match fs::metadata(self.data_path(key)).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if let Some(meta) = self.read_meta(key).await? {
            return Ok(Some(meta));
        }
        let data = fs::read(self.data_path(key)).await?;
        Ok(Some(self.rebuild_meta(key, &data).await?))
    }

    async fn list(&self, prefix: &str) -> AssetResult<Vec<StorageKey>> {
        if prefix.contains("..") || prefix.starts_with('/') || prefix.contains('\\') {
            return Err(AssetError::InvalidKey(prefix.to_string()));
        }
        // Only walk below the deepest directory the prefix names in full.
        let start = match prefix.rsplit_once('/') {
            Some((dir, _)) => self.root.join(dir),
            None => self.root.clone(),
        };

        let mut keys = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') {
                    continue;
                }
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(key) = self.key_for(&path) else {
                    continue;
                };
                if key.as_str().starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn locate(&self, key: &StorageKey) -> String {
        format!("file://{}", self.data_path(key).display())
    }
}

impl FsAssetStore {
    /// Map a data file path back to its key.
    fn key_for(&self, path: &Path) -> Option<StorageKey> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let joined = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?
            .join("/");
        let stem = joined.strip_suffix(DATA_SUFFIX)?;
        StorageKey::parse(stem).ok()
    }
}

fn with_suffix(path: PathBuf, suffix: &str) -> PathBuf {
    let mut os = path.into_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::now_v7()))
}

async fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}
