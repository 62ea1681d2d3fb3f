use rjw_types::{ContentHash, StorageKey};

/// Errors from asset store operations.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    /// No asset is stored under the key.
    #[error("asset not found: {0}")]
    NotFound(StorageKey),

    /// The key already holds different content.
    #[error("conflicting content for {key}: stored {existing}, attempted {attempted}")]
    Conflict {
        key: StorageKey,
        existing: ContentHash,
        attempted: ContentHash,
    },

    /// The bytes handed to `put` do not hash to the claimed content hash.
    #[error("hash mismatch for {key}: expected {expected}, computed {computed}")]
    HashMismatch {
        key: StorageKey,
        expected: ContentHash,
        computed: ContentHash,
    },

    /// Stored bytes no longer match their recorded hash.
    #[error("corrupt asset {key}: {reason}")]
    Corrupt { key: StorageKey, reason: String },

    /// A key or prefix is not usable by this backend.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The backend is temporarily unreachable.
    #[error("asset store unavailable: {0}")]
    Unavailable(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl AssetError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// Result alias for asset store operations.
pub type AssetResult<T> = Result<T, AssetError>;
