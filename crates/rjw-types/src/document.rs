use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TypeError;
use crate::ids::GuestId;

/// The kinds of per-guest document the service produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    /// The wedding invitation addressed to the guest group.
    Invitation,
    /// The day's schedule, tailored to what the group attends.
    Itinerary,
}

impl DocumentType {
    /// All document types, in display order.
    pub const ALL: [DocumentType; 2] = [DocumentType::Invitation, DocumentType::Itinerary];

    /// The lowercase name used in storage keys and URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invitation => "invitation",
            Self::Itinerary => "itinerary",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "invitation" => Ok(Self::Invitation),
            "itinerary" => Ok(Self::Itinerary),
            other => Err(TypeError::UnknownDocumentType(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ContentHash
// ---------------------------------------------------------------------------

/// BLAKE3 digest of a generated document's bytes.
///
/// Serialized as a 64-character hex string so it reads the same in JSON
/// responses, sidecar files, and journal frames.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Number of hex characters of the hash embedded in a storage key.
    pub const PREFIX_LEN: usize = 16;

    /// Create from a pre-computed digest.
    pub const fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// The raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The leading hex characters used in storage keys.
    pub fn prefix(&self) -> String {
        hex::encode(&self.0[..Self::PREFIX_LEN / 2])
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(TypeError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.prefix())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// StorageKey
// ---------------------------------------------------------------------------

/// Opaque key into the asset store.
///
/// Keys produced by [`StorageKey::derive`] have the form
/// `{guestId}/{documentType}/{version}-{hashPrefix}`; they embed both the
/// version and the content hash, so two different documents can never be
/// written under the same key. Arbitrary keys go through
/// [`StorageKey::parse`], which rejects anything that could escape a
/// namespace (empty segments, `.`/`..`, backslashes, leading `/`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey(String);

impl StorageKey {
    /// Derive the key for a document version.
    pub fn derive(
        guest_id: &GuestId,
        document_type: DocumentType,
        version: u64,
        content_hash: &ContentHash,
    ) -> Self {
        Self(format!(
            "{}{}",
            Self::version_prefix(guest_id, document_type, version),
            content_hash.prefix()
        ))
    }

    /// Listing prefix shared by every key of one document version.
    pub fn version_prefix(guest_id: &GuestId, document_type: DocumentType, version: u64) -> String {
        format!("{guest_id}/{document_type}/{version}-")
    }

    /// Validate an arbitrary key string.
    pub fn parse(key: impl Into<String>) -> Result<Self, TypeError> {
        let key = key.into();
        let reason = if key.is_empty() {
            Some("must not be empty")
        } else if key.starts_with('/') || key.ends_with('/') {
            Some("must not start or end with '/'")
        } else if key.contains('\\') {
            Some("must not contain backslashes")
        } else if key.chars().any(char::is_control) {
            Some("must not contain control characters")
        } else if key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            Some("must not contain empty, '.' or '..' segments")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(TypeError::InvalidStorageKey { key, reason }),
            None => Ok(Self(key)),
        }
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `/`-separated segments of the key.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageKey({})", self.0)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StorageKey {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.0
    }
}

// ---------------------------------------------------------------------------
// DocumentRef
// ---------------------------------------------------------------------------

/// Reference to a committed document, handed to the API layer.
///
/// A `DocumentRef` is only ever built from a record in the `Committed`
/// state, so holding one means the bytes behind `storage_key` were verified
/// present with `content_hash`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub guest_id: GuestId,
    pub document_type: DocumentType,
    pub version: u64,
    pub storage_key: StorageKey,
    pub content_hash: ContentHash,
    pub committed_at: DateTime<Utc>,
}
