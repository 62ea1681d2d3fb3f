//! Read access to guest groups.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rjw_types::{GuestData, GuestId};

/// Errors from a guest directory backend.
#[derive(Debug, thiserror::Error)]
pub enum GuestDirectoryError {
    #[error("guest directory unavailable: {0}")]
    Unavailable(String),

    #[error("invalid guest data: {0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the pipeline looks guests up. Owned by the guest CRUD layer.
#[async_trait]
pub trait GuestDirectory: Send + Sync {
    /// The guest group, or `None` if no group has this code.
    async fn get_guest(&self, id: &GuestId) -> Result<Option<GuestData>, GuestDirectoryError>;
}

/// Guest directory held in memory.
#[derive(Debug, Default)]
pub struct InMemoryGuestDirectory {
    guests: RwLock<HashMap<GuestId, GuestData>>,
}

impl InMemoryGuestDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list, keeping each guest's `last_modified` as given.
    ///
    /// Codes are compared after whitespace is stripped, so `"A B"` and `"AB"`
    /// are the same group. Duplicate codes or display names are rejected.
    pub fn from_guests(guests: impl IntoIterator<Item = GuestData>) -> Result<Self, GuestDirectoryError> {
        let mut map = HashMap::new();
        let mut names = HashSet::new();
        for guest in guests {
            if !names.insert(guest.display_name.trim().to_string()) {
                return Err(GuestDirectoryError::Invalid(format!(
                    "duplicate display name {:?}",
                    guest.display_name.trim()
                )));
            }
            if let Some(previous) = map.insert(guest.id.clone(), guest) {
                return Err(GuestDirectoryError::Invalid(format!("duplicate code {}", previous.id)));
            }
        }
        Ok(Self {
            guests: RwLock::new(map),
        })
    }

    /// Load a JSON array of guest groups.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, GuestDirectoryError> {
        let raw = tokio::fs::read(path.as_ref()).await?;
        let guests: Vec<GuestData> =
            serde_json::from_slice(&raw).map_err(|e| GuestDirectoryError::Invalid(e.to_string()))?;
        tracing::info!(path = %path.as_ref().display(), count = guests.len(), "guest list loaded");
        Self::from_guests(guests)
    }

    /// Insert or replace a guest, stamping a fresh `last_modified`.
    ///
    /// The stamp is strictly later than the previous one for the same id,
    /// so an update is always seen as a change.
    pub fn upsert(&self, mut guest: GuestData) -> GuestData {
        let mut guests = self.guests.write().expect("lock poisoned");
        let mut stamp = Utc::now();
        if let Some(previous) = guests.get(&guest.id) {
            if stamp <= previous.last_modified {
                stamp = previous.last_modified + Duration::microseconds(1);
            }
        }
        guest.last_modified = stamp;
        guests.insert(guest.id.clone(), guest.clone());
        guest
    }

    pub fn remove(&self, id: &GuestId) -> Option<GuestData> {
        self.guests.write().expect("lock poisoned").remove(id)
    }

    pub fn len(&self) -> usize {
        self.guests.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.guests.read().expect("lock poisoned").is_empty()
    }
}

#[async_trait]
impl GuestDirectory for InMemoryGuestDirectory {
    async fn get_guest(&self, id: &GuestId) -> Result<Option<GuestData>, GuestDirectoryError> {
        Ok(self.guests.read().expect("lock poisoned").get(id).cloned())
    }
}
