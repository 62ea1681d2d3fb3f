//! Metadata catalog for generated documents.
//!
//! A [`DocumentRecord`] says which guest owns which document, at which
//! version, under which storage key, and how far its generation got. The
//! catalog is the only place versions are allocated and the only place a
//! document becomes visible.
//!
//! # Lifecycle
//!
//! ```text
//! create_pending ──> Pending ──mark_stored──> Stored ──commit──> Committed
//!                       │                       │
//!                       └──────mark_failed──────┴──> Failed
//! ```
//!
//! `commit` is the single linearization point: it re-checks the asset store
//! for the stored key and hash before flipping state. Readers only ever see
//! `Committed` records through [`DocumentRecordStore::latest_committed`] and
//! friends.
//!
//! # Backends
//!
//! - [`InMemoryRecordStore`] -- for tests and embedding
//! - [`JournalRecordStore`] -- durable, replays a CRC-framed journal on open

pub mod error;
pub mod journal;
pub mod memory;
pub mod record;
pub mod table;
pub mod traits;

pub use error::{RecordError, RecordResult};
pub use journal::{JournalConfig, JournalRecordStore, SyncMode};
pub use memory::InMemoryRecordStore;
pub use record::{DocumentRecord, RecordStatus};
pub use traits::DocumentRecordStore;
