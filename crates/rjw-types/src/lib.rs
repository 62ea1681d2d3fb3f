//! Foundation types for the wedding document service.
//!
//! Every other `rjw-*` crate depends on `rjw-types`. The types here carry no
//! I/O; they only encode identity and the rules that keep storage keys
//! collision-free.
//!
//! # Key Types
//!
//! - [`GuestId`] — a guest group's access code, validated to be key-safe
//! - [`RecordId`] — UUID v7 identifier of a document record
//! - [`DocumentType`] — which kind of document is generated for a guest
//! - [`ContentHash`] — BLAKE3 digest of generated document bytes
//! - [`StorageKey`] — `{guestId}/{documentType}/{version}-{hashPrefix}`
//! - [`GuestData`] — the guest-group attributes documents are rendered from
//! - [`DocumentRef`] — what callers receive once a document is committed

pub mod document;
pub mod error;
pub mod guest;
pub mod ids;

pub use document::{ContentHash, DocumentRef, DocumentType, StorageKey};
pub use error::TypeError;
pub use guest::{Attendance, GuestData};
pub use ids::{GuestId, RecordId};
