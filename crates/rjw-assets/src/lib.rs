//! Durable storage of generated document bytes.
//!
//! An asset store is a flat key-value namespace shared by every pipeline
//! instance. Keys embed the document version and a content-hash prefix, so
//! a key is written at most once with one content.
//!
//! # Storage Backends
//!
//! All backends implement the [`AssetStore`] trait:
//!
//! - [`InMemoryAssetStore`] -- `HashMap`-based store for tests and embedding
//! - [`FsAssetStore`] -- directory tree with a JSON sidecar per asset
//!
//! # Design Rules
//!
//! 1. `put` is safe to retry: same key with the same hash is a no-op.
//! 2. Same key with a different hash is a [`AssetError::Conflict`], never an
//!    overwrite.
//! 3. `head` answers existence and hash without transferring the bytes.
//! 4. `get` re-verifies the bytes against the recorded hash.
//! 5. There is no cache in front of a backend; reads always hit the store.

pub mod error;
pub mod fs;
pub mod memory;
pub mod traits;

pub use error::{AssetError, AssetResult};
pub use fs::FsAssetStore;
pub use memory::InMemoryAssetStore;
pub use traits::{AssetMeta, AssetStore, StoredRef};
