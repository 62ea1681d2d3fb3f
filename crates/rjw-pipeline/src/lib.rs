//! Document generation for guest groups.
//!
//! [`DocumentPipeline::generate`] takes a guest and a document type through
//! the record lifecycle:
//!
//! ```text
//! guest ──> allocate version ──> render ──> hash ──> put asset
//!                                                        │
//!                     DocumentRef <── commit <── mark_stored
//! ```
//!
//! Storage keys are derived from `(guest, type, version, hash)`, so a key is
//! never written with two different contents and retries are safe. Any step
//! failure marks the record failed before the error reaches the caller.
//! [`Reconciler`] finishes whatever a crash interrupted.
//!
//! # Collaborators
//!
//! - [`GuestDirectory`] -- where guest data comes from
//! - [`Renderer`] -- turns guest data into bytes (see `rjw-render` for PDF)
//! - [`rjw_assets::AssetStore`] and [`rjw_records::DocumentRecordStore`]

pub mod config;
pub mod error;
pub mod guests;
pub mod pipeline;
pub mod reconcile;
pub mod render;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{PipelineConfig, RetryPolicy};
pub use error::{ErrorKind, PipelineError, PipelineResult, Stage, StageFailure};
pub use guests::{GuestDirectory, GuestDirectoryError, InMemoryGuestDirectory};
pub use pipeline::DocumentPipeline;
pub use reconcile::{ReconcileReport, Reconciler};
pub use render::{RenderError, Renderer};
