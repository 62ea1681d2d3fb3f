//! HTTP API for the wedding document service.
//!
//! A thin axum layer over [`rjw_pipeline::DocumentPipeline`]: handlers parse
//! path parameters, call the pipeline, and map [`rjw_pipeline::ErrorKind`]
//! onto status codes. [`RjwServer`] wires the filesystem asset store, the
//! journal record store and the background reconciler together.

pub mod config;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;

pub use config::{ServerConfig, StorageConfig};
pub use error::{ApiError, ServerError, ServerResult};
pub use handler::{AppState, DocumentView};
pub use router::build_router;
pub use server::RjwServer;
