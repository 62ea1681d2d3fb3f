//! PDF rendering for guest documents.
//!
//! [`PdfRenderer`] implements [`rjw_pipeline::Renderer`] with plain text
//! laid out on an A5 page in Helvetica.

pub mod pdf;

pub use pdf::{PdfRenderer, ScheduleItem};
