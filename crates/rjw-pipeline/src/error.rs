use std::fmt;
use std::time::Duration;

use rjw_assets::AssetError;
use rjw_records::RecordError;
use rjw_types::{DocumentType, GuestId, RecordId};

use crate::guests::GuestDirectoryError;
use crate::render::RenderError;

/// The step of a generation that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Allocate,
    Render,
    Upload,
    MarkStored,
    Commit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allocate => "allocate",
            Self::Render => "render",
            Self::Upload => "upload",
            Self::MarkStored => "mark_stored",
            Self::Commit => "commit",
        })
    }
}

/// What went wrong inside a stage.
#[derive(Debug, thiserror::Error)]
pub enum StageFailure {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Record(#[from] RecordError),

    /// A store call did not answer in time; its outcome is unknown.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Coarse error classes callers act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or template. Not retried.
    Render,
    /// Transient storage fault, retried up to a bound.
    Storage,
    /// Key collision with differing content.
    Conflict,
    /// Illegal state transition or a generation already running.
    InvalidState,
    /// Missing guest, record, or asset.
    NotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Render => "render",
            Self::Storage => "storage",
            Self::Conflict => "conflict",
            Self::InvalidState => "invalid_state",
            Self::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by [`DocumentPipeline`](crate::DocumentPipeline).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("guest not found: {0}")]
    GuestNotFound(GuestId),

    #[error("guest directory error: {0}")]
    Directory(#[from] GuestDirectoryError),

    /// Another request is generating this document and did not finish
    /// within the wait bound.
    #[error("{document_type} for {guest_id} still in flight as {record_id} after {waited:?}")]
    InFlight {
        guest_id: GuestId,
        document_type: DocumentType,
        record_id: RecordId,
        waited: Duration,
    },

    /// A generation step failed. The record, if one was allocated, has been
    /// marked failed.
    #[error("{stage} failed for {document_type} of {guest_id}{}: {source}", version_suffix(.version))]
    Stage {
        stage: Stage,
        guest_id: GuestId,
        document_type: DocumentType,
        version: Option<u64>,
        #[source]
        source: StageFailure,
    },

    /// The generation task ended without an outcome. The record stays
    /// non-terminal until reconciliation resolves it.
    #[error("generation of {document_type} for {guest_id} aborted: {reason}")]
    Aborted {
        guest_id: GuestId,
        document_type: DocumentType,
        reason: String,
    },

    /// Asset read outside a generation.
    #[error("asset store error: {0}")]
    Asset(#[from] AssetError),

    /// Record read outside a generation.
    #[error("record store error: {0}")]
    Record(#[from] RecordError),
}

fn version_suffix(version: &Option<u64>) -> String {
    version.map(|v| format!(" v{v}")).unwrap_or_default()
}

impl PipelineError {
    /// Map to the coarse class the API layer turns into a status code.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::GuestNotFound(_) => ErrorKind::NotFound,
            Self::Directory(GuestDirectoryError::Invalid(_)) => ErrorKind::InvalidState,
            Self::Directory(_) => ErrorKind::Storage,
            Self::InFlight { .. } => ErrorKind::InvalidState,
            Self::Stage { source, .. } => match source {
                StageFailure::Render(_) => ErrorKind::Render,
                StageFailure::Asset(e) => asset_kind(e),
                StageFailure::Record(e) => record_kind(e),
                StageFailure::Timeout(_) => ErrorKind::Storage,
            },
            Self::Aborted { .. } => ErrorKind::Storage,
            Self::Asset(e) => asset_kind(e),
            Self::Record(e) => record_kind(e),
        }
    }

    /// Whether the same request may succeed if issued again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::GuestNotFound(_) => false,
            Self::Directory(e) => !matches!(e, GuestDirectoryError::Invalid(_)),
            Self::InFlight { .. } => true,
            Self::Stage { source, .. } => match source {
                StageFailure::Render(_) => false,
                StageFailure::Asset(e) => e.is_transient(),
                StageFailure::Record(e) => {
                    e.is_transient() || matches!(e, RecordError::AssetMissing { .. })
                }
                StageFailure::Timeout(_) => true,
            },
            Self::Aborted { .. } => true,
            Self::Asset(e) => e.is_transient(),
            Self::Record(e) => e.is_transient(),
        }
    }

    pub(crate) fn stage(
        stage: Stage,
        guest_id: &GuestId,
        document_type: DocumentType,
        version: Option<u64>,
        source: impl Into<StageFailure>,
    ) -> Self {
        Self::Stage {
            stage,
            guest_id: guest_id.clone(),
            document_type,
            version,
            source: source.into(),
        }
    }
}

fn asset_kind(e: &AssetError) -> ErrorKind {
    match e {
        AssetError::NotFound(_) => ErrorKind::NotFound,
        AssetError::Conflict { .. } | AssetError::HashMismatch { .. } | AssetError::InvalidKey(_) => {
            ErrorKind::Conflict
        }
        AssetError::Corrupt { .. }
        | AssetError::Unavailable(_)
        | AssetError::Io(_)
        | AssetError::Serialization(_) => ErrorKind::Storage,
    }
}

fn record_kind(e: &RecordError) -> ErrorKind {
    match e {
        RecordError::NotFound(_) => ErrorKind::NotFound,
        RecordError::InvalidState { .. } | RecordError::InFlight { .. } => ErrorKind::InvalidState,
        RecordError::VersionConflict { .. } | RecordError::HashMismatch { .. } => ErrorKind::Conflict,
        RecordError::Asset(inner) => asset_kind(inner),
        RecordError::AssetMissing { .. }
        | RecordError::Unavailable(_)
        | RecordError::Serialization(_)
        | RecordError::Corrupt { .. }
        | RecordError::Io(_) => ErrorKind::Storage,
    }
}

/// Convenience type alias for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
