use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use rjw_pipeline::{ErrorKind, PipelineError};
use serde_json::json;
use thiserror::Error;

/// Errors starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("asset store error: {0}")]
    Asset(#[from] rjw_assets::AssetError),

    #[error("record store error: {0}")]
    Record(#[from] rjw_records::RecordError),

    #[error("guest directory error: {0}")]
    Guests(#[from] rjw_pipeline::GuestDirectoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Errors a handler turns into an HTTP response.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, ErrorKind::NotFound.as_str()),
            Self::Pipeline(e) => {
                let kind = e.kind();
                let status = match kind {
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::Render => StatusCode::UNPROCESSABLE_ENTITY,
                    ErrorKind::InvalidState => StatusCode::CONFLICT,
                    ErrorKind::Conflict => StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorKind::Storage => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, kind.as_str())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status.is_server_error() {
            tracing::error!(%status, error = %self, "request failed");
        } else {
            tracing::debug!(%status, error = %self, "request rejected");
        }
        let body = Json(json!({ "error": kind, "detail": self.to_string() }));
        (status, body).into_response()
    }
}
