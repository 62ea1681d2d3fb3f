use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Json, Response};
use rjw_pipeline::{DocumentPipeline, Renderer};
use rjw_types::{DocumentRef, DocumentType, GuestId, StorageKey};
use serde::Serialize;
use serde_json::json;

use crate::error::ApiError;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: DocumentPipeline,
    pub renderer: Arc<dyn Renderer>,
}

impl AppState {
    pub fn new(pipeline: DocumentPipeline, renderer: Arc<dyn Renderer>) -> Self {
        Self { pipeline, renderer }
    }
}

/// A committed document and where to download it.
#[derive(Debug, Serialize)]
pub struct DocumentView {
    pub document: DocumentRef,
    /// Download path on this server.
    pub url: String,
    /// The asset store's own address.
    pub location: String,
}

impl DocumentView {
    fn new(pipeline: &DocumentPipeline, document: DocumentRef) -> Self {
        Self {
            url: format!("/v1/assets/{}", document.storage_key),
            location: pipeline.locate(&document),
            document,
        }
    }
}

fn parse_target(guest_id: &str, document_type: &str) -> Result<(GuestId, DocumentType), ApiError> {
    let guest_id = GuestId::new(guest_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let document_type = document_type
        .parse()
        .map_err(|e: rjw_types::TypeError| ApiError::BadRequest(e.to_string()))?;
    Ok((guest_id, document_type))
}

pub async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy!" }))
}

/// Generate the document, or return the current one if nothing changed.
pub async fn generate_handler(
    State(state): State<AppState>,
    Path((guest_id, document_type)): Path<(String, String)>,
) -> Result<Json<DocumentView>, ApiError> {
    let (guest_id, document_type) = parse_target(&guest_id, &document_type)?;
    let document = state
        .pipeline
        .generate(&guest_id, document_type, Arc::clone(&state.renderer))
        .await?;
    Ok(Json(DocumentView::new(&state.pipeline, document)))
}

pub async fn latest_handler(
    State(state): State<AppState>,
    Path((guest_id, document_type)): Path<(String, String)>,
) -> Result<Json<DocumentView>, ApiError> {
    let (guest_id, document_type) = parse_target(&guest_id, &document_type)?;
    let document = state
        .pipeline
        .latest(&guest_id, document_type)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no {document_type} for {guest_id}")))?;
    Ok(Json(DocumentView::new(&state.pipeline, document)))
}

pub async fn versions_handler(
    State(state): State<AppState>,
    Path((guest_id, document_type)): Path<(String, String)>,
) -> Result<Json<Vec<DocumentView>>, ApiError> {
    let (guest_id, document_type) = parse_target(&guest_id, &document_type)?;
    let documents = state.pipeline.versions(&guest_id, document_type).await?;
    Ok(Json(
        documents
            .into_iter()
            .map(|d| DocumentView::new(&state.pipeline, d))
            .collect(),
    ))
}

pub async fn version_handler(
    State(state): State<AppState>,
    Path((guest_id, document_type, version)): Path<(String, String, u64)>,
) -> Result<Json<DocumentView>, ApiError> {
    let (guest_id, document_type) = parse_target(&guest_id, &document_type)?;
    let document = state
        .pipeline
        .version(&guest_id, document_type, version)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no {document_type} v{version} for {guest_id}")))?;
    Ok(Json(DocumentView::new(&state.pipeline, document)))
}

/// Serve the bytes of a committed document.
pub async fn asset_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let key = StorageKey::parse(key).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let (document, bytes) = state
        .pipeline
        .fetch_by_key(&key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no committed document at {key}")))?;
    let disposition = format!(
        "inline; filename=\"{}-{}-v{}.pdf\"",
        document.guest_id, document.document_type, document.version
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::ETAG, format!("\"{}\"", document.content_hash)),
            (header::CACHE_CONTROL, "public, max-age=31536000, immutable".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}
