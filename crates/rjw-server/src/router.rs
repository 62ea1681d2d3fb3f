use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handler::{self, AppState};

/// Build the axum router with all document endpoints.
///
/// `frontend_url`, when set, is the one origin allowed to call the API from
/// a browser.
pub fn build_router(state: AppState, frontend_url: Option<&str>) -> Router {
    let documents = "/v1/guests/:guest_id/documents/:document_type";
    Router::new()
        .route("/health", get(handler::health_handler))
        .route(
            documents,
            get(handler::latest_handler).post(handler::generate_handler),
        )
        .route(&format!("{documents}/versions"), get(handler::versions_handler))
        .route(
            &format!("{documents}/versions/:version"),
            get(handler::version_handler),
        )
        .route("/v1/assets/*key", get(handler::asset_handler))
        .layer(cors(frontend_url))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors(frontend_url: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    match frontend_url.map(HeaderValue::from_str) {
        Some(Ok(origin)) => layer.allow_origin(origin),
        Some(Err(e)) => {
            tracing::warn!(error = %e, "ignoring invalid frontend origin");
            layer
        }
        None => layer,
    }
}
