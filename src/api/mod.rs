//! HTTP surface.
//!
//! Every route except `/health` requires a bearer token. Handlers are thin:
//! they authenticate, translate the request into a pipeline or store call,
//! and shape the JSON response. Failures flow through [`error::ApiError`].

pub mod admin;
pub mod auth;
pub mod documents;
pub mod error;
pub mod state;
pub mod upload;
pub mod usage;

pub use state::AppState;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes;

    let api = Router::new()
        .route("/upload", post(upload::upload))
        .route("/process-full-document", post(upload::process_full_document))
        .route("/documents", get(documents::list_documents))
        .route("/get-document/{doc_id}", get(documents::get_document))
        .route("/document-filter", post(documents::filter_documents))
        .route("/usage-stats", get(usage::usage_stats))
        .route("/admin/user-report", get(admin::user_report))
        .route("/admin/manage-user", post(admin::manage_user));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
