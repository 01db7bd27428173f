pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::analysis::handlers;
use crate::state::AppState;

/// Room for multipart boundaries and headers on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route(
            "/api/v1/analyses",
            post(handlers::handle_upload).get(handlers::handle_history),
        )
        .route(
            "/api/v1/analyses/:id",
            get(handlers::handle_get_analysis).delete(handlers::handle_delete),
        )
        .route(
            "/api/v1/analyses/:id/optimize",
            post(handlers::handle_optimize),
        )
        .layer(DefaultBodyLimit::max(
            max_upload_bytes + MULTIPART_OVERHEAD_BYTES,
        ))
        .with_state(state)
}
