use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
/// Reports service version, broker reachability and which collaborators are active.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let broker_available = state.monitor.is_available();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "cv-analyzer",
        "broker_available": broker_available,
        "dispatch_mode": if broker_available { "queued" } else { "inline" },
        "remote_storage": state.artifacts.remote_enabled(),
        "analyzer": state.analyzer.backend(),
    }))
}
