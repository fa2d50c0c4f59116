use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use crate::api::response::{success, Envelope};
use crate::api::state::ApiState;

/// Public liveness endpoint; the only route exempt from bearer auth.
pub async fn health(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<Envelope>) {
    success(
        "ok",
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": state.start_time.elapsed().as_secs(),
            "dry_run": state.registry.dry_run(),
        }),
    )
}
