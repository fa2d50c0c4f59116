use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::api::response::{success, Envelope};
use crate::api::state::ApiState;
use crate::worker::JobKind;

pub async fn status(
    State(state): State<Arc<ApiState>>,
    _auth: AuthUser,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    Ok(success(
        "Job status",
        json!({
            "strategy_worker": state.jobs.strategy_worker.status(),
            "balance_snapshot": state.jobs.balance_snapshot.status(),
            "dry_run": state.registry.dry_run(),
            "check_interval_minutes": state.config.check_interval_minutes,
            "snapshot_interval_hours": state.config.snapshot_interval_hours,
        }),
    ))
}

#[derive(Deserialize)]
pub struct ControlRequest {
    job: String,
    action: String,
}

pub async fn control(
    State(state): State<Arc<ApiState>>,
    _auth: AuthUser,
    Json(req): Json<ControlRequest>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let kind: JobKind = req.job.parse().map_err(ApiError::validation)?;
    let ctl = state.jobs.get(kind);

    match req.action.as_str() {
        "start" => ctl.start(),
        "stop" => ctl.stop(),
        "restart" => ctl.restart(),
        other => {
            return Err(ApiError::validation(format!(
                "unknown action: {other} (use start, stop or restart)"
            )))
        }
    }

    tracing::info!(job = kind.name(), action = %req.action, "job_control_applied");
    Ok(success(
        "Job control applied",
        json!({ "job": kind.name(), "status": ctl.status() }),
    ))
}

pub async fn trigger(
    State(state): State<Arc<ApiState>>,
    _auth: AuthUser,
    Path(job): Path<String>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let kind: JobKind = job.parse().map_err(ApiError::validation)?;
    state.jobs.get(kind).trigger_now();
    tracing::info!(job = kind.name(), "job_triggered_manually");
    Ok(success("Job triggered", json!({ "job": kind.name() })))
}
