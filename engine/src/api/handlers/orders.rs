use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::api::response::{success, Envelope};
use crate::api::state::ApiState;
use crate::gateway::OrderSide;
use crate::worker::orchestrator::{self, ManualOrderError};

#[derive(Deserialize)]
pub struct ManualOrderRequest {
    exchange_id: String,
    token: String,
    amount: f64,
}

pub async fn buy(
    state: State<Arc<ApiState>>,
    auth: AuthUser,
    req: Json<ManualOrderRequest>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    place(state, auth, req, OrderSide::Buy).await
}

pub async fn sell(
    state: State<Arc<ApiState>>,
    auth: AuthUser,
    req: Json<ManualOrderRequest>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    place(state, auth, req, OrderSide::Sell).await
}

async fn place(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Json(req): Json<ManualOrderRequest>,
    side: OrderSide,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    if req.amount <= 0.0 {
        return Err(ApiError::validation("amount must be positive"));
    }
    if req.token.trim().is_empty() {
        return Err(ApiError::validation("token is required"));
    }

    let result = orchestrator::manual_order(
        &state.worker,
        &auth.user_id,
        &req.exchange_id,
        &req.token,
        side,
        req.amount,
    )
    .await
    .map_err(|e| match e {
        ManualOrderError::Rejected(m) => ApiError::validation(m),
        ManualOrderError::Upstream(m) => ApiError::Upstream(m),
    })?;

    Ok(success(
        "Order executed",
        json!({
            "order": result.order,
            "realized_pnl_usd": result.realized_pnl,
            "dry_run": state.registry.dry_run(),
        }),
    ))
}
