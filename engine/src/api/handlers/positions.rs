use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::parse_object_id;
use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::api::response::{success, Envelope};
use crate::api::state::ApiState;
use crate::ledger::Position;

#[derive(Serialize)]
struct PositionView {
    id: String,
    user_id: String,
    exchange_id: String,
    token: String,
    amount: f64,
    entry_price: f64,
    total_invested: f64,
    is_active: bool,
    purchases_count: usize,
    sales_count: usize,
    created_at: i64,
    updated_at: i64,
}

impl From<Position> for PositionView {
    fn from(p: Position) -> Self {
        Self {
            id: p.id.map(|id| id.to_hex()).unwrap_or_default(),
            user_id: p.user_id,
            exchange_id: p.exchange_id,
            token: p.token,
            amount: p.amount,
            entry_price: p.entry_price,
            total_invested: p.total_invested,
            is_active: p.is_active,
            purchases_count: p.purchases.len(),
            sales_count: p.sales.len(),
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    exchange_id: Option<String>,
    #[serde(default = "default_active_only")]
    active_only: bool,
}

fn default_active_only() -> bool {
    true
}

pub async fn list(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let positions = state
        .ledger
        .list(&auth.user_id, query.exchange_id.as_deref(), query.active_only)
        .await?;
    let views: Vec<PositionView> = positions.into_iter().map(PositionView::from).collect();
    Ok(success("Positions retrieved", views))
}

pub async fn get_one(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let object_id = parse_object_id(&id)?;
    let position = state
        .ledger
        .get_by_id(object_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("position not found: {id}")))?;
    if position.user_id != auth.user_id {
        return Err(ApiError::Forbidden("token subject does not own this resource".into()));
    }
    Ok(success("Position retrieved", PositionView::from(position)))
}

#[derive(Deserialize, Default)]
pub struct SyncRequest {
    #[serde(default)]
    exchange_id: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

pub async fn sync(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Json(req): Json<SyncRequest>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let synced = crate::ledger::sync_from_exchange(
        &state.ledger,
        &state.vault,
        &state.registry,
        &auth.user_id,
        req.exchange_id.as_deref(),
        req.token.as_deref(),
    )
    .await?;
    Ok(success("Positions synced", json!({ "synced_assets": synced })))
}
