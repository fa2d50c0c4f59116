use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use futures::stream::TryStreamExt;
use mongodb::bson::doc;
use serde::Deserialize;

use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::api::response::{success, Envelope};
use crate::api::state::ApiState;
use crate::worker::snapshot::BalanceSnapshot;

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_days")]
    days: i64,
}

fn default_days() -> i64 {
    7
}

pub async fn history(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let days = query.days.clamp(1, 365);
    let since = Utc::now().timestamp() - days * 86_400;

    let cursor = state
        .mongo
        .balance_history()
        .find(doc! { "user_id": &auth.user_id, "timestamp": { "$gte": since } })
        .sort(doc! { "timestamp": -1 })
        .await?;
    let snapshots: Vec<BalanceSnapshot> = cursor.try_collect().await?;

    Ok(success("Balance history retrieved", snapshots))
}
