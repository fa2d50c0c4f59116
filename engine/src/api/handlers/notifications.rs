use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use mongodb::bson::oid::ObjectId;
use serde::Deserialize;
use serde_json::json;

use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::api::response::{success, Envelope};
use crate::api::state::ApiState;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    unread_only: bool,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let limit = query.limit.clamp(1, 200);
    let notifications = state
        .notifier
        .list(&auth.user_id, query.unread_only, limit)
        .await?;

    let views: Vec<serde_json::Value> = notifications
        .into_iter()
        .map(|n| {
            json!({
                "id": n.id.map(|id| id.to_hex()).unwrap_or_default(),
                "kind": n.kind,
                "title": n.title,
                "body": n.body,
                "is_read": n.is_read,
                "created_at": n.created_at,
            })
        })
        .collect();
    Ok(success("Notifications retrieved", views))
}

#[derive(Deserialize)]
pub struct MarkReadRequest {
    ids: Vec<String>,
}

pub async fn mark_read(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Json(req): Json<MarkReadRequest>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let ids: Result<Vec<ObjectId>, _> = req.ids.iter().map(|raw| raw.parse()).collect();
    let ids = ids.map_err(|_| ApiError::validation("invalid notification id"))?;

    let marked = state.notifier.mark_read(&auth.user_id, &ids).await?;
    Ok(success("Notifications marked read", json!({ "marked": marked })))
}
