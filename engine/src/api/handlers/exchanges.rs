use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use mongodb::bson::doc;
use serde::Deserialize;
use serde_json::json;

use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::api::response::{success, Envelope};
use crate::api::state::ApiState;
use crate::vault::Credential;

#[derive(Deserialize)]
pub struct LinkRequest {
    exchange_id: String,
    api_key: String,
    api_secret: String,
    #[serde(default)]
    passphrase: Option<String>,
}

pub async fn link(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Json(req): Json<LinkRequest>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    if req.api_key.trim().is_empty() || req.api_secret.trim().is_empty() {
        return Err(ApiError::validation("api_key and api_secret are required"));
    }

    let info = state
        .mongo
        .exchanges()
        .find_one(doc! { "_id": &req.exchange_id })
        .await?
        .ok_or_else(|| ApiError::validation(format!("unknown exchange: {}", req.exchange_id)))?;

    state
        .vault
        .link(
            &auth.user_id,
            &req.exchange_id,
            info.kind,
            Credential {
                api_key: req.api_key,
                api_secret: req.api_secret,
                passphrase: req.passphrase,
            },
        )
        .await?;

    Ok(success(
        "Exchange linked",
        json!({ "exchange_id": req.exchange_id, "exchange_name": info.name }),
    ))
}

#[derive(Deserialize)]
pub struct ExchangeRef {
    exchange_id: String,
}

pub async fn unlink(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Json(req): Json<ExchangeRef>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let removed = state.vault.unlink(&auth.user_id, &req.exchange_id).await?;
    if !removed {
        return Err(ApiError::NotFound(format!(
            "exchange not linked: {}",
            req.exchange_id
        )));
    }
    Ok(success("Exchange unlinked", json!({ "exchange_id": req.exchange_id })))
}

pub async fn disconnect(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Json(req): Json<ExchangeRef>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let changed = state.vault.disconnect(&auth.user_id, &req.exchange_id).await?;
    if !changed {
        return Err(ApiError::NotFound(format!(
            "exchange not linked: {}",
            req.exchange_id
        )));
    }
    Ok(success(
        "Exchange disconnected",
        json!({ "exchange_id": req.exchange_id, "is_active": false }),
    ))
}

pub async fn connect(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Json(req): Json<ExchangeRef>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let changed = state.vault.connect(&auth.user_id, &req.exchange_id).await?;
    if !changed {
        return Err(ApiError::NotFound(format!(
            "exchange not linked: {}",
            req.exchange_id
        )));
    }
    Ok(success(
        "Exchange reconnected",
        json!({ "exchange_id": req.exchange_id, "is_active": true }),
    ))
}

/// Full teardown: drops the link plus every strategy and position tied to
/// the exchange for this user.
pub async fn delete_exchange(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Json(req): Json<ExchangeRef>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let removed = state.vault.unlink(&auth.user_id, &req.exchange_id).await?;
    if !removed {
        return Err(ApiError::NotFound(format!(
            "exchange not linked: {}",
            req.exchange_id
        )));
    }

    let strategies_deleted = state
        .store
        .delete_for_exchange(&auth.user_id, &req.exchange_id)
        .await?;
    let positions_deleted = state
        .ledger
        .delete_for_exchange(&auth.user_id, &req.exchange_id)
        .await?;

    tracing::info!(
        user_id = %auth.user_id,
        exchange_id = %req.exchange_id,
        strategies_deleted,
        positions_deleted,
        "exchange_data_deleted"
    );
    Ok(success(
        "Exchange deleted",
        json!({
            "exchange_id": req.exchange_id,
            "strategies_deleted": strategies_deleted,
            "positions_deleted": positions_deleted,
        }),
    ))
}
