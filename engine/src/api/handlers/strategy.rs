use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::parse_object_id;
use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::api::response::{created, success, Envelope};
use crate::api::state::ApiState;
use crate::strategy::evaluator::{self, EvalInput, MarketData};
use crate::strategy::rules::Rules;
use crate::strategy::{Strategy, Tracking};

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StrategyView {
    id: String,
    user_id: String,
    exchange_id: String,
    token: String,
    rules: Rules,
    is_active: bool,
    needs_repair: bool,
    tracking: Tracking,
    last_checked_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl From<Strategy> for StrategyView {
    fn from(s: Strategy) -> Self {
        Self {
            id: s.id.map(|id| id.to_hex()).unwrap_or_default(),
            user_id: s.user_id,
            exchange_id: s.exchange_id,
            token: s.token,
            rules: s.rules,
            is_active: s.is_active,
            needs_repair: s.needs_repair,
            tracking: s.tracking,
            last_checked_at: s.last_checked_at,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Rules resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RulesSource {
    #[serde(default)]
    rules: Option<serde_json::Value>,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    take_profit_percent: Option<f64>,
    #[serde(default)]
    stop_loss_percent: Option<f64>,
    #[serde(default)]
    buy_dip_percent: Option<f64>,
}

impl RulesSource {
    fn is_empty(&self) -> bool {
        self.rules.is_none()
            && self.template.is_none()
            && self.take_profit_percent.is_none()
            && self.stop_loss_percent.is_none()
            && self.buy_dip_percent.is_none()
    }

    /// Template wins over the legacy flat form, which wins over a full
    /// structured rules document.
    fn resolve(&self) -> Result<Rules, ApiError> {
        let rules = if let Some(template) = &self.template {
            Rules::template(template).ok_or_else(|| {
                ApiError::validation(format!(
                    "unknown template: {template} (use simple, conservative or aggressive)"
                ))
            })?
        } else if self.take_profit_percent.is_some()
            || self.stop_loss_percent.is_some()
            || self.buy_dip_percent.is_some()
        {
            Rules::from_legacy(
                self.take_profit_percent,
                self.stop_loss_percent,
                self.buy_dip_percent,
            )
        } else if let Some(raw) = &self.rules {
            serde_json::from_value(raw.clone())
                .map_err(|e| ApiError::validation(format!("malformed rules: {e}")))?
        } else {
            return Err(ApiError::validation(
                "one of rules, template, or the legacy percent fields is required",
            ));
        };

        rules.validate().map_err(|issues| ApiError::Validation {
            message: "rule validation failed".into(),
            details: Some(json!({ "fields": issues })),
        })?;
        Ok(rules)
    }
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateStrategyRequest {
    #[serde(default)]
    user_id: Option<String>,
    exchange_id: String,
    token: String,
    #[serde(flatten)]
    rules: RulesSource,
    #[serde(default)]
    is_active: Option<bool>,
}

pub async fn create(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Json(req): Json<CreateStrategyRequest>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    if let Some(body_user) = &req.user_id {
        if body_user != &auth.user_id {
            return Err(ApiError::Forbidden("token subject does not own this resource".into()));
        }
    }
    if req.token.trim().is_empty() {
        return Err(ApiError::validation("token is required"));
    }
    if !state.mongo.exchange_exists(&req.exchange_id).await? {
        return Err(ApiError::validation(format!(
            "unknown exchange: {}",
            req.exchange_id
        )));
    }

    let rules = req.rules.resolve()?;
    let strategy = state
        .store
        .create(
            &auth.user_id,
            &req.exchange_id,
            &req.token,
            rules,
            req.is_active.unwrap_or(true),
        )
        .await?;

    Ok(created("Strategy created", StrategyView::from(strategy)))
}

// ---------------------------------------------------------------------------
// List / Get
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ListQuery {
    user_id: String,
    #[serde(default)]
    exchange_id: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    is_active: Option<bool>,
}

pub async fn list(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    if query.user_id != auth.user_id {
        return Err(ApiError::Forbidden("token subject does not own this resource".into()));
    }

    let strategies = state
        .store
        .list(
            &auth.user_id,
            query.exchange_id.as_deref(),
            query.token.as_deref(),
            query.is_active,
        )
        .await?;
    let views: Vec<StrategyView> = strategies.into_iter().map(StrategyView::from).collect();
    Ok(success("Strategies retrieved", views))
}

pub async fn get_one(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let strategy = load_owned(&state, &auth, &id).await?;
    Ok(success("Strategy retrieved", StrategyView::from(strategy)))
}

// ---------------------------------------------------------------------------
// Update / Delete
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct UpdateStrategyRequest {
    #[serde(flatten)]
    rules: RulesSource,
    #[serde(default)]
    is_active: Option<bool>,
}

pub async fn update(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateStrategyRequest>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let existing = load_owned(&state, &auth, &id).await?;
    let object_id = existing
        .id
        .ok_or_else(|| ApiError::Internal("strategy document without _id".into()))?;

    let rules = if req.rules.is_empty() {
        existing.rules
    } else {
        req.rules.resolve()?
    };
    let updated = state
        .store
        .update_rules(object_id, rules, req.is_active)
        .await?;
    Ok(success("Strategy updated", StrategyView::from(updated)))
}

pub async fn delete_one(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let strategy = load_owned(&state, &auth, &id).await?;
    let object_id = strategy
        .id
        .ok_or_else(|| ApiError::Internal("strategy document without _id".into()))?;
    state.store.delete(object_id).await?;
    Ok(success("Strategy deleted", json!({ "deleted": true })))
}

// ---------------------------------------------------------------------------
// Check (evaluate without executing)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CheckRequest {
    current_price: f64,
    entry_price: f64,
}

pub async fn check(
    State(state): State<Arc<ApiState>>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<CheckRequest>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let strategy = load_owned(&state, &auth, &id).await?;

    let holding_amount = state
        .ledger
        .get(&strategy.user_id, &strategy.exchange_id, &strategy.token)
        .await?
        .map(|p| p.amount)
        .unwrap_or(0.0);

    let input = EvalInput {
        rules: &strategy.rules,
        tracking: &strategy.tracking,
        entry_price: req.entry_price,
        current_price: req.current_price,
        holding_amount,
        market: MarketData::default(),
    };
    let evaluation = evaluator::evaluate(&input, Utc::now());

    Ok(success(
        "Strategy checked",
        json!({
            "decision": evaluation.decision,
            "pause_requested": evaluation.pause_requested,
            "needs_repair": evaluation.needs_repair,
        }),
    ))
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

async fn load_owned(
    state: &Arc<ApiState>,
    auth: &AuthUser,
    raw_id: &str,
) -> Result<Strategy, ApiError> {
    let id = parse_object_id(raw_id)?;
    let strategy = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("strategy not found: {raw_id}")))?;
    if strategy.user_id != auth.user_id {
        return Err(ApiError::Forbidden("token subject does not own this resource".into()));
    }
    Ok(strategy)
}
