use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use super::response::failure;
use crate::ledger::LedgerError;
use crate::strategy::store::StoreError;
use crate::vault::VaultError;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    Forbidden(String),
    Validation {
        message: String,
        details: Option<Value>,
    },
    NotFound(String),
    Conflict(String),
    #[allow(dead_code)]
    RateLimited(String),
    Upstream(String),
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message, details) = match self {
            Self::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "unauthorized", m, None),
            Self::Forbidden(m) => (StatusCode::FORBIDDEN, "unauthorized", m, None),
            Self::Validation { message, details } => {
                (StatusCode::BAD_REQUEST, "validation_error", message, details)
            }
            Self::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m, None),
            Self::Conflict(m) => (StatusCode::CONFLICT, "conflict", m, None),
            Self::RateLimited(m) => (StatusCode::TOO_MANY_REQUESTS, "rate_limited", m, None),
            Self::Upstream(m) => (StatusCode::BAD_GATEWAY, "upstream_error", m, None),
            Self::Internal(m) => {
                tracing::error!(error = %m, "api_internal_error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "server_error",
                    "internal server error".to_string(),
                    None,
                )
            }
        };
        failure(status, kind, &message, details).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<mongodb::error::Error> for ApiError {
    fn from(e: mongodb::error::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::NotFound("strategy not found".into()),
            StoreError::Duplicate => Self::Conflict(e.to_string()),
            StoreError::Db(db) => Self::Internal(db.to_string()),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound { .. } => Self::NotFound(e.to_string()),
            LedgerError::InsufficientPosition { .. } => Self::validation(e.to_string()),
            LedgerError::Conflict => Self::Conflict(e.to_string()),
            LedgerError::Db(db) => Self::Internal(db.to_string()),
        }
    }
}

impl From<VaultError> for ApiError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::NotLinked | VaultError::Disabled => Self::NotFound(e.to_string()),
            VaultError::Db(db) => Self::Internal(db.to_string()),
        }
    }
}
