use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

/// Uniform body shared by every endpoint, success or failure.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: String,
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub fn success<T: Serialize>(message: &str, data: T) -> (StatusCode, Json<Envelope>) {
    envelope(StatusCode::OK, message, data)
}

pub fn created<T: Serialize>(message: &str, data: T) -> (StatusCode, Json<Envelope>) {
    envelope(StatusCode::CREATED, message, data)
}

fn envelope<T: Serialize>(status: StatusCode, message: &str, data: T) -> (StatusCode, Json<Envelope>) {
    (
        status,
        Json(Envelope {
            success: true,
            message: message.to_string(),
            data: serde_json::to_value(data).ok(),
            timestamp: Utc::now().to_rfc3339(),
            error: None,
        }),
    )
}

pub fn failure(
    status: StatusCode,
    kind: &str,
    message: &str,
    details: Option<Value>,
) -> (StatusCode, Json<Envelope>) {
    (
        status,
        Json(Envelope {
            success: false,
            message: message.to_string(),
            data: None,
            timestamp: Utc::now().to_rfc3339(),
            error: Some(ErrorInfo {
                kind: kind.to_string(),
                message: message.to_string(),
                details,
            }),
        }),
    )
}
