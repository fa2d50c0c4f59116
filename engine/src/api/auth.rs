use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::error::ApiError;
use super::state::ApiState;

// ---------------------------------------------------------------------------
// Bearer tokens
// ---------------------------------------------------------------------------

/// Authenticated caller, extracted from the `Authorization: Bearer` header.
///
/// Tokens are `b64(user_id:expiry) . b64(hmac-sha256(secret, payload))`.
/// Handlers compare `user_id` against the owner of whatever they touch.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

pub fn issue_token(secret: &str, user_id: &str, ttl_secs: i64) -> String {
    let expiry = Utc::now().timestamp() + ttl_secs;
    let payload = B64.encode(format!("{user_id}:{expiry}"));
    let signature = B64.encode(sign(secret, &payload));
    format!("{payload}.{signature}")
}

pub fn verify_token(secret: &str, token: &str) -> Result<String, ApiError> {
    let (payload, signature) = token
        .split_once('.')
        .ok_or_else(|| ApiError::Unauthorized("malformed token".into()))?;

    // Verified through the Mac API so the tag comparison is constant-time.
    let provided = B64
        .decode(signature)
        .map_err(|_| ApiError::Unauthorized("malformed token signature".into()))?;
    let mut mac = mac(secret);
    mac.update(payload.as_bytes());
    if mac.verify_slice(&provided).is_err() {
        return Err(ApiError::Unauthorized("invalid token signature".into()));
    }

    let decoded = B64
        .decode(payload)
        .map_err(|_| ApiError::Unauthorized("malformed token payload".into()))?;
    let decoded =
        String::from_utf8(decoded).map_err(|_| ApiError::Unauthorized("malformed token payload".into()))?;
    let (user_id, expiry) = decoded
        .rsplit_once(':')
        .ok_or_else(|| ApiError::Unauthorized("malformed token payload".into()))?;
    let expiry: i64 = expiry
        .parse()
        .map_err(|_| ApiError::Unauthorized("malformed token expiry".into()))?;

    if Utc::now().timestamp() >= expiry {
        return Err(ApiError::Unauthorized("token expired".into()));
    }
    Ok(user_id.to_string())
}

fn mac(secret: &str) -> Hmac<Sha256> {
    Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length")
}

fn sign(secret: &str, payload: &str) -> Vec<u8> {
    let mut mac = mac(secret);
    mac.update(payload.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

impl FromRequestParts<Arc<ApiState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;

        let user_id = verify_token(&state.config.jwt_secret, token)?;
        Ok(AuthUser { user_id })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_then_verify_roundtrip() {
        let token = issue_token("secret", "user-1", 3600);
        let user_id = verify_token("secret", &token).unwrap();
        assert_eq!(user_id, "user-1");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_token("secret", "user-1", 3600);
        assert!(verify_token("other-secret", &token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = issue_token("secret", "user-1", -1);
        assert!(verify_token("secret", &token).is_err());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let token = issue_token("secret", "user-1", 3600);
        let (_, signature) = token.split_once('.').unwrap();
        let forged_payload = B64.encode("user-2:9999999999");
        let forged = format!("{forged_payload}.{signature}");
        assert!(verify_token("secret", &forged).is_err());
    }

    #[test]
    fn test_user_ids_containing_colons_survive() {
        let token = issue_token("secret", "org:7:user:42", 3600);
        assert_eq!(verify_token("secret", &token).unwrap(), "org:7:user:42");
    }
}
