pub mod binance;
pub mod coinbase;
pub mod dry_run;
pub mod rate_limit;
pub mod registry;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// GatewayError
// ---------------------------------------------------------------------------

/// Typed failure surface of every gateway call.
///
/// `Transient` covers anything worth retrying inside the current tick
/// (timeouts, rate limits, upstream 5xx). Everything else is terminal for
/// this call and mapped to a disposition by the caller.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transient upstream error: {0}")]
    Transient(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        // Connect/timeout/decode problems are all retryable from the
        // engine's point of view; auth is signalled by status codes and
        // handled where the response is inspected.
        Self::Transient(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume_24h: Option<f64>,
    pub change_24h: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
}

impl AssetBalance {
    pub fn total(&self) -> f64 {
        self.free + self.locked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Market,
    Limit,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    /// Base asset symbol (e.g. `BTC`); each adapter maps it to its own
    /// native pair notation.
    pub token: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    /// Base-asset quantity.
    pub amount: f64,
    /// Required for limit orders, ignored for market orders.
    pub price: Option<f64>,
    /// Engine-side idempotency key, forwarded as the exchange's
    /// client-order-id where supported.
    pub client_order_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    Filled,
    PartiallyFilled,
    Canceled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub exchange_order_id: String,
    pub status: OrderStatus,
    pub filled: f64,
    pub remaining: f64,
    pub average_fill_price: Option<f64>,
    pub fee: Option<f64>,
}

// ---------------------------------------------------------------------------
// ExchangeGateway
// ---------------------------------------------------------------------------

/// Uniform capability set over all supported exchanges.
///
/// An instance is bound to one user's credentials on one exchange; callers
/// obtain instances from the registry and never branch on exchange
/// identity.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn fetch_balances(&self) -> Result<Vec<AssetBalance>, GatewayError>;
    async fn fetch_ticker(&self, token: &str) -> Result<Ticker, GatewayError>;
    async fn fetch_order(&self, token: &str, order_id: &str) -> Result<ExchangeOrder, GatewayError>;
    async fn create_order(&self, req: &OrderRequest) -> Result<ExchangeOrder, GatewayError>;
    async fn cancel_order(&self, token: &str, order_id: &str) -> Result<(), GatewayError>;
}

// ---------------------------------------------------------------------------
// Retry helper
// ---------------------------------------------------------------------------

const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const RETRY_MAX_ATTEMPTS: u32 = 4;

/// Retries a gateway call on transient failures with exponential backoff.
///
/// The overall tick deadline is enforced by the caller via
/// `tokio::time::timeout`; this helper only bounds the number of attempts.
/// Never used for `create_order`: submission retries are suppressed and
/// resolved by the next tick (the client-order-id dedups where supported).
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, GatewayError>>,
{
    let mut backoff = RETRY_INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < RETRY_MAX_ATTEMPTS => {
                tracing::debug!(attempt, error = %e, "gateway_retry");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
