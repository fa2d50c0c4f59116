use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use super::rate_limit::TokenBucket;
use super::{
    AssetBalance, ExchangeGateway, ExchangeOrder, GatewayError, OrderKind, OrderRequest,
    OrderSide, OrderStatus, Ticker,
};
use crate::vault::Credential;

const QUOTE_ASSET: &str = "USDT";

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<i64>,
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerResponse {
    bid_price: Option<String>,
    ask_price: Option<String>,
    last_price: Option<String>,
    quote_volume: Option<String>,
    price_change_percent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<RawBalance>,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    status: String,
    orig_qty: String,
    executed_qty: String,
    #[serde(default)]
    cummulative_quote_qty: Option<String>,
    #[serde(default)]
    fills: Vec<Fill>,
}

#[derive(Debug, Deserialize)]
struct Fill {
    commission: String,
}

// ---------------------------------------------------------------------------
// BinanceGateway
// ---------------------------------------------------------------------------

/// Binance spot adapter. Signed endpoints use the standard query-string
/// HMAC-SHA256 signature with the `X-MBX-APIKEY` header.
pub struct BinanceGateway {
    http: reqwest::Client,
    base_url: String,
    credential: Credential,
    limiter: Arc<TokenBucket>,
}

impl BinanceGateway {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        credential: Credential,
        limiter: Arc<TokenBucket>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
            limiter,
        }
    }

    fn spot_symbol(token: &str) -> String {
        format!("{}{}", token.to_uppercase(), QUOTE_ASSET)
    }

    /// HMAC-SHA256 over the full query string, hex-encoded.
    fn sign(&self, query: &str) -> Result<String, GatewayError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.credential.api_secret.as_bytes())
            .map_err(|e| GatewayError::Auth(format!("HMAC key rejected: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self) -> Result<HeaderMap, GatewayError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-MBX-APIKEY",
            HeaderValue::from_str(&self.credential.api_key)
                .map_err(|e| GatewayError::Auth(format!("invalid api key header: {e}")))?,
        );
        Ok(headers)
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<reqwest::Response, GatewayError> {
        self.limiter.acquire().await;

        let query = if params.is_empty() {
            format!("timestamp={}", now_millis())
        } else {
            format!("{params}&timestamp={}", now_millis())
        };
        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let resp = self
            .http
            .request(method, &url)
            .headers(self.auth_headers()?)
            .send()
            .await?;
        Ok(resp)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(map_error(status, &body))
    }
}

#[async_trait]
impl ExchangeGateway for BinanceGateway {
    async fn fetch_balances(&self) -> Result<Vec<AssetBalance>, GatewayError> {
        let resp = self
            .signed_request(reqwest::Method::GET, "/api/v3/account", "")
            .await?;
        let account: AccountResponse = Self::check(resp).await?.json().await?;

        let balances = account
            .balances
            .into_iter()
            .filter_map(|b| {
                let free = b.free.parse::<f64>().ok()?;
                let locked = b.locked.parse::<f64>().ok()?;
                (free + locked > 0.0).then(|| AssetBalance {
                    asset: b.asset,
                    free,
                    locked,
                })
            })
            .collect();
        Ok(balances)
    }

    async fn fetch_ticker(&self, token: &str) -> Result<Ticker, GatewayError> {
        self.limiter.acquire().await;

        let url = format!(
            "{}/api/v3/ticker/24hr?symbol={}",
            self.base_url,
            Self::spot_symbol(token)
        );
        let resp = self.http.get(&url).send().await?;
        let raw: TickerResponse = Self::check(resp).await?.json().await?;
        parse_ticker(raw)
    }

    async fn fetch_order(&self, token: &str, order_id: &str) -> Result<ExchangeOrder, GatewayError> {
        let params = format!("symbol={}&orderId={}", Self::spot_symbol(token), order_id);
        let resp = self
            .signed_request(reqwest::Method::GET, "/api/v3/order", &params)
            .await?;
        let raw: OrderResponse = Self::check(resp).await?.json().await?;
        Ok(parse_order(raw))
    }

    async fn create_order(&self, req: &OrderRequest) -> Result<ExchangeOrder, GatewayError> {
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={:.8}",
            Self::spot_symbol(&req.token),
            req.side.as_str(),
            match req.kind {
                OrderKind::Market => "MARKET",
                OrderKind::Limit => "LIMIT",
            },
            req.amount,
        );
        if let (OrderKind::Limit, Some(price)) = (req.kind, req.price) {
            params.push_str(&format!("&timeInForce=GTC&price={price:.8}"));
        }
        if let Some(ref id) = req.client_order_id {
            params.push_str(&format!("&newClientOrderId={id}"));
        }
        params.push_str("&newOrderRespType=FULL");

        debug!(token = %req.token, side = ?req.side, amount = req.amount, "binance_order_submit");

        let resp = self
            .signed_request(reqwest::Method::POST, "/api/v3/order", &params)
            .await?;
        let raw: OrderResponse = Self::check(resp).await?.json().await?;
        Ok(parse_order(raw))
    }

    async fn cancel_order(&self, token: &str, order_id: &str) -> Result<(), GatewayError> {
        let params = format!("symbol={}&orderId={}", Self::spot_symbol(token), order_id);
        let resp = self
            .signed_request(reqwest::Method::DELETE, "/api/v3/order", &params)
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn required_f64(field: Option<&str>, name: &str) -> Result<f64, GatewayError> {
    field
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| GatewayError::Transient(format!("ticker missing field: {name}")))
}

fn parse_ticker(raw: TickerResponse) -> Result<Ticker, GatewayError> {
    Ok(Ticker {
        bid: required_f64(raw.bid_price.as_deref(), "bidPrice")?,
        ask: required_f64(raw.ask_price.as_deref(), "askPrice")?,
        last: required_f64(raw.last_price.as_deref(), "lastPrice")?,
        volume_24h: raw.quote_volume.as_deref().and_then(|v| v.parse().ok()),
        change_24h: raw
            .price_change_percent
            .as_deref()
            .and_then(|v| v.parse().ok()),
    })
}

fn parse_order(raw: OrderResponse) -> ExchangeOrder {
    let orig: f64 = raw.orig_qty.parse().unwrap_or(0.0);
    let filled: f64 = raw.executed_qty.parse().unwrap_or(0.0);
    let quote: f64 = raw
        .cummulative_quote_qty
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);

    let average_fill_price = (filled > 0.0 && quote > 0.0).then(|| quote / filled);
    let fee = (!raw.fills.is_empty()).then(|| {
        raw.fills
            .iter()
            .filter_map(|f| f.commission.parse::<f64>().ok())
            .sum()
    });

    ExchangeOrder {
        exchange_order_id: raw.order_id.to_string(),
        status: parse_status(&raw.status),
        filled,
        remaining: (orig - filled).max(0.0),
        average_fill_price,
        fee,
    }
}

fn parse_status(status: &str) -> OrderStatus {
    match status {
        "NEW" | "PENDING_NEW" => OrderStatus::Open,
        "FILLED" => OrderStatus::Filled,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" | "PENDING_CANCEL" => OrderStatus::Canceled,
        _ => OrderStatus::Rejected,
    }
}

fn map_error(status: StatusCode, body: &str) -> GatewayError {
    let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or(ApiErrorBody {
        code: None,
        msg: None,
    });
    let msg = parsed.msg.unwrap_or_else(|| format!("HTTP {status}"));

    match parsed.code {
        Some(-2014) | Some(-2015) | Some(-1022) => return GatewayError::Auth(msg),
        Some(-2010) => return GatewayError::InsufficientFunds(msg),
        Some(-1121) => return GatewayError::UnknownSymbol(msg),
        Some(-1013) | Some(-2011) => return GatewayError::InvalidOrder(msg),
        Some(-1003) => return GatewayError::Transient(msg),
        _ => {}
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        GatewayError::Auth(msg)
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status.as_u16() == 418
        || status.is_server_error()
    {
        GatewayError::Transient(msg)
    } else {
        GatewayError::InvalidOrder(msg)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_gateway() -> BinanceGateway {
        BinanceGateway::new(
            reqwest::Client::new(),
            "https://api.binance.com",
            Credential {
                api_key: "test-key".into(),
                api_secret: "test-secret".into(),
                passphrase: None,
            },
            Arc::new(TokenBucket::new(1200)),
        )
    }

    #[test]
    fn test_signature_is_deterministic_hex() {
        let gw = make_gateway();
        let sig1 = gw.sign("symbol=BTCUSDT&timestamp=1700000000000").unwrap();
        let sig2 = gw.sign("symbol=BTCUSDT&timestamp=1700000000000").unwrap();
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64, "HMAC-SHA256 hex is 64 chars");

        let other = gw.sign("symbol=ETHUSDT&timestamp=1700000000000").unwrap();
        assert_ne!(sig1, other);
    }

    #[test]
    fn test_spot_symbol_uppercases() {
        assert_eq!(BinanceGateway::spot_symbol("btc"), "BTCUSDT");
        assert_eq!(BinanceGateway::spot_symbol("SOL"), "SOLUSDT");
    }

    #[test]
    fn test_parse_ticker_complete() {
        let raw: TickerResponse = serde_json::from_value(serde_json::json!({
            "bidPrice": "64000.10",
            "askPrice": "64001.50",
            "lastPrice": "64000.80",
            "quoteVolume": "1500000000.0",
            "priceChangePercent": "-2.15"
        }))
        .unwrap();
        let ticker = parse_ticker(raw).unwrap();
        assert!((ticker.bid - 64000.10).abs() < f64::EPSILON);
        assert!((ticker.ask - 64001.50).abs() < f64::EPSILON);
        assert_eq!(ticker.volume_24h, Some(1_500_000_000.0));
        assert_eq!(ticker.change_24h, Some(-2.15));
    }

    #[test]
    fn test_parse_ticker_missing_bid_is_transient() {
        let raw: TickerResponse = serde_json::from_value(serde_json::json!({
            "askPrice": "64001.50",
            "lastPrice": "64000.80"
        }))
        .unwrap();
        assert!(matches!(
            parse_ticker(raw),
            Err(GatewayError::Transient(_))
        ));
    }

    #[test]
    fn test_parse_order_computes_average_from_quote_qty() {
        let raw: OrderResponse = serde_json::from_value(serde_json::json!({
            "orderId": 123456u64,
            "status": "FILLED",
            "origQty": "0.50000000",
            "executedQty": "0.50000000",
            "cummulativeQuoteQty": "22700.00000000",
            "fills": [
                {"commission": "0.00050000"},
                {"commission": "0.00025000"}
            ]
        }))
        .unwrap();
        let order = parse_order(raw);
        assert_eq!(order.exchange_order_id, "123456");
        assert_eq!(order.status, OrderStatus::Filled);
        assert!((order.filled - 0.5).abs() < f64::EPSILON);
        assert!((order.remaining).abs() < f64::EPSILON);
        assert!((order.average_fill_price.unwrap() - 45400.0).abs() < 1e-9);
        assert!((order.fee.unwrap() - 0.00075).abs() < 1e-12);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(parse_status("NEW"), OrderStatus::Open);
        assert_eq!(parse_status("FILLED"), OrderStatus::Filled);
        assert_eq!(parse_status("PARTIALLY_FILLED"), OrderStatus::PartiallyFilled);
        assert_eq!(parse_status("CANCELED"), OrderStatus::Canceled);
        assert_eq!(parse_status("EXPIRED"), OrderStatus::Canceled);
        assert_eq!(parse_status("REJECTED"), OrderStatus::Rejected);
        assert_eq!(parse_status("SOMETHING_ELSE"), OrderStatus::Rejected);
    }

    #[test]
    fn test_error_mapping_by_code() {
        let e = map_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#,
        );
        assert!(matches!(e, GatewayError::InsufficientFunds(_)));

        let e = map_error(StatusCode::BAD_REQUEST, r#"{"code":-1121,"msg":"Invalid symbol."}"#);
        assert!(matches!(e, GatewayError::UnknownSymbol(_)));

        let e = map_error(
            StatusCode::UNAUTHORIZED,
            r#"{"code":-2015,"msg":"Invalid API-key, IP, or permissions for action."}"#,
        );
        assert!(matches!(e, GatewayError::Auth(_)));

        let e = map_error(StatusCode::TOO_MANY_REQUESTS, "");
        assert!(matches!(e, GatewayError::Transient(_)));

        let e = map_error(StatusCode::INTERNAL_SERVER_ERROR, "");
        assert!(matches!(e, GatewayError::Transient(_)));

        let e = map_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-1013,"msg":"Filter failure: LOT_SIZE"}"#,
        );
        assert!(matches!(e, GatewayError::InvalidOrder(_)));
    }
}
