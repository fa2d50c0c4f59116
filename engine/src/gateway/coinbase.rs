use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::Sha256;

use super::rate_limit::TokenBucket;
use super::{
    AssetBalance, ExchangeGateway, ExchangeOrder, GatewayError, OrderKind, OrderRequest,
    OrderSide, OrderStatus, Ticker,
};
use crate::vault::Credential;

const QUOTE_ASSET: &str = "USD";

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    accounts: Vec<RawAccount>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    currency: String,
    available_balance: MoneyAmount,
    hold: MoneyAmount,
}

#[derive(Debug, Deserialize)]
struct MoneyAmount {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ProductResponse {
    price: Option<String>,
    volume_24h: Option<String>,
    price_percentage_change_24h: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BestBidAskResponse {
    pricebooks: Vec<PriceBook>,
}

#[derive(Debug, Deserialize)]
struct PriceBook {
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
}

#[derive(Debug, Deserialize)]
struct PriceLevel {
    price: String,
}

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    success: bool,
    success_response: Option<CreateOrderSuccess>,
    error_response: Option<CreateOrderFailure>,
}

#[derive(Debug, Deserialize)]
struct CreateOrderSuccess {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateOrderFailure {
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoricalOrderResponse {
    order: RawOrder,
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    order_id: String,
    status: String,
    #[serde(default)]
    filled_size: Option<String>,
    #[serde(default)]
    base_size: Option<String>,
    #[serde(default)]
    average_filled_price: Option<String>,
    #[serde(default)]
    total_fees: Option<String>,
}

// ---------------------------------------------------------------------------
// CoinbaseGateway
// ---------------------------------------------------------------------------

/// Coinbase Advanced Trade adapter. Requests carry `CB-ACCESS-*` headers
/// with an HMAC-SHA256 over `timestamp + method + path + body`.
pub struct CoinbaseGateway {
    http: reqwest::Client,
    base_url: String,
    credential: Credential,
    limiter: Arc<TokenBucket>,
}

impl CoinbaseGateway {
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

    fn product_id(token: &str) -> String {
        format!("{}-{}", token.to_uppercase(), QUOTE_ASSET)
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String, GatewayError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.credential.api_secret.as_bytes())
            .map_err(|e| GatewayError::Auth(format!("HMAC key rejected: {e}")))?;
        mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<HeaderMap, GatewayError> {
        let timestamp = now_secs().to_string();
        let signature = self.sign(&timestamp, method, path, body)?;

        let mut headers = HeaderMap::new();
        let mut insert = |name: &'static str, value: &str| -> Result<(), GatewayError> {
            headers.insert(
                name,
                HeaderValue::from_str(value)
                    .map_err(|e| GatewayError::Auth(format!("invalid header {name}: {e}")))?,
            );
            Ok(())
        };
        insert("CB-ACCESS-KEY", &self.credential.api_key)?;
        insert("CB-ACCESS-SIGN", &signature)?;
        insert("CB-ACCESS-TIMESTAMP", &timestamp)?;
        Ok(headers)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, GatewayError> {
        self.limiter.acquire().await;

        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let headers = self.auth_headers(method.as_str(), path, &body_str)?;
        let url = format!("{}{}", self.base_url, path);

        let mut req = self.http.request(method, &url).headers(headers);
        if body.is_some() {
            req = req
                .header("Content-Type", "application/json")
                .body(body_str);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(map_error(status, &text))
    }
}

#[async_trait]
impl ExchangeGateway for CoinbaseGateway {
    async fn fetch_balances(&self) -> Result<Vec<AssetBalance>, GatewayError> {
        let resp = self
            .request(reqwest::Method::GET, "/api/v3/brokerage/accounts", None)
            .await?;
        let accounts: AccountsResponse = resp.json().await?;

        let balances = accounts
            .accounts
            .into_iter()
            .filter_map(|a| {
                let free = a.available_balance.value.parse::<f64>().ok()?;
                let locked = a.hold.value.parse::<f64>().ok()?;
                (free + locked > 0.0).then(|| AssetBalance {
                    asset: a.currency,
                    free,
                    locked,
                })
            })
            .collect();
        Ok(balances)
    }

    async fn fetch_ticker(&self, token: &str) -> Result<Ticker, GatewayError> {
        let product = Self::product_id(token);

        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v3/brokerage/products/{product}"),
                None,
            )
            .await?;
        let info: ProductResponse = resp.json().await?;

        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v3/brokerage/best_bid_ask?product_ids={product}"),
                None,
            )
            .await?;
        let book: BestBidAskResponse = resp.json().await?;

        build_ticker(info, book)
    }

    async fn fetch_order(&self, _token: &str, order_id: &str) -> Result<ExchangeOrder, GatewayError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v3/brokerage/orders/historical/{order_id}"),
                None,
            )
            .await?;
        let raw: HistoricalOrderResponse = resp.json().await?;
        Ok(parse_order(raw.order))
    }

    async fn create_order(&self, req: &OrderRequest) -> Result<ExchangeOrder, GatewayError> {
        let client_order_id = req
            .client_order_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let configuration = match req.kind {
            OrderKind::Market => serde_json::json!({
                "market_market_ioc": { "base_size": format!("{:.8}", req.amount) }
            }),
            OrderKind::Limit => serde_json::json!({
                "limit_limit_gtc": {
                    "base_size": format!("{:.8}", req.amount),
                    "limit_price": format!("{:.8}", req.price.unwrap_or(0.0)),
                }
            }),
        };
        let body = serde_json::json!({
            "client_order_id": client_order_id,
            "product_id": Self::product_id(&req.token),
            "side": match req.side {
                OrderSide::Buy => "BUY",
                OrderSide::Sell => "SELL",
            },
            "order_configuration": configuration,
        });

        let resp = self
            .request(reqwest::Method::POST, "/api/v3/brokerage/orders", Some(body))
            .await?;
        let created: CreateOrderResponse = resp.json().await?;

        if !created.success {
            return Err(map_create_failure(created.error_response));
        }
        let order_id = created
            .success_response
            .map(|s| s.order_id)
            .ok_or_else(|| GatewayError::Transient("order accepted without an id".into()))?;

        // Market IOC orders settle immediately; read back the fill once.
        match self.fetch_order(&req.token, &order_id).await {
            Ok(order) => Ok(order),
            Err(_) => Ok(ExchangeOrder {
                exchange_order_id: order_id,
                status: OrderStatus::Open,
                filled: 0.0,
                remaining: req.amount,
                average_fill_price: None,
                fee: None,
            }),
        }
    }

    async fn cancel_order(&self, _token: &str, order_id: &str) -> Result<(), GatewayError> {
        let body = serde_json::json!({ "order_ids": [order_id] });
        self.request(
            reqwest::Method::POST,
            "/api/v3/brokerage/orders/batch_cancel",
            Some(body),
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn build_ticker(info: ProductResponse, book: BestBidAskResponse) -> Result<Ticker, GatewayError> {
    let last = info
        .price
        .as_deref()
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| GatewayError::Transient("product missing price".into()))?;

    let pricebook = book
        .pricebooks
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::Transient("empty pricebook".into()))?;
    let bid = pricebook
        .bids
        .first()
        .and_then(|l| l.price.parse::<f64>().ok())
        .ok_or_else(|| GatewayError::Transient("pricebook missing bid".into()))?;
    let ask = pricebook
        .asks
        .first()
        .and_then(|l| l.price.parse::<f64>().ok())
        .ok_or_else(|| GatewayError::Transient("pricebook missing ask".into()))?;

    Ok(Ticker {
        bid,
        ask,
        last,
        volume_24h: info.volume_24h.as_deref().and_then(|v| v.parse().ok()),
        change_24h: info
            .price_percentage_change_24h
            .as_deref()
            .and_then(|v| v.parse().ok()),
    })
}

fn parse_order(raw: RawOrder) -> ExchangeOrder {
    let filled: f64 = raw
        .filled_size
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    let base: f64 = raw
        .base_size
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(filled);

    ExchangeOrder {
        exchange_order_id: raw.order_id,
        status: parse_status(&raw.status),
        filled,
        remaining: (base - filled).max(0.0),
        average_fill_price: raw
            .average_filled_price
            .as_deref()
            .and_then(|v| v.parse().ok()),
        fee: raw.total_fees.as_deref().and_then(|v| v.parse().ok()),
    }
}

fn parse_status(status: &str) -> OrderStatus {
    match status {
        "OPEN" | "PENDING" | "QUEUED" => OrderStatus::Open,
        "FILLED" => OrderStatus::Filled,
        "CANCELLED" | "EXPIRED" => OrderStatus::Canceled,
        "FAILED" | "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Rejected,
    }
}

fn map_create_failure(failure: Option<CreateOrderFailure>) -> GatewayError {
    let (code, message) = failure
        .map(|f| (f.error.unwrap_or_default(), f.message.unwrap_or_default()))
        .unwrap_or_default();

    match code.as_str() {
        "INSUFFICIENT_FUND" | "INSUFFICIENT_FUNDS" => GatewayError::InsufficientFunds(message),
        "PRODUCT_NOT_FOUND" | "INVALID_PRODUCT_ID" => GatewayError::UnknownSymbol(message),
        "UNAUTHORIZED" | "INVALID_API_KEY" => GatewayError::Auth(message),
        _ => GatewayError::InvalidOrder(format!("{code}: {message}")),
    }
}

fn map_error(status: StatusCode, body: &str) -> GatewayError {
    let msg = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        body.to_string()
    };
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        GatewayError::Auth(msg)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        GatewayError::Transient(msg)
    } else if status == StatusCode::NOT_FOUND {
        GatewayError::UnknownSymbol(msg)
    } else {
        GatewayError::InvalidOrder(msg)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_secs()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_id() {
        assert_eq!(CoinbaseGateway::product_id("eth"), "ETH-USD");
    }

    #[test]
    fn test_build_ticker_requires_bid_and_ask() {
        let info: ProductResponse = serde_json::from_value(serde_json::json!({
            "price": "3200.50",
            "volume_24h": "880000000",
            "price_percentage_change_24h": "1.8"
        }))
        .unwrap();
        let book: BestBidAskResponse = serde_json::from_value(serde_json::json!({
            "pricebooks": [{"bids": [{"price": "3200.1"}], "asks": []}]
        }))
        .unwrap();
        assert!(matches!(
            build_ticker(info, book),
            Err(GatewayError::Transient(_))
        ));
    }

    #[test]
    fn test_build_ticker_complete() {
        let info: ProductResponse = serde_json::from_value(serde_json::json!({
            "price": "3200.50",
            "volume_24h": "880000000",
            "price_percentage_change_24h": "1.8"
        }))
        .unwrap();
        let book: BestBidAskResponse = serde_json::from_value(serde_json::json!({
            "pricebooks": [{"bids": [{"price": "3200.1"}], "asks": [{"price": "3200.9"}]}]
        }))
        .unwrap();
        let ticker = build_ticker(info, book).unwrap();
        assert!((ticker.bid - 3200.1).abs() < f64::EPSILON);
        assert!((ticker.ask - 3200.9).abs() < f64::EPSILON);
        assert_eq!(ticker.change_24h, Some(1.8));
    }

    #[test]
    fn test_parse_order_statuses() {
        let raw: RawOrder = serde_json::from_value(serde_json::json!({
            "order_id": "ab-1",
            "status": "FILLED",
            "filled_size": "0.25",
            "base_size": "0.25",
            "average_filled_price": "3199.00",
            "total_fees": "1.20"
        }))
        .unwrap();
        let order = parse_order(raw);
        assert_eq!(order.status, OrderStatus::Filled);
        assert!((order.filled - 0.25).abs() < f64::EPSILON);
        assert!((order.remaining).abs() < f64::EPSILON);
        assert_eq!(order.average_fill_price, Some(3199.0));
        assert_eq!(order.fee, Some(1.2));
    }

    #[test]
    fn test_create_failure_mapping() {
        let e = map_create_failure(Some(CreateOrderFailure {
            error: Some("INSUFFICIENT_FUND".into()),
            message: Some("not enough USD".into()),
        }));
        assert!(matches!(e, GatewayError::InsufficientFunds(_)));

        let e = map_create_failure(Some(CreateOrderFailure {
            error: Some("PRODUCT_NOT_FOUND".into()),
            message: None,
        }));
        assert!(matches!(e, GatewayError::UnknownSymbol(_)));
    }
}
