use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::WorkerContext;
use crate::gateway::{with_retry, ExchangeGateway, GatewayError};
use crate::vault::LinkedExchange;

/// Assets valued 1:1 against USD without a ticker lookup.
const STABLE_ASSETS: [&str; 4] = ["USDT", "USDC", "USD", "DAI"];

const BRL_RATE_TTL: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// Snapshot documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSnapshot {
    pub exchange_id: String,
    pub exchange_name: String,
    pub total_usd: f64,
    pub total_brl: f64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub user_id: String,
    pub timestamp: i64,
    pub total_usd: f64,
    pub total_brl: f64,
    pub exchanges: Vec<ExchangeSnapshot>,
}

// ---------------------------------------------------------------------------
// USD/BRL rate
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AwesomeApiQuote {
    #[serde(rename = "USDBRL")]
    usdbrl: Option<QuoteBody>,
}

#[derive(Debug, Deserialize)]
struct QuoteBody {
    bid: String,
}

/// Long-TTL cache for the USD->BRL conversion rate. On fetch failure the
/// last known rate is reused; before the first success the rate is 0.0 and
/// BRL totals read zero.
pub struct BrlRateCache {
    http: reqwest::Client,
    url: String,
    state: RwLock<(f64, Option<Instant>)>,
}

impl BrlRateCache {
    pub fn new(http: reqwest::Client, url: &str) -> Self {
        Self {
            http,
            url: url.to_string(),
            state: RwLock::new((0.0, None)),
        }
    }

    pub async fn get(&self) -> f64 {
        {
            let state = self.state.read().unwrap();
            if let (rate, Some(at)) = *state {
                if at.elapsed() < BRL_RATE_TTL {
                    return rate;
                }
            }
        }

        match self.fetch().await {
            Ok(rate) => {
                *self.state.write().unwrap() = (rate, Some(Instant::now()));
                rate
            }
            Err(e) => {
                tracing::warn!(error = %e, "brl_rate_fetch_failed_using_last_known");
                self.state.read().unwrap().0
            }
        }
    }

    async fn fetch(&self) -> anyhow::Result<f64> {
        let quote: AwesomeApiQuote = self
            .http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let rate = quote
            .usdbrl
            .and_then(|q| q.bid.parse::<f64>().ok())
            .ok_or_else(|| anyhow::anyhow!("quote response missing USDBRL bid"))?;
        Ok(rate)
    }

    #[cfg(test)]
    pub fn set(&self, rate: f64) {
        *self.state.write().unwrap() = (rate, Some(Instant::now()));
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// One snapshot pass: for every user with an active exchange link,
/// aggregate per-exchange portfolio totals and append a history document.
/// A failing exchange marks its subrecord unsuccessful without sinking the
/// user's snapshot.
pub async fn run_snapshot(ctx: Arc<WorkerContext>) -> anyhow::Result<()> {
    let users = ctx.vault.users_with_active_exchanges().await?;
    if users.is_empty() {
        tracing::debug!("no_users_to_snapshot");
        return Ok(());
    }

    let brl_rate = ctx.brl_rate.get().await;
    let mut written = 0u64;

    for user_id in &users {
        match snapshot_user(&ctx, user_id, brl_rate).await {
            Ok(()) => written += 1,
            Err(e) => {
                tracing::error!(user_id, error = %e, "user_snapshot_failed");
            }
        }
    }

    metrics::counter!(crate::metrics::SNAPSHOTS_WRITTEN).increment(written);
    tracing::info!(users = users.len(), written, "balance_snapshot_completed");
    Ok(())
}

async fn snapshot_user(
    ctx: &Arc<WorkerContext>,
    user_id: &str,
    brl_rate: f64,
) -> anyhow::Result<()> {
    let links = ctx.vault.list_active(user_id).await?;
    if links.is_empty() {
        return Ok(());
    }

    let valuations = links.iter().map(|link| value_linked_exchange(ctx, link, brl_rate));
    let exchanges: Vec<ExchangeSnapshot> = futures::future::join_all(valuations).await;

    let total_usd: f64 = exchanges.iter().filter(|e| e.success).map(|e| e.total_usd).sum();
    let total_brl: f64 = exchanges.iter().filter(|e| e.success).map(|e| e.total_brl).sum();

    let snapshot = BalanceSnapshot {
        id: None,
        user_id: user_id.to_string(),
        timestamp: Utc::now().timestamp(),
        total_usd,
        total_brl,
        exchanges,
    };
    ctx.balance_history.insert_one(&snapshot).await?;

    tracing::info!(user_id, total_usd, "balance_snapshot_saved");
    Ok(())
}

// ---------------------------------------------------------------------------
// Valuation
// ---------------------------------------------------------------------------

async fn value_linked_exchange(
    ctx: &Arc<WorkerContext>,
    link: &LinkedExchange,
    brl_rate: f64,
) -> ExchangeSnapshot {
    let gateway = ctx.registry.build(link.kind, &link.credential);
    match value_exchange(ctx, gateway.as_ref(), &link.exchange_id).await {
        Ok(total_usd) => ExchangeSnapshot {
            exchange_id: link.exchange_id.clone(),
            exchange_name: link.kind.display_name().to_string(),
            total_usd,
            total_brl: total_usd * brl_rate,
            success: true,
        },
        Err(e) => {
            tracing::warn!(
                exchange_id = %link.exchange_id,
                error = %e,
                "exchange_valuation_failed"
            );
            ExchangeSnapshot {
                exchange_id: link.exchange_id.clone(),
                exchange_name: link.kind.display_name().to_string(),
                total_usd: 0.0,
                total_brl: 0.0,
                success: false,
            }
        }
    }
}

/// Values one exchange's holdings in USD: stables at par, everything else
/// at the cached last price. Unpriceable dust is skipped.
async fn value_exchange(
    ctx: &Arc<WorkerContext>,
    gateway: &dyn ExchangeGateway,
    exchange_id: &str,
) -> Result<f64, GatewayError> {
    let balances = with_retry(|| gateway.fetch_balances()).await?;

    let mut total_usd = 0.0;
    for balance in balances {
        let asset = balance.asset.to_uppercase();
        let price = if STABLE_ASSETS.contains(&asset.as_str()) {
            1.0
        } else {
            match ctx.tickers.get_or_fetch(gateway, exchange_id, &asset).await {
                Ok(ticker) => ticker.last,
                Err(GatewayError::UnknownSymbol(_)) => {
                    tracing::debug!(asset = %asset, "asset_without_market_skipped");
                    continue;
                }
                Err(e) => return Err(e),
            }
        };
        total_usd += balance.total() * price;
    }
    Ok(total_usd)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_brl_rate_serves_cached_value_without_refetching() {
        // An unroutable URL proves the cached value short-circuits the
        // fetch entirely.
        let cache = BrlRateCache::new(reqwest::Client::new(), "http://127.0.0.1:1/last/USD-BRL");
        cache.set(5.42);
        assert!((cache.get().await - 5.42).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_brl_rate_is_zero_before_first_successful_fetch() {
        let cache = BrlRateCache::new(reqwest::Client::new(), "http://127.0.0.1:1/last/USD-BRL");
        assert!((cache.get().await).abs() < f64::EPSILON);
    }

    #[test]
    fn test_quote_response_parsing() {
        let quote: AwesomeApiQuote = serde_json::from_value(serde_json::json!({
            "USDBRL": {
                "code": "USD",
                "codein": "BRL",
                "bid": "5.4312",
                "ask": "5.4330"
            }
        }))
        .unwrap();
        let bid = quote.usdbrl.unwrap().bid.parse::<f64>().unwrap();
        assert!((bid - 5.4312).abs() < f64::EPSILON);
    }
}
