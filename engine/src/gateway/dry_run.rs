use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::{
    AssetBalance, ExchangeGateway, ExchangeOrder, GatewayError, OrderRequest, OrderSide,
    OrderStatus, Ticker,
};

const DRY_ORDER_PREFIX: &str = "dry-";

// ---------------------------------------------------------------------------
// DryRunGateway
// ---------------------------------------------------------------------------

/// Wraps any gateway so that `create_order` never reaches the upstream
/// exchange. Reads delegate to the wrapped gateway; submissions return a
/// synthetic `FILLED` order at the current ticker price.
pub struct DryRunGateway {
    inner: Arc<dyn ExchangeGateway>,
}

impl DryRunGateway {
    pub fn new(inner: Arc<dyn ExchangeGateway>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ExchangeGateway for DryRunGateway {
    async fn fetch_balances(&self) -> Result<Vec<AssetBalance>, GatewayError> {
        self.inner.fetch_balances().await
    }

    async fn fetch_ticker(&self, token: &str) -> Result<Ticker, GatewayError> {
        self.inner.fetch_ticker(token).await
    }

    async fn fetch_order(&self, token: &str, order_id: &str) -> Result<ExchangeOrder, GatewayError> {
        if order_id.starts_with(DRY_ORDER_PREFIX) {
            return Ok(ExchangeOrder {
                exchange_order_id: order_id.to_string(),
                status: OrderStatus::Filled,
                filled: 0.0,
                remaining: 0.0,
                average_fill_price: None,
                fee: None,
            });
        }
        self.inner.fetch_order(token, order_id).await
    }

    async fn create_order(&self, req: &OrderRequest) -> Result<ExchangeOrder, GatewayError> {
        let ticker = self.inner.fetch_ticker(&req.token).await?;
        let fill_price = match req.side {
            OrderSide::Buy => ticker.ask,
            OrderSide::Sell => ticker.bid,
        };

        info!(
            token = %req.token,
            side = ?req.side,
            amount = req.amount,
            fill_price,
            "dry_run_order_simulated"
        );

        Ok(ExchangeOrder {
            exchange_order_id: format!("{DRY_ORDER_PREFIX}{}", Uuid::new_v4()),
            status: OrderStatus::Filled,
            filled: req.amount,
            remaining: 0.0,
            average_fill_price: Some(fill_price),
            fee: Some(0.0),
        })
    }

    async fn cancel_order(&self, token: &str, order_id: &str) -> Result<(), GatewayError> {
        if order_id.starts_with(DRY_ORDER_PREFIX) {
            return Ok(());
        }
        self.inner.cancel_order(token, order_id).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::OrderKind;

    /// Stub upstream that fails on writes, proving dry-run never submits.
    struct StubGateway;

    #[async_trait]
    impl ExchangeGateway for StubGateway {
        async fn fetch_balances(&self) -> Result<Vec<AssetBalance>, GatewayError> {
            Ok(vec![])
        }

        async fn fetch_ticker(&self, _token: &str) -> Result<Ticker, GatewayError> {
            Ok(Ticker {
                bid: 99.0,
                ask: 101.0,
                last: 100.0,
                volume_24h: Some(1_000_000.0),
                change_24h: Some(0.5),
            })
        }

        async fn fetch_order(
            &self,
            _token: &str,
            _order_id: &str,
        ) -> Result<ExchangeOrder, GatewayError> {
            panic!("fetch_order must not reach upstream for dry order ids");
        }

        async fn create_order(&self, _req: &OrderRequest) -> Result<ExchangeOrder, GatewayError> {
            panic!("create_order must never reach upstream in dry-run mode");
        }

        async fn cancel_order(&self, _token: &str, _order_id: &str) -> Result<(), GatewayError> {
            panic!("cancel_order must not reach upstream for dry order ids");
        }
    }

    #[tokio::test]
    async fn test_create_order_synthesizes_fill_at_ticker() {
        let gw = DryRunGateway::new(Arc::new(StubGateway));
        let req = OrderRequest {
            token: "BTC".into(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            amount: 0.5,
            price: None,
            client_order_id: None,
        };

        let order = gw.create_order(&req).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!((order.filled - 0.5).abs() < f64::EPSILON);
        assert_eq!(order.average_fill_price, Some(101.0), "buy fills at the ask");
        assert!(order.exchange_order_id.starts_with(DRY_ORDER_PREFIX));
    }

    #[tokio::test]
    async fn test_sell_fills_at_bid() {
        let gw = DryRunGateway::new(Arc::new(StubGateway));
        let req = OrderRequest {
            token: "ETH".into(),
            side: OrderSide::Sell,
            kind: OrderKind::Market,
            amount: 2.0,
            price: None,
            client_order_id: Some("manual-1".into()),
        };

        let order = gw.create_order(&req).await.unwrap();
        assert_eq!(order.average_fill_price, Some(99.0), "sell fills at the bid");
    }

    #[tokio::test]
    async fn test_dry_order_lookup_and_cancel_stay_local() {
        let gw = DryRunGateway::new(Arc::new(StubGateway));
        let order = gw.fetch_order("BTC", "dry-0000").await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        gw.cancel_order("BTC", "dry-0000").await.unwrap();
    }
}
