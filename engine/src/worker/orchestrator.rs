use std::sync::Arc;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::WorkerContext;
use crate::gateway::{
    ExchangeGateway, GatewayError, OrderKind, OrderRequest, OrderSide, OrderStatus, Ticker,
};
use crate::ledger::LedgerError;
use crate::notify::NotificationKind;
use crate::strategy::store::ExecutionRecord;
use crate::strategy::{Decision, Strategy, TriggerReason};

// ---------------------------------------------------------------------------
// Strategy-driven execution
// ---------------------------------------------------------------------------

/// Turns a triggered decision into a market order, records the fill in the
/// ledger, and persists the execution on the strategy.
///
/// Returns `true` only when an order actually filled and was recorded.
/// `InsufficientFunds` / `InvalidOrder` are terminal for this decision:
/// nothing is recorded and the user is notified. Transient and auth
/// failures bubble up to the worker's per-strategy error handling.
pub async fn execute_decision(
    ctx: &Arc<WorkerContext>,
    gateway: &dyn ExchangeGateway,
    strategy: &Strategy,
    position: &crate::ledger::Position,
    ticker: &Ticker,
    decision: &Decision,
    tick_id: &str,
) -> anyhow::Result<bool> {
    let id = strategy
        .id
        .ok_or_else(|| anyhow::anyhow!("strategy document without _id"))?;
    let (Some(action), Some(reason)) = (decision.action, decision.reason) else {
        anyhow::bail!("triggered decision without action/reason");
    };
    let mut quantity_percent = decision.quantity_percent.unwrap_or(100.0);

    // The last enabled take-profit level liquidates the remainder: each
    // level's fraction resolves against a holding the earlier levels
    // already shrank, so a completed ladder must not leave dust behind.
    if closes_tp_ladder(strategy, reason) {
        quantity_percent = 100.0_f64.min(strategy.rules.execution.max_order_size_percent);
    }

    // quantity_percent resolves against the current holding for both
    // sides; a DCA buy re-buys a fraction of the present position.
    let amount = position.amount * quantity_percent / 100.0;
    if amount <= 0.0 {
        tracing::warn!(strategy_id = %id, quantity_percent, "empty_order_amount_dropped");
        return Ok(false);
    }

    let order_ref = decision_hash(&id.to_hex(), &reason.code(), quantity_percent, ticker.last, tick_id);
    let request = OrderRequest {
        token: strategy.token.clone(),
        side: action,
        kind: OrderKind::Market,
        amount,
        price: None,
        client_order_id: Some(order_ref.clone()),
    };

    tracing::info!(
        strategy_id = %id,
        token = %strategy.token,
        action = action.as_str(),
        reason = %reason.code(),
        amount,
        quantity_percent,
        entry_price = position.entry_price,
        current_price = ticker.last,
        "strategy_triggered"
    );

    // Submission is attempted exactly once; the client-order-id dedups on
    // exchanges that support it and the next tick retries otherwise.
    let order = match gateway.create_order(&request).await {
        Ok(order) => order,
        Err(e @ (GatewayError::InsufficientFunds(_) | GatewayError::InvalidOrder(_))) => {
            metrics::counter!(crate::metrics::ORDER_FAILURES).increment(1);
            tracing::warn!(strategy_id = %id, error = %e, "order_rejected_by_exchange");
            notify_order_failed(ctx, strategy, &e.to_string()).await;
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };

    let partially_ok =
        order.status == OrderStatus::PartiallyFilled && strategy.rules.execution.allow_partial_fills;
    if !(order.status == OrderStatus::Filled || partially_ok) {
        metrics::counter!(crate::metrics::ORDER_FAILURES).increment(1);
        tracing::warn!(
            strategy_id = %id,
            status = ?order.status,
            "order_not_filled"
        );
        notify_order_failed(ctx, strategy, &format!("order status {:?}", order.status)).await;
        return Ok(false);
    }
    if order.filled <= 0.0 {
        tracing::warn!(strategy_id = %id, "filled_order_reports_zero_quantity");
        return Ok(false);
    }

    let fill_price = order.average_fill_price.unwrap_or(ticker.last);
    let fee = order.fee.unwrap_or(0.0);

    // Ledger first, then the strategy: the next evaluation must never see
    // an execution whose holdings change is missing.
    let gross_pnl = match action {
        OrderSide::Sell => {
            match ctx
                .ledger
                .record_sell(
                    &strategy.user_id,
                    &strategy.exchange_id,
                    &strategy.token,
                    order.filled,
                    fill_price,
                    Some(&order.exchange_order_id),
                )
                .await
            {
                Ok((_, pnl)) => pnl,
                Err(LedgerError::InsufficientPosition { holding, requested }) => {
                    // Ledger drift: the exchange filled more than we track.
                    // Drop the decision and reconcile opportunistically.
                    tracing::error!(
                        strategy_id = %id,
                        holding,
                        requested,
                        "ledger_drift_detected_resyncing"
                    );
                    let _ = crate::ledger::sync_from_exchange(
                        &ctx.ledger,
                        &ctx.vault,
                        &ctx.registry,
                        &strategy.user_id,
                        Some(&strategy.exchange_id),
                        Some(&strategy.token),
                    )
                    .await;
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }
        }
        OrderSide::Buy => {
            ctx.ledger
                .record_buy(
                    &strategy.user_id,
                    &strategy.exchange_id,
                    &strategy.token,
                    order.filled,
                    fill_price,
                    Some(&order.exchange_order_id),
                )
                .await?;
            0.0
        }
    };

    let record = ExecutionRecord {
        action,
        reason,
        price: fill_price,
        amount: order.filled,
        pnl_usd: gross_pnl - fee,
        order_ref,
    };
    ctx.store.persist_execution(id, &record).await?;

    metrics::counter!(crate::metrics::ORDERS_SUBMITTED).increment(1);
    ctx.notifier
        .push(
            &strategy.user_id,
            NotificationKind::StrategyExecuted,
            &format!("{} {} executed", strategy.token, action.as_str()),
            &format!(
                "{} {:.8} {} at {:.8} ({})",
                action.as_str(),
                order.filled,
                strategy.token,
                fill_price,
                reason.code()
            ),
        )
        .await;

    Ok(true)
}

// ---------------------------------------------------------------------------
// Manual orders
// ---------------------------------------------------------------------------

/// A user-initiated market order. Follows the same gateway + ledger path
/// as strategy executions but bypasses the evaluator and touches no
/// strategy document.
pub async fn manual_order(
    ctx: &Arc<WorkerContext>,
    user_id: &str,
    exchange_id: &str,
    token: &str,
    side: OrderSide,
    amount: f64,
) -> Result<ManualOrderResult, ManualOrderError> {
    let (kind, credential) = ctx
        .vault
        .get_credential(user_id, exchange_id)
        .await
        .map_err(|e| ManualOrderError::Rejected(e.to_string()))?;
    let gateway = ctx.registry.build(kind, &credential);

    let request = OrderRequest {
        token: token.to_uppercase(),
        side,
        kind: OrderKind::Market,
        amount,
        price: None,
        client_order_id: Some(format!("manual-{}", Uuid::new_v4())),
    };

    let order = gateway.create_order(&request).await.map_err(|e| match e {
        GatewayError::Transient(m) => ManualOrderError::Upstream(m),
        GatewayError::Auth(m) => ManualOrderError::Upstream(format!("authentication failed: {m}")),
        other => ManualOrderError::Rejected(other.to_string()),
    })?;

    if !matches!(order.status, OrderStatus::Filled | OrderStatus::PartiallyFilled) {
        return Err(ManualOrderError::Rejected(format!(
            "order status {:?}",
            order.status
        )));
    }

    let fill_price = order.average_fill_price.unwrap_or(0.0);
    let mut realized_pnl = None;
    if order.filled > 0.0 && fill_price > 0.0 {
        match side {
            OrderSide::Buy => {
                ctx.ledger
                    .record_buy(
                        user_id,
                        exchange_id,
                        &request.token,
                        order.filled,
                        fill_price,
                        Some(&order.exchange_order_id),
                    )
                    .await
                    .map_err(|e| ManualOrderError::Rejected(e.to_string()))?;
            }
            OrderSide::Sell => {
                let (_, pnl) = ctx
                    .ledger
                    .record_sell(
                        user_id,
                        exchange_id,
                        &request.token,
                        order.filled,
                        fill_price,
                        Some(&order.exchange_order_id),
                    )
                    .await
                    .map_err(|e| ManualOrderError::Rejected(e.to_string()))?;
                realized_pnl = Some(pnl);
            }
        }
    }

    tracing::info!(
        user_id,
        exchange_id,
        token = %request.token,
        side = side.as_str(),
        filled = order.filled,
        fill_price,
        "manual_order_executed"
    );

    Ok(ManualOrderResult {
        order,
        realized_pnl,
    })
}

#[derive(Debug)]
pub struct ManualOrderResult {
    pub order: crate::gateway::ExchangeOrder,
    pub realized_pnl: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ManualOrderError {
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Upstream(String),
}

/// True when the firing take-profit level is the last enabled one not yet
/// executed, i.e. this sell completes the ladder.
fn closes_tp_ladder(strategy: &Strategy, reason: TriggerReason) -> bool {
    let TriggerReason::TakeProfit { percent, .. } = reason else {
        return false;
    };
    let executed = &strategy.tracking.execution_stats.executed_tp_levels;
    !strategy
        .rules
        .take_profit_levels
        .iter()
        .filter(|l| l.enabled)
        .any(|l| {
            (l.percent - percent).abs() > 1e-9
                && !executed.iter().any(|&e| (e - l.percent).abs() < 1e-9)
        })
}

// ---------------------------------------------------------------------------
// Decision hash
// ---------------------------------------------------------------------------

/// Idempotency key for one decision within one tick: a retry after a
/// transient failure reuses the same client order id and cannot create a
/// second order on exchanges with client-order-id dedup.
fn decision_hash(
    strategy_id: &str,
    reason_code: &str,
    quantity_percent: f64,
    price: f64,
    tick_id: &str,
) -> String {
    let price_bucket = (price * 100.0).round() as i64;
    let mut hasher = Sha256::new();
    hasher.update(strategy_id.as_bytes());
    hasher.update(reason_code.as_bytes());
    hasher.update(quantity_percent.to_bits().to_be_bytes());
    hasher.update(price_bucket.to_be_bytes());
    hasher.update(tick_id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

async fn notify_order_failed(ctx: &Arc<WorkerContext>, strategy: &Strategy, error: &str) {
    ctx.notifier
        .push(
            &strategy.user_id,
            NotificationKind::OrderFailed,
            &format!("{} order failed", strategy.token),
            error,
        )
        .await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::rules::{Rules, TakeProfitLevel};
    use crate::strategy::{ExecutionStats, Tracking, TriggerReason};

    fn ladder_strategy(executed: Vec<f64>) -> Strategy {
        Strategy {
            id: None,
            user_id: "u1".into(),
            exchange_id: "binance".into(),
            token: "BTC".into(),
            rules: Rules {
                take_profit_levels: vec![
                    TakeProfitLevel { percent: 5.0, quantity_percent: 30.0, enabled: true },
                    TakeProfitLevel { percent: 10.0, quantity_percent: 40.0, enabled: true },
                    TakeProfitLevel { percent: 20.0, quantity_percent: 30.0, enabled: true },
                ],
                ..Default::default()
            },
            is_active: true,
            needs_repair: false,
            tracking: Tracking {
                execution_stats: ExecutionStats {
                    executed_tp_levels: executed,
                    ..Default::default()
                },
                ..Default::default()
            },
            lease_until: None,
            lease_token: None,
            last_checked_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_middle_tp_level_does_not_close_ladder() {
        let strategy = ladder_strategy(vec![5.0]);
        let reason = TriggerReason::TakeProfit { level: 2, percent: 10.0 };
        assert!(!closes_tp_ladder(&strategy, reason));
    }

    #[test]
    fn test_final_tp_level_closes_ladder() {
        let strategy = ladder_strategy(vec![5.0, 10.0]);
        let reason = TriggerReason::TakeProfit { level: 3, percent: 20.0 };
        assert!(closes_tp_ladder(&strategy, reason));
    }

    #[test]
    fn test_non_tp_reasons_never_close_ladder() {
        let strategy = ladder_strategy(vec![5.0, 10.0]);
        assert!(!closes_tp_ladder(&strategy, TriggerReason::StopLoss));
        assert!(!closes_tp_ladder(&strategy, TriggerReason::TrailingStop));
    }

    #[test]
    fn test_decision_hash_is_stable_within_a_tick() {
        let a = decision_hash("64f0", "TAKE_PROFIT_L1", 30.0, 1.0512, "tick-1");
        let b = decision_hash("64f0", "TAKE_PROFIT_L1", 30.0, 1.0512, "tick-1");
        assert_eq!(a, b, "same decision in the same tick must hash identically");
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_decision_hash_buckets_nearby_prices() {
        // Sub-cent jitter between the evaluation and a retry must not
        // change the key.
        let a = decision_hash("64f0", "STOP_LOSS", 100.0, 1.05111, "tick-1");
        let b = decision_hash("64f0", "STOP_LOSS", 100.0, 1.05149, "tick-1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_decision_hash_differs_across_ticks_and_reasons() {
        let base = decision_hash("64f0", "STOP_LOSS", 100.0, 1.05, "tick-1");
        assert_ne!(base, decision_hash("64f0", "STOP_LOSS", 100.0, 1.05, "tick-2"));
        assert_ne!(base, decision_hash("64f0", "TRAILING_STOP", 100.0, 1.05, "tick-1"));
        assert_ne!(base, decision_hash("64f1", "STOP_LOSS", 100.0, 1.05, "tick-1"));
    }
}
