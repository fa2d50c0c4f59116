pub mod evaluator;
pub mod rules;
pub mod store;

use mongodb::bson::oid::ObjectId;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::gateway::OrderSide;
use self::rules::Rules;

// ---------------------------------------------------------------------------
// Strategy document
// ---------------------------------------------------------------------------

/// One automated strategy per (user, exchange, token).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub user_id: String,
    pub exchange_id: String,
    pub token: String,
    pub rules: Rules,
    pub is_active: bool,
    #[serde(default)]
    pub needs_repair: bool,
    #[serde(default)]
    pub tracking: Tracking,
    #[serde(default)]
    pub lease_until: Option<i64>,
    #[serde(default)]
    pub lease_token: Option<String>,
    #[serde(default)]
    pub last_checked_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Tracking {
    pub execution_stats: ExecutionStats,
    pub trailing_stop_state: TrailingStopState,
    pub cooldown_state: CooldownState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionStats {
    pub total_executions: u64,
    pub total_sells: u64,
    pub total_buys: u64,
    pub total_pnl_usd: f64,
    pub daily_pnl_usd: f64,
    pub weekly_pnl_usd: f64,
    pub monthly_pnl_usd: f64,
    /// Window keys the maintenance sweep compares against to decide when a
    /// PnL window rolls over (e.g. "2026-08-02", "2026-W31", "2026-08").
    pub daily_window: Option<String>,
    pub weekly_window: Option<String>,
    pub monthly_window: Option<String>,
    /// Take-profit / DCA levels already consumed, keyed by the level's
    /// trigger percent.
    pub executed_tp_levels: Vec<f64>,
    pub executed_dca_levels: Vec<f64>,
    /// Recent order refs already applied, the replay guard for
    /// PersistExecution.
    pub applied_order_refs: Vec<String>,
    pub last_execution_at: Option<i64>,
    pub last_execution_type: Option<String>,
    pub last_execution_reason: Option<String>,
    pub last_execution_price: Option<f64>,
    pub last_execution_amount: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingStopState {
    pub is_active: bool,
    pub highest_price_seen: Option<f64>,
    pub current_stop_price: Option<f64>,
    pub activated_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownState {
    pub cooldown_until: Option<i64>,
    pub last_action: Option<String>,
    pub last_action_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerReason {
    TakeProfit { level: usize, percent: f64 },
    StopLoss,
    TrailingStop,
    BuyDip,
    Dca { level: usize, percent: f64 },
}

impl TriggerReason {
    pub fn code(&self) -> String {
        match self {
            Self::TakeProfit { level, .. } => format!("TAKE_PROFIT_L{level}"),
            Self::StopLoss => "STOP_LOSS".into(),
            Self::TrailingStop => "TRAILING_STOP".into(),
            Self::BuyDip => "BUY_DIP".into(),
            Self::Dca { level, .. } => format!("DCA_L{level}"),
        }
    }

    /// The level percent to add to the executed-levels set, when the
    /// trigger consumes one.
    pub fn consumed_level(&self) -> Option<ConsumedLevel> {
        match *self {
            Self::TakeProfit { percent, .. } => Some(ConsumedLevel::TakeProfit(percent)),
            Self::Dca { percent, .. } => Some(ConsumedLevel::Dca(percent)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConsumedLevel {
    TakeProfit(f64),
    Dca(f64),
}

impl Serialize for TriggerReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.code())
    }
}

/// Output of the trigger evaluator. When `should_trigger` is false the
/// metadata names the blocking validation.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub should_trigger: bool,
    pub action: Option<OrderSide>,
    pub reason: Option<TriggerReason>,
    pub quantity_percent: Option<f64>,
    pub metadata: serde_json::Value,
}

impl Decision {
    pub fn triggered(action: OrderSide, reason: TriggerReason, quantity_percent: f64) -> Self {
        Self {
            should_trigger: true,
            action: Some(action),
            reason: Some(reason),
            quantity_percent: Some(quantity_percent),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn blocked(metadata: serde_json::Value) -> Self {
        Self {
            should_trigger: false,
            action: None,
            reason: None,
            quantity_percent: None,
            metadata,
        }
    }
}

/// Requested update to the persistent trailing-stop state. The evaluator
/// never writes; the worker forwards this to the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingUpdate {
    pub highest_price_seen: f64,
    pub current_stop_price: f64,
    pub is_active: bool,
}

/// Full evaluator output: the decision plus side-effect requests.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub decision: Decision,
    pub trailing: Option<TrailingUpdate>,
    pub pause_requested: bool,
    pub needs_repair: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(
            TriggerReason::TakeProfit { level: 1, percent: 5.0 }.code(),
            "TAKE_PROFIT_L1"
        );
        assert_eq!(TriggerReason::StopLoss.code(), "STOP_LOSS");
        assert_eq!(TriggerReason::TrailingStop.code(), "TRAILING_STOP");
        assert_eq!(TriggerReason::BuyDip.code(), "BUY_DIP");
        assert_eq!(TriggerReason::Dca { level: 2, percent: 10.0 }.code(), "DCA_L2");
    }

    #[test]
    fn test_reason_serializes_to_code() {
        let decision = Decision::triggered(
            OrderSide::Sell,
            TriggerReason::TakeProfit { level: 2, percent: 10.0 },
            40.0,
        );
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["reason"], "TAKE_PROFIT_L2");
        assert_eq!(json["action"], "SELL");
        assert_eq!(json["quantity_percent"], 40.0);
    }

    #[test]
    fn test_consumed_level() {
        assert_eq!(
            TriggerReason::Dca { level: 1, percent: 5.0 }.consumed_level(),
            Some(ConsumedLevel::Dca(5.0))
        );
        assert_eq!(TriggerReason::StopLoss.consumed_level(), None);
    }

    #[test]
    fn test_tracking_defaults_are_empty() {
        let tracking: Tracking = serde_json::from_str("{}").unwrap();
        assert_eq!(tracking.execution_stats.total_executions, 0);
        assert!(!tracking.trailing_stop_state.is_active);
        assert!(tracking.cooldown_state.cooldown_until.is_none());
    }
}
