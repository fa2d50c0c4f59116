use chrono::{DateTime, Datelike, Duration, Utc};
use futures::stream::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Document};
use mongodb::Collection;
use thiserror::Error;
use uuid::Uuid;

use super::{ConsumedLevel, Strategy, TrailingUpdate, TriggerReason};
use crate::gateway::OrderSide;
use crate::strategy::rules::Rules;

/// How many recent order refs the replay guard remembers per strategy.
const APPLIED_REFS_KEPT: i32 = 50;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("strategy not found")]
    NotFound,
    #[error("an active strategy already exists for this (user, exchange, token)")]
    Duplicate,
    #[error(transparent)]
    Db(#[from] mongodb::error::Error),
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// Everything `persist_execution` needs to atomically fold one executed
/// order into a strategy's tracking state.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub action: OrderSide,
    pub reason: TriggerReason,
    pub price: f64,
    pub amount: f64,
    pub pnl_usd: f64,
    /// Idempotency key; a replay with the same ref is a no-op.
    pub order_ref: String,
}

// ---------------------------------------------------------------------------
// StrategyStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StrategyStore {
    collection: Collection<Strategy>,
}

impl StrategyStore {
    pub fn new(collection: Collection<Strategy>) -> Self {
        Self { collection }
    }

    pub async fn create(
        &self,
        user_id: &str,
        exchange_id: &str,
        token: &str,
        rules: Rules,
        is_active: bool,
    ) -> Result<Strategy, StoreError> {
        let now = Utc::now().timestamp();
        let strategy = Strategy {
            id: None,
            user_id: user_id.to_string(),
            exchange_id: exchange_id.to_string(),
            token: token.to_uppercase(),
            rules,
            is_active,
            needs_repair: false,
            tracking: Default::default(),
            lease_until: None,
            lease_token: None,
            last_checked_at: None,
            created_at: now,
            updated_at: now,
        };

        let result = self.collection.insert_one(&strategy).await.map_err(|e| {
            if is_duplicate_key(&e) {
                StoreError::Duplicate
            } else {
                StoreError::Db(e)
            }
        })?;

        let id = result
            .inserted_id
            .as_object_id()
            .ok_or(StoreError::NotFound)?;
        tracing::info!(
            user_id,
            exchange_id,
            token = %strategy.token,
            strategy_id = %id,
            "strategy_created"
        );
        self.get(id).await?.ok_or(StoreError::NotFound)
    }

    pub async fn get(&self, id: ObjectId) -> Result<Option<Strategy>, StoreError> {
        Ok(self.collection.find_one(doc! { "_id": id }).await?)
    }

    pub async fn list(
        &self,
        user_id: &str,
        exchange_id: Option<&str>,
        token: Option<&str>,
        is_active: Option<bool>,
    ) -> Result<Vec<Strategy>, StoreError> {
        let mut filter = doc! { "user_id": user_id };
        if let Some(ex) = exchange_id {
            filter.insert("exchange_id", ex);
        }
        if let Some(t) = token {
            filter.insert("token", t.to_uppercase());
        }
        if let Some(active) = is_active {
            filter.insert("is_active", active);
        }
        let cursor = self
            .collection
            .find(filter)
            .sort(doc! { "created_at": -1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    /// Every active strategy across all users, the input of a worker tick.
    pub async fn list_active(&self) -> Result<Vec<Strategy>, StoreError> {
        let cursor = self.collection.find(doc! { "is_active": true }).await?;
        Ok(cursor.try_collect().await?)
    }

    pub async fn update_rules(
        &self,
        id: ObjectId,
        rules: Rules,
        is_active: Option<bool>,
    ) -> Result<Strategy, StoreError> {
        let rules_bson = to_bson(&rules)?;
        let mut set = doc! {
            "rules": rules_bson,
            "needs_repair": false,
            "updated_at": Utc::now().timestamp(),
        };
        if let Some(active) = is_active {
            set.insert("is_active", active);
        }
        let updated = self
            .collection
            .find_one_and_update(doc! { "_id": id }, doc! { "$set": set })
            .return_document(mongodb::options::ReturnDocument::After)
            .await?;
        updated.ok_or(StoreError::NotFound)
    }

    pub async fn set_active(&self, id: ObjectId, is_active: bool) -> Result<(), StoreError> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "is_active": is_active, "updated_at": Utc::now().timestamp() } },
            )
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::NotFound);
        }
        tracing::info!(strategy_id = %id, is_active, "strategy_active_flag_set");
        Ok(())
    }

    pub async fn mark_needs_repair(&self, id: ObjectId) -> Result<(), StoreError> {
        self.collection
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "needs_repair": true, "updated_at": Utc::now().timestamp() } },
            )
            .await?;
        tracing::warn!(strategy_id = %id, "strategy_marked_needs_repair");
        Ok(())
    }

    pub async fn delete(&self, id: ObjectId) -> Result<bool, StoreError> {
        let result = self.collection.delete_one(doc! { "_id": id }).await?;
        Ok(result.deleted_count > 0)
    }

    pub async fn delete_for_exchange(
        &self,
        user_id: &str,
        exchange_id: &str,
    ) -> Result<u64, StoreError> {
        let result = self
            .collection
            .delete_many(doc! { "user_id": user_id, "exchange_id": exchange_id })
            .await?;
        Ok(result.deleted_count)
    }

    pub async fn stamp_checked(&self, id: ObjectId) -> Result<(), StoreError> {
        self.collection
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "last_checked_at": Utc::now().timestamp() } },
            )
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // PersistExecution
    // -----------------------------------------------------------------------

    /// Folds one executed order into the strategy's tracking state in a
    /// single atomic update: counters, PnL windows, consumed level sets,
    /// last-execution fields, and the cooldown window.
    ///
    /// Idempotent by `(strategy_id, order_ref)`: a replayed ref leaves the
    /// document untouched and returns `false`.
    pub async fn persist_execution(
        &self,
        id: ObjectId,
        record: &ExecutionRecord,
    ) -> Result<bool, StoreError> {
        let strategy = self.get(id).await?.ok_or(StoreError::NotFound)?;
        let now = Utc::now().timestamp();

        let cooldown_minutes = match record.action {
            OrderSide::Buy => strategy.rules.cooldown.minutes_after_buy,
            OrderSide::Sell => strategy.rules.cooldown.minutes_after_sell,
        };
        let action_str = record.action.as_str();
        let reason_code = record.reason.code();

        let mut inc = doc! {
            "tracking.execution_stats.total_executions": 1_i64,
            "tracking.execution_stats.total_pnl_usd": record.pnl_usd,
            "tracking.execution_stats.daily_pnl_usd": record.pnl_usd,
            "tracking.execution_stats.weekly_pnl_usd": record.pnl_usd,
            "tracking.execution_stats.monthly_pnl_usd": record.pnl_usd,
        };
        match record.action {
            OrderSide::Buy => inc.insert("tracking.execution_stats.total_buys", 1_i64),
            OrderSide::Sell => inc.insert("tracking.execution_stats.total_sells", 1_i64),
        };

        let mut set = doc! {
            "tracking.execution_stats.last_execution_at": now,
            "tracking.execution_stats.last_execution_type": action_str,
            "tracking.execution_stats.last_execution_reason": &reason_code,
            "tracking.execution_stats.last_execution_price": record.price,
            "tracking.execution_stats.last_execution_amount": record.amount,
            "tracking.cooldown_state.cooldown_until": now + i64::from(cooldown_minutes) * 60,
            "tracking.cooldown_state.last_action": action_str,
            "tracking.cooldown_state.last_action_at": now,
            "updated_at": now,
        };

        // A fired trailing stop is consumed: the state re-arms only after a
        // fresh activation gain.
        if record.reason == TriggerReason::TrailingStop {
            set.insert("tracking.trailing_stop_state.is_active", false);
            set.insert("tracking.trailing_stop_state.highest_price_seen", mongodb::bson::Bson::Null);
            set.insert("tracking.trailing_stop_state.current_stop_price", mongodb::bson::Bson::Null);
            set.insert("tracking.trailing_stop_state.activated_at", mongodb::bson::Bson::Null);
        }

        let mut update = doc! {
            "$push": {
                "tracking.execution_stats.applied_order_refs": {
                    "$each": [&record.order_ref],
                    "$slice": -APPLIED_REFS_KEPT,
                }
            },
            "$inc": inc,
            "$set": set,
        };
        match record.reason.consumed_level() {
            Some(ConsumedLevel::TakeProfit(percent)) => {
                update.insert(
                    "$addToSet",
                    doc! { "tracking.execution_stats.executed_tp_levels": percent },
                );
            }
            Some(ConsumedLevel::Dca(percent)) => {
                update.insert(
                    "$addToSet",
                    doc! { "tracking.execution_stats.executed_dca_levels": percent },
                );
            }
            None => {}
        }

        let result = self
            .collection
            .update_one(
                doc! {
                    "_id": id,
                    "tracking.execution_stats.applied_order_refs": { "$ne": &record.order_ref },
                },
                update,
            )
            .await?;

        let applied = result.modified_count > 0;
        if applied {
            tracing::info!(
                strategy_id = %id,
                action = action_str,
                reason = %reason_code,
                price = record.price,
                amount = record.amount,
                pnl_usd = record.pnl_usd,
                "execution_persisted"
            );
        } else {
            tracing::debug!(strategy_id = %id, order_ref = %record.order_ref, "execution_replay_skipped");
        }
        Ok(applied)
    }

    // -----------------------------------------------------------------------
    // UpdateTrailing
    // -----------------------------------------------------------------------

    /// Persists the evaluator's trailing side-effect. Monotonic by
    /// construction: `$max` on the high-water mark, and the active flag
    /// only ever transitions false -> true here.
    pub async fn update_trailing(
        &self,
        id: ObjectId,
        update: &TrailingUpdate,
    ) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();

        if update.is_active {
            self.collection
                .update_one(
                    doc! { "_id": id, "tracking.trailing_stop_state.is_active": false },
                    doc! { "$set": {
                        "tracking.trailing_stop_state.is_active": true,
                        "tracking.trailing_stop_state.activated_at": now,
                    }},
                )
                .await?;
        }

        self.collection
            .update_one(
                doc! { "_id": id },
                doc! {
                    "$max": {
                        "tracking.trailing_stop_state.highest_price_seen": update.highest_price_seen,
                    },
                    "$set": {
                        "tracking.trailing_stop_state.current_stop_price": update.current_stop_price,
                        "updated_at": now,
                    },
                },
            )
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lease
    // -----------------------------------------------------------------------

    /// Conditional-write lease serializing overlapping worker ticks. A
    /// crashed holder's lease simply expires.
    pub async fn acquire_lease(&self, id: ObjectId, ttl_secs: i64) -> Result<Option<String>, StoreError> {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        let result = self
            .collection
            .update_one(
                doc! {
                    "_id": id,
                    "$or": [
                        { "lease_until": mongodb::bson::Bson::Null },
                        { "lease_until": { "$lt": now } },
                    ],
                },
                doc! { "$set": { "lease_until": now + ttl_secs, "lease_token": &token } },
            )
            .await?;

        Ok((result.modified_count > 0).then_some(token))
    }

    pub async fn release_lease(&self, id: ObjectId, token: &str) -> Result<(), StoreError> {
        self.collection
            .update_one(
                doc! { "_id": id, "lease_token": token },
                doc! { "$set": {
                    "lease_until": mongodb::bson::Bson::Null,
                    "lease_token": mongodb::bson::Bson::Null,
                }},
            )
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // PnL window maintenance
    // -----------------------------------------------------------------------

    /// Rolls over expired PnL windows: daily at each strategy's
    /// `reset_hour_utc`, weekly at ISO-week boundaries, monthly on the
    /// first of the month. Returns how many strategies were touched.
    pub async fn reset_pnl_windows(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut cursor = self.collection.find(doc! {}).await?;
        let mut touched = 0u64;

        while let Some(strategy) = cursor.try_next().await? {
            let Some(id) = strategy.id else { continue };
            let stats = &strategy.tracking.execution_stats;

            let daily_key = daily_window_key(now, strategy.rules.risk_management.reset_hour_utc);
            let weekly_key = weekly_window_key(now);
            let monthly_key = monthly_window_key(now);

            let mut set = Document::new();
            if stats.daily_window.as_deref() != Some(daily_key.as_str()) {
                if stats.daily_window.is_some() {
                    set.insert("tracking.execution_stats.daily_pnl_usd", 0.0);
                }
                set.insert("tracking.execution_stats.daily_window", &daily_key);
            }
            if stats.weekly_window.as_deref() != Some(weekly_key.as_str()) {
                if stats.weekly_window.is_some() {
                    set.insert("tracking.execution_stats.weekly_pnl_usd", 0.0);
                }
                set.insert("tracking.execution_stats.weekly_window", &weekly_key);
            }
            if stats.monthly_window.as_deref() != Some(monthly_key.as_str()) {
                if stats.monthly_window.is_some() {
                    set.insert("tracking.execution_stats.monthly_pnl_usd", 0.0);
                }
                set.insert("tracking.execution_stats.monthly_window", &monthly_key);
            }

            if !set.is_empty() {
                self.collection
                    .update_one(doc! { "_id": id }, doc! { "$set": set })
                    .await?;
                touched += 1;
            }
        }

        if touched > 0 {
            tracing::info!(touched, "pnl_windows_rolled");
        }
        Ok(touched)
    }
}

// ---------------------------------------------------------------------------
// Window keys
// ---------------------------------------------------------------------------

pub(crate) fn daily_window_key(now: DateTime<Utc>, reset_hour_utc: u32) -> String {
    // The trading day starts at the configured reset hour, so shift before
    // taking the date.
    let shifted = now - Duration::hours(i64::from(reset_hour_utc));
    shifted.date_naive().to_string()
}

pub(crate) fn weekly_window_key(now: DateTime<Utc>) -> String {
    let week = now.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

pub(crate) fn monthly_window_key(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

fn to_bson<T: serde::Serialize>(value: &T) -> Result<mongodb::bson::Bson, StoreError> {
    mongodb::bson::to_bson(value)
        .map_err(|e| StoreError::Db(mongodb::error::Error::from(e)))
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    matches!(
        *e.kind,
        mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(ref we))
            if we.code == 11000
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_daily_window_respects_reset_hour() {
        // 02:00 UTC with a 03:00 reset hour still belongs to the previous
        // trading day; 04:00 belongs to the new one.
        let before = Utc.with_ymd_and_hms(2026, 8, 2, 2, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 8, 2, 4, 0, 0).unwrap();
        assert_eq!(daily_window_key(before, 3), "2026-08-01");
        assert_eq!(daily_window_key(after, 3), "2026-08-02");
        assert_eq!(daily_window_key(before, 0), "2026-08-02");
    }

    #[test]
    fn test_weekly_window_is_iso_week() {
        // 2026-01-01 falls in ISO week 2026-W01; 2027-01-01 falls in
        // 2026-W53 (week years differ from calendar years at boundaries).
        let jan1 = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(weekly_window_key(jan1), "2026-W01");

        let dec28 = Utc.with_ymd_and_hms(2026, 12, 28, 12, 0, 0).unwrap();
        assert_eq!(weekly_window_key(dec28), "2026-W53");
    }

    #[test]
    fn test_monthly_window_key() {
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 0, 0, 0).unwrap();
        assert_eq!(monthly_window_key(now), "2026-08");
    }

    #[test]
    fn test_window_keys_change_exactly_at_boundaries() {
        let end_of_month = Utc.with_ymd_and_hms(2026, 8, 31, 23, 59, 59).unwrap();
        let start_of_month = Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap();
        assert_ne!(monthly_window_key(end_of_month), monthly_window_key(start_of_month));

        // ISO weeks roll on Monday: 2026-08-02 is a Sunday, 08-03 a Monday.
        let sunday = Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap();
        let monday = Utc.with_ymd_and_hms(2026, 8, 3, 12, 0, 0).unwrap();
        assert_ne!(weekly_window_key(sunday), weekly_window_key(monday));
    }
}
