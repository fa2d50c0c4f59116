use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use serde_json::json;

use super::rules::{Rules, TakeProfitLevel};
use super::{Decision, Evaluation, Tracking, TrailingUpdate, TriggerReason};
use crate::gateway::OrderSide;

const LEVEL_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Default)]
pub struct MarketData {
    pub volume_24h: Option<f64>,
    pub change_24h: Option<f64>,
}

pub struct EvalInput<'a> {
    pub rules: &'a Rules,
    pub tracking: &'a Tracking,
    pub entry_price: f64,
    pub current_price: f64,
    pub holding_amount: f64,
    pub market: MarketData,
}

/// Decides whether a strategy should act on the current price.
///
/// Pure: the caller reads the wall clock once and passes it in; the same
/// inputs always produce the same output. Gates run in a fixed priority
/// order and the first one that triggers or blocks wins; nothing after it
/// is consulted.
pub fn evaluate(input: &EvalInput, now: DateTime<Utc>) -> Evaluation {
    let rules = input.rules;
    let tracking = input.tracking;

    if input.entry_price <= 0.0 || input.current_price <= 0.0 {
        return Evaluation {
            decision: Decision::blocked(json!({ "reason": "invalid_price" })),
            trailing: None,
            pause_requested: false,
            needs_repair: true,
        };
    }

    let change_percent =
        (input.current_price - input.entry_price) / input.entry_price * 100.0;
    let mut needs_repair = false;

    // 1. Cooldown gate.
    if rules.cooldown.enabled {
        if let Some(until) = tracking.cooldown_state.cooldown_until {
            if now.timestamp() < until {
                return Evaluation {
                    decision: Decision::blocked(json!({
                        "cooldown": "blocked",
                        "cooldown_until": until,
                    })),
                    trailing: None,
                    pause_requested: false,
                    needs_repair,
                };
            }
        }
    }

    // 2. Circuit-breaker gate.
    if rules.risk_management.enabled {
        let stats = &tracking.execution_stats;
        let windows = [
            ("daily", stats.daily_pnl_usd, rules.risk_management.max_daily_loss_usd),
            ("weekly", stats.weekly_pnl_usd, rules.risk_management.max_weekly_loss_usd),
            ("monthly", stats.monthly_pnl_usd, rules.risk_management.max_monthly_loss_usd),
        ];
        for (window, pnl, limit) in windows {
            if let Some(limit) = limit {
                if pnl <= -limit {
                    return Evaluation {
                        decision: Decision::blocked(json!({
                            "circuit_breaker": window,
                            "window_pnl_usd": pnl,
                            "limit_usd": limit,
                        })),
                        trailing: None,
                        pause_requested: rules.risk_management.pause_on_limit,
                        needs_repair,
                    };
                }
            }
        }
    }

    // 3. Trading-hours gate.
    if rules.trading_hours.enabled {
        let Ok(tz) = rules.trading_hours.timezone.parse::<Tz>() else {
            return Evaluation {
                decision: Decision::blocked(json!({ "trading_hours": "invalid_timezone" })),
                trailing: None,
                pause_requested: false,
                needs_repair: true,
            };
        };
        let local = now.with_timezone(&tz);
        let hour = local.hour() as u8;
        let day = local.weekday().num_days_from_sunday() as u8;
        if !rules.trading_hours.allowed_hours.contains(&hour)
            || !rules.trading_hours.allowed_days.contains(&day)
        {
            return Evaluation {
                decision: Decision::blocked(json!({
                    "trading_hours": "blocked",
                    "local_hour": hour,
                    "local_day": day,
                })),
                trailing: None,
                pause_requested: false,
                needs_repair,
            };
        }
    }

    // 4. Blackout gate.
    for period in &rules.blackout_periods {
        if period.enabled && now >= period.start && now < period.end {
            return Evaluation {
                decision: Decision::blocked(json!({
                    "blackout": "blocked",
                    "until": period.end.to_rfc3339(),
                })),
                trailing: None,
                pause_requested: false,
                needs_repair,
            };
        }
    }

    // 5. Volume gate. Skipped when the market figure is unknown.
    if rules.volume_check.enabled {
        if let (Some(min), Some(volume)) =
            (rules.volume_check.min_24h_volume_usd, input.market.volume_24h)
        {
            if volume < min {
                return Evaluation {
                    decision: Decision::blocked(json!({
                        "volume_check": "below_minimum",
                        "volume_24h_usd": volume,
                    })),
                    trailing: None,
                    pause_requested: false,
                    needs_repair,
                };
            }
        }
    }

    // 6. Trailing-stop update, then fire check.
    let mut trailing: Option<TrailingUpdate> = None;
    if rules.stop_loss.trailing_enabled {
        let state = &tracking.trailing_stop_state;
        let gain = (input.current_price - input.entry_price) / input.entry_price;
        let active = state.is_active
            || gain >= rules.stop_loss.trailing_activation_percent / 100.0;

        if active {
            let highest = state
                .highest_price_seen
                .unwrap_or(input.current_price)
                .max(input.current_price);
            let stop = highest * (1.0 - rules.stop_loss.trailing_percent / 100.0);
            trailing = Some(TrailingUpdate {
                highest_price_seen: highest,
                current_stop_price: stop,
                is_active: true,
            });

            // Only an already-armed trailing stop can fire; the stop set on
            // the activation pass sits below the activating price.
            if state.is_active && input.current_price <= stop {
                return finalize(
                    Decision::triggered(OrderSide::Sell, TriggerReason::TrailingStop, 100.0),
                    input,
                    trailing,
                    needs_repair,
                );
            }
        }
    }

    // 7. Take-profit levels, ascending, at most one per evaluation.
    let enabled_tp: Vec<&TakeProfitLevel> = rules
        .take_profit_levels
        .iter()
        .filter(|l| l.enabled)
        .collect();
    if !enabled_tp.is_empty() {
        if !rules.take_profit_levels_usable() {
            // Stored rules drifted out of the sum-to-100 invariant; treat
            // every level as disabled and ask for repair.
            needs_repair = true;
        } else {
            let mut ordered: Vec<(usize, &TakeProfitLevel)> =
                rules.take_profit_levels.iter().enumerate().collect();
            ordered.sort_by(|a, b| a.1.percent.total_cmp(&b.1.percent));

            for (rank, (_, level)) in ordered.iter().enumerate() {
                if !level.enabled
                    || level_executed(&tracking.execution_stats.executed_tp_levels, level.percent)
                {
                    continue;
                }
                if input.current_price >= input.entry_price * (1.0 + level.percent / 100.0) {
                    return finalize(
                        Decision::triggered(
                            OrderSide::Sell,
                            TriggerReason::TakeProfit {
                                level: rank + 1,
                                percent: level.percent,
                            },
                            level.quantity_percent,
                        ),
                        input,
                        trailing,
                        needs_repair,
                    );
                }
            }
        }
    }

    // 8. Fixed stop-loss.
    if rules.stop_loss.enabled
        && input.current_price <= input.entry_price * (1.0 - rules.stop_loss.percent / 100.0)
    {
        return finalize(
            Decision::triggered(OrderSide::Sell, TriggerReason::StopLoss, 100.0),
            input,
            trailing,
            needs_repair,
        );
    }

    // 9. Buy-dip / DCA ladder.
    if rules.buy_dip.enabled {
        if rules.buy_dip.dca_enabled {
            if !rules.dca_levels_usable() {
                needs_repair = true;
            } else {
                let mut ordered: Vec<(usize, &super::rules::DcaLevel)> =
                    rules.buy_dip.dca_levels.iter().enumerate().collect();
                ordered.sort_by(|a, b| a.1.percent.total_cmp(&b.1.percent));

                for (rank, (_, level)) in ordered.iter().enumerate() {
                    if level_executed(
                        &tracking.execution_stats.executed_dca_levels,
                        level.percent,
                    ) {
                        continue;
                    }
                    if input.current_price
                        <= input.entry_price * (1.0 - level.percent / 100.0)
                    {
                        return finalize(
                            Decision::triggered(
                                OrderSide::Buy,
                                TriggerReason::Dca {
                                    level: rank + 1,
                                    percent: level.percent,
                                },
                                level.quantity_percent,
                            ),
                            input,
                            trailing,
                            needs_repair,
                        );
                    }
                }
            }
        } else if input.current_price
            <= input.entry_price * (1.0 - rules.buy_dip.percent / 100.0)
        {
            return finalize(
                Decision::triggered(OrderSide::Buy, TriggerReason::BuyDip, 100.0),
                input,
                trailing,
                needs_repair,
            );
        }
    }

    // 10. Nothing fired.
    Evaluation {
        decision: Decision::blocked(json!({
            "change_percent": (change_percent * 100.0).round() / 100.0,
        })),
        trailing,
        pause_requested: false,
        needs_repair,
    }
}

/// Applies the execution clamps to a triggered decision: the effective
/// quantity is capped by `max_order_size_percent`, and an order whose value
/// would land below `min_order_size_usd` is demoted to a non-trigger.
fn finalize(
    mut decision: Decision,
    input: &EvalInput,
    trailing: Option<TrailingUpdate>,
    needs_repair: bool,
) -> Evaluation {
    let quantity = decision
        .quantity_percent
        .unwrap_or(100.0)
        .min(input.rules.execution.max_order_size_percent);
    let order_value_usd = input.holding_amount * quantity / 100.0 * input.current_price;

    if order_value_usd < input.rules.execution.min_order_size_usd {
        return Evaluation {
            decision: Decision::blocked(json!({
                "reason": "below_min_size",
                "order_value_usd": order_value_usd,
                "min_order_size_usd": input.rules.execution.min_order_size_usd,
            })),
            trailing,
            pause_requested: false,
            needs_repair,
        };
    }

    decision.quantity_percent = Some(quantity);
    Evaluation {
        decision,
        trailing,
        pause_requested: false,
        needs_repair,
    }
}

fn level_executed(executed: &[f64], percent: f64) -> bool {
    executed.iter().any(|&p| (p - percent).abs() < LEVEL_EPSILON)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::strategy::rules::{
        BlackoutPeriod, BuyDipRule, CooldownRule, DcaLevel, RiskManagementRule, StopLossRule,
        TradingHoursRule, VolumeCheckRule,
    };
    use crate::strategy::{CooldownState, ExecutionStats, TrailingStopState};

    fn three_level_tp() -> Vec<TakeProfitLevel> {
        vec![
            TakeProfitLevel { percent: 5.0, quantity_percent: 30.0, enabled: true },
            TakeProfitLevel { percent: 10.0, quantity_percent: 40.0, enabled: true },
            TakeProfitLevel { percent: 20.0, quantity_percent: 30.0, enabled: true },
        ]
    }

    fn eval(
        rules: &Rules,
        tracking: &Tracking,
        entry: f64,
        current: f64,
        holding: f64,
    ) -> Evaluation {
        let input = EvalInput {
            rules,
            tracking,
            entry_price: entry,
            current_price: current,
            holding_amount: holding,
            market: MarketData::default(),
        };
        evaluate(&input, Utc::now())
    }

    #[test]
    fn test_take_profit_level_one_fires() {
        let rules = Rules {
            take_profit_levels: three_level_tp(),
            ..Default::default()
        };
        let tracking = Tracking::default();

        let result = eval(&rules, &tracking, 1.00, 1.051, 1000.0);
        let decision = &result.decision;
        assert!(decision.should_trigger);
        assert_eq!(decision.action, Some(OrderSide::Sell));
        assert_eq!(
            decision.reason,
            Some(TriggerReason::TakeProfit { level: 1, percent: 5.0 })
        );
        assert_eq!(decision.quantity_percent, Some(30.0));
    }

    #[test]
    fn test_executed_level_is_skipped_and_next_fires() {
        let rules = Rules {
            take_profit_levels: three_level_tp(),
            ..Default::default()
        };
        let tracking = Tracking {
            execution_stats: ExecutionStats {
                executed_tp_levels: vec![5.0],
                ..Default::default()
            },
            ..Default::default()
        };

        let result = eval(&rules, &tracking, 1.00, 1.12, 1000.0);
        assert_eq!(
            result.decision.reason,
            Some(TriggerReason::TakeProfit { level: 2, percent: 10.0 })
        );
        assert_eq!(result.decision.quantity_percent, Some(40.0));
    }

    #[test]
    fn test_trailing_arms_then_fires_before_take_profit() {
        let rules = Rules {
            take_profit_levels: three_level_tp(),
            stop_loss: StopLossRule {
                percent: 2.0,
                enabled: true,
                trailing_enabled: true,
                trailing_percent: 2.0,
                trailing_activation_percent: 5.0,
            },
            ..Default::default()
        };

        // First pass at 1.25: the trailing stop arms and rides the high.
        let tracking = Tracking::default();
        let result = eval(&rules, &tracking, 1.00, 1.25, 1000.0);
        let update = result.trailing.expect("trailing state must be emitted");
        assert!((update.highest_price_seen - 1.25).abs() < f64::EPSILON);
        assert!((update.current_stop_price - 1.225).abs() < 1e-12);
        assert!(update.is_active);

        // Second pass at 1.22, below the armed stop: trailing wins over the
        // 5% take-profit level that would also fire at this price.
        let tracking = Tracking {
            trailing_stop_state: TrailingStopState {
                is_active: true,
                highest_price_seen: Some(update.highest_price_seen),
                current_stop_price: Some(update.current_stop_price),
                activated_at: Some(0),
            },
            ..Default::default()
        };
        let result = eval(&rules, &tracking, 1.00, 1.22, 1000.0);
        assert_eq!(result.decision.reason, Some(TriggerReason::TrailingStop));
        assert_eq!(result.decision.quantity_percent, Some(100.0));
        assert_eq!(result.decision.action, Some(OrderSide::Sell));
    }

    #[test]
    fn test_trailing_does_not_fire_on_activation_pass() {
        let rules = Rules {
            stop_loss: StopLossRule {
                percent: 2.0,
                enabled: true,
                trailing_enabled: true,
                trailing_percent: 2.0,
                trailing_activation_percent: 5.0,
            },
            ..Default::default()
        };
        let result = eval(&rules, &Tracking::default(), 1.00, 1.06, 1000.0);
        assert!(!result.decision.should_trigger);
        assert!(result.trailing.unwrap().is_active);
    }

    #[test]
    fn test_highest_price_seen_is_monotonic() {
        let rules = Rules {
            stop_loss: StopLossRule {
                percent: 2.0,
                enabled: false,
                trailing_enabled: true,
                trailing_percent: 5.0,
                trailing_activation_percent: 1.0,
            },
            ..Default::default()
        };

        let mut tracking = Tracking::default();
        let mut last_high = 0.0;
        for price in [1.02, 1.10, 1.07, 1.30, 1.28, 1.29] {
            let result = eval(&rules, &tracking, 1.00, price, 1000.0);
            if let Some(update) = result.trailing {
                assert!(
                    update.highest_price_seen >= last_high,
                    "highest_price_seen regressed at price {price}"
                );
                last_high = update.highest_price_seen;
                tracking.trailing_stop_state = TrailingStopState {
                    is_active: update.is_active,
                    highest_price_seen: Some(update.highest_price_seen),
                    current_stop_price: Some(update.current_stop_price),
                    activated_at: Some(0),
                };
            }
            if result.decision.should_trigger {
                break;
            }
        }
        assert!((last_high - 1.30).abs() < f64::EPSILON);
    }

    #[test]
    fn test_dca_ladder_skips_executed_level() {
        let rules = Rules {
            buy_dip: BuyDipRule {
                percent: 5.0,
                enabled: true,
                dca_enabled: true,
                dca_levels: vec![
                    DcaLevel { percent: 5.0, quantity_percent: 50.0 },
                    DcaLevel { percent: 10.0, quantity_percent: 50.0 },
                ],
            },
            ..Default::default()
        };
        let tracking = Tracking {
            execution_stats: ExecutionStats {
                executed_dca_levels: vec![5.0],
                ..Default::default()
            },
            ..Default::default()
        };

        let result = eval(&rules, &tracking, 1.00, 0.90, 1000.0);
        assert_eq!(result.decision.action, Some(OrderSide::Buy));
        assert_eq!(
            result.decision.reason,
            Some(TriggerReason::Dca { level: 2, percent: 10.0 })
        );
        assert_eq!(result.decision.quantity_percent, Some(50.0));
    }

    #[test]
    fn test_simple_buy_dip() {
        let rules = Rules {
            buy_dip: BuyDipRule {
                percent: 3.0,
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = eval(&rules, &Tracking::default(), 100.0, 96.9, 10.0);
        assert_eq!(result.decision.reason, Some(TriggerReason::BuyDip));
        assert_eq!(result.decision.quantity_percent, Some(100.0));
    }

    #[test]
    fn test_circuit_breaker_blocks_and_requests_pause() {
        let rules = Rules {
            take_profit_levels: three_level_tp(),
            risk_management: RiskManagementRule {
                enabled: true,
                max_daily_loss_usd: Some(1000.0),
                pause_on_limit: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let tracking = Tracking {
            execution_stats: ExecutionStats {
                daily_pnl_usd: -1050.0,
                ..Default::default()
            },
            ..Default::default()
        };

        // A price far above every take-profit level still cannot trade.
        let result = eval(&rules, &tracking, 1.00, 2.00, 1000.0);
        assert!(!result.decision.should_trigger);
        assert_eq!(result.decision.metadata["circuit_breaker"], "daily");
        assert!(result.pause_requested);
    }

    #[test]
    fn test_cooldown_blocks_regardless_of_price() {
        let now = Utc::now();
        let rules = Rules {
            take_profit_levels: three_level_tp(),
            cooldown: CooldownRule {
                enabled: true,
                minutes_after_sell: 30,
                minutes_after_buy: 30,
            },
            ..Default::default()
        };
        let tracking = Tracking {
            cooldown_state: CooldownState {
                cooldown_until: Some(now.timestamp() + 600),
                last_action: Some("SELL".into()),
                last_action_at: Some(now.timestamp() - 60),
            },
            ..Default::default()
        };

        let input = EvalInput {
            rules: &rules,
            tracking: &tracking,
            entry_price: 1.00,
            current_price: 1.20,
            holding_amount: 1000.0,
            market: MarketData::default(),
        };
        let result = evaluate(&input, now);
        assert!(!result.decision.should_trigger);
        assert_eq!(result.decision.metadata["cooldown"], "blocked");
    }

    #[test]
    fn test_expired_cooldown_does_not_block() {
        let now = Utc::now();
        let rules = Rules {
            take_profit_levels: three_level_tp(),
            cooldown: CooldownRule {
                enabled: true,
                minutes_after_sell: 30,
                minutes_after_buy: 30,
            },
            ..Default::default()
        };
        let tracking = Tracking {
            cooldown_state: CooldownState {
                cooldown_until: Some(now.timestamp() - 1),
                last_action: Some("SELL".into()),
                last_action_at: None,
            },
            ..Default::default()
        };

        let input = EvalInput {
            rules: &rules,
            tracking: &tracking,
            entry_price: 1.00,
            current_price: 1.06,
            holding_amount: 1000.0,
            market: MarketData::default(),
        };
        assert!(evaluate(&input, now).decision.should_trigger);
    }

    #[test]
    fn test_trading_hours_blocks_outside_window() {
        // 2026-08-03 03:00 UTC is a Monday, 03:00 in UTC.
        let now = Utc.with_ymd_and_hms(2026, 8, 3, 3, 0, 0).unwrap();
        let rules = Rules {
            take_profit_levels: three_level_tp(),
            trading_hours: TradingHoursRule {
                enabled: true,
                timezone: "UTC".into(),
                allowed_hours: vec![9, 10, 11, 12, 13, 14, 15, 16],
                allowed_days: vec![1, 2, 3, 4, 5],
            },
            ..Default::default()
        };

        let tracking = Tracking::default();
        let input = EvalInput {
            rules: &rules,
            tracking: &tracking,
            entry_price: 1.00,
            current_price: 1.10,
            holding_amount: 1000.0,
            market: MarketData::default(),
        };
        let result = evaluate(&input, now);
        assert_eq!(result.decision.metadata["trading_hours"], "blocked");

        // Same Monday at 10:00 passes both hour and day checks.
        let now = Utc.with_ymd_and_hms(2026, 8, 3, 10, 0, 0).unwrap();
        assert!(evaluate(&input, now).decision.should_trigger);
    }

    #[test]
    fn test_blackout_blocks_inside_interval() {
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap();
        let rules = Rules {
            take_profit_levels: three_level_tp(),
            blackout_periods: vec![BlackoutPeriod {
                start: Utc.with_ymd_and_hms(2026, 8, 2, 11, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2026, 8, 2, 13, 0, 0).unwrap(),
                enabled: true,
            }],
            ..Default::default()
        };

        let tracking = Tracking::default();
        let input = EvalInput {
            rules: &rules,
            tracking: &tracking,
            entry_price: 1.00,
            current_price: 1.10,
            holding_amount: 1000.0,
            market: MarketData::default(),
        };
        let result = evaluate(&input, now);
        assert_eq!(result.decision.metadata["blackout"], "blocked");

        // Disabled interval is ignored.
        let mut relaxed = rules.clone();
        relaxed.blackout_periods[0].enabled = false;
        let input = EvalInput { rules: &relaxed, ..input };
        assert!(evaluate(&input, now).decision.should_trigger);
    }

    #[test]
    fn test_volume_gate_blocks_thin_markets_and_skips_unknown() {
        let rules = Rules {
            take_profit_levels: three_level_tp(),
            volume_check: VolumeCheckRule {
                enabled: true,
                min_24h_volume_usd: Some(5_000_000.0),
            },
            ..Default::default()
        };

        let tracking = Tracking::default();
        let input = EvalInput {
            rules: &rules,
            tracking: &tracking,
            entry_price: 1.00,
            current_price: 1.10,
            holding_amount: 1000.0,
            market: MarketData { volume_24h: Some(1_000_000.0), change_24h: None },
        };
        let result = evaluate(&input, Utc::now());
        assert_eq!(result.decision.metadata["volume_check"], "below_minimum");

        // Unknown volume skips the gate rather than blocking.
        let input = EvalInput {
            market: MarketData::default(),
            ..input
        };
        assert!(evaluate(&input, Utc::now()).decision.should_trigger);
    }

    #[test]
    fn test_fixed_stop_loss_sells_everything() {
        let rules = Rules {
            stop_loss: StopLossRule {
                percent: 2.0,
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = eval(&rules, &Tracking::default(), 100.0, 97.9, 10.0);
        assert_eq!(result.decision.reason, Some(TriggerReason::StopLoss));
        assert_eq!(result.decision.quantity_percent, Some(100.0));
    }

    #[test]
    fn test_below_min_size_demotes_decision() {
        let rules = Rules {
            take_profit_levels: three_level_tp(),
            ..Default::default()
        };
        // 30% of 1.0 unit at 1.051 is well under the 10 USD floor.
        let result = eval(&rules, &Tracking::default(), 1.00, 1.051, 1.0);
        assert!(!result.decision.should_trigger);
        assert_eq!(result.decision.metadata["reason"], "below_min_size");
    }

    #[test]
    fn test_max_order_size_caps_quantity() {
        let mut rules = Rules {
            stop_loss: StopLossRule {
                percent: 2.0,
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        rules.execution.max_order_size_percent = 25.0;

        let result = eval(&rules, &Tracking::default(), 100.0, 97.0, 10.0);
        assert!(result.decision.should_trigger);
        assert_eq!(result.decision.quantity_percent, Some(25.0));
    }

    #[test]
    fn test_bad_tp_sum_disables_levels_and_flags_repair() {
        let rules = Rules {
            take_profit_levels: vec![TakeProfitLevel {
                percent: 5.0,
                quantity_percent: 40.0,
                enabled: true,
            }],
            ..Default::default()
        };
        let result = eval(&rules, &Tracking::default(), 1.00, 1.20, 1000.0);
        assert!(!result.decision.should_trigger);
        assert!(result.needs_repair);
    }

    #[test]
    fn test_zero_entry_price_is_a_repair_case() {
        let rules = Rules::default();
        let result = eval(&rules, &Tracking::default(), 0.0, 1.0, 1000.0);
        assert!(!result.decision.should_trigger);
        assert!(result.needs_repair);
        assert_eq!(result.decision.metadata["reason"], "invalid_price");
    }

    #[test]
    fn test_hold_reports_change_percent() {
        let rules = Rules {
            take_profit_levels: three_level_tp(),
            ..Default::default()
        };
        let result = eval(&rules, &Tracking::default(), 1.00, 1.02, 1000.0);
        assert!(!result.decision.should_trigger);
        assert_eq!(result.decision.metadata["change_percent"], 2.0);
    }
}
