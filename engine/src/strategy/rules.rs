use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

const SUM_TOLERANCE: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Rule subtrees
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    pub percent: f64,
    pub quantity_percent: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StopLossRule {
    pub percent: f64,
    pub enabled: bool,
    pub trailing_enabled: bool,
    pub trailing_percent: f64,
    pub trailing_activation_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaLevel {
    pub percent: f64,
    pub quantity_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuyDipRule {
    pub percent: f64,
    pub enabled: bool,
    pub dca_enabled: bool,
    pub dca_levels: Vec<DcaLevel>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownRule {
    pub enabled: bool,
    pub minutes_after_sell: u32,
    pub minutes_after_buy: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskManagementRule {
    pub enabled: bool,
    pub max_daily_loss_usd: Option<f64>,
    pub max_weekly_loss_usd: Option<f64>,
    pub max_monthly_loss_usd: Option<f64>,
    pub pause_on_limit: bool,
    pub reset_hour_utc: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingHoursRule {
    pub enabled: bool,
    pub timezone: String,
    pub allowed_hours: Vec<u8>,
    pub allowed_days: Vec<u8>,
}

impl Default for TradingHoursRule {
    fn default() -> Self {
        Self {
            enabled: false,
            timezone: "UTC".into(),
            allowed_hours: Vec::new(),
            allowed_days: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackoutPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeCheckRule {
    pub enabled: bool,
    pub min_24h_volume_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionRule {
    pub min_order_size_usd: f64,
    pub max_order_size_percent: f64,
    pub allow_partial_fills: bool,
}

impl Default for ExecutionRule {
    fn default() -> Self {
        Self {
            min_order_size_usd: 10.0,
            max_order_size_percent: 100.0,
            allow_partial_fills: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Rules {
    pub take_profit_levels: Vec<TakeProfitLevel>,
    pub stop_loss: StopLossRule,
    pub buy_dip: BuyDipRule,
    pub cooldown: CooldownRule,
    pub risk_management: RiskManagementRule,
    pub trading_hours: TradingHoursRule,
    pub blackout_periods: Vec<BlackoutPeriod>,
    pub volume_check: VolumeCheckRule,
    pub execution: ExecutionRule,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl Rules {
    /// Converts the legacy flat form into the structured form. Only the
    /// subtrees backing an explicitly-set legacy field are enabled;
    /// everything else stays conservatively disabled.
    pub fn from_legacy(
        take_profit_percent: Option<f64>,
        stop_loss_percent: Option<f64>,
        buy_dip_percent: Option<f64>,
    ) -> Self {
        let mut rules = Self::default();

        if let Some(tp) = take_profit_percent {
            rules.take_profit_levels = vec![TakeProfitLevel {
                percent: tp,
                quantity_percent: 100.0,
                enabled: true,
            }];
        }
        if let Some(sl) = stop_loss_percent {
            rules.stop_loss = StopLossRule {
                percent: sl,
                enabled: true,
                ..Default::default()
            };
        }
        if let Some(dip) = buy_dip_percent {
            rules.buy_dip = BuyDipRule {
                percent: dip,
                enabled: true,
                ..Default::default()
            };
        }
        rules
    }

    /// Named rule presets, mirroring the product's creation templates.
    pub fn template(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "simple" => Some(Self {
                take_profit_levels: vec![TakeProfitLevel {
                    percent: 5.0,
                    quantity_percent: 100.0,
                    enabled: true,
                }],
                stop_loss: StopLossRule {
                    percent: 2.0,
                    enabled: true,
                    ..Default::default()
                },
                buy_dip: BuyDipRule {
                    percent: 3.0,
                    enabled: true,
                    ..Default::default()
                },
                ..Default::default()
            }),
            "conservative" => Some(Self {
                take_profit_levels: vec![
                    TakeProfitLevel { percent: 2.0, quantity_percent: 50.0, enabled: true },
                    TakeProfitLevel { percent: 4.0, quantity_percent: 50.0, enabled: true },
                ],
                stop_loss: StopLossRule {
                    percent: 1.0,
                    enabled: true,
                    trailing_enabled: true,
                    trailing_percent: 0.5,
                    trailing_activation_percent: 1.0,
                },
                buy_dip: BuyDipRule {
                    percent: 2.0,
                    enabled: true,
                    ..Default::default()
                },
                risk_management: RiskManagementRule {
                    enabled: true,
                    max_daily_loss_usd: Some(200.0),
                    max_weekly_loss_usd: Some(500.0),
                    pause_on_limit: true,
                    ..Default::default()
                },
                cooldown: CooldownRule {
                    enabled: true,
                    minutes_after_sell: 60,
                    minutes_after_buy: 30,
                },
                ..Default::default()
            }),
            "aggressive" => Some(Self {
                take_profit_levels: vec![
                    TakeProfitLevel { percent: 5.0, quantity_percent: 30.0, enabled: true },
                    TakeProfitLevel { percent: 10.0, quantity_percent: 40.0, enabled: true },
                    TakeProfitLevel { percent: 20.0, quantity_percent: 30.0, enabled: true },
                ],
                stop_loss: StopLossRule {
                    percent: 3.0,
                    enabled: true,
                    trailing_enabled: true,
                    trailing_percent: 2.0,
                    trailing_activation_percent: 3.0,
                },
                buy_dip: BuyDipRule {
                    percent: 5.0,
                    enabled: true,
                    dca_enabled: true,
                    dca_levels: vec![
                        DcaLevel { percent: 5.0, quantity_percent: 50.0 },
                        DcaLevel { percent: 8.0, quantity_percent: 50.0 },
                    ],
                },
                risk_management: RiskManagementRule {
                    enabled: true,
                    max_daily_loss_usd: Some(1000.0),
                    max_weekly_loss_usd: Some(3000.0),
                    pause_on_limit: true,
                    ..Default::default()
                },
                cooldown: CooldownRule {
                    enabled: true,
                    minutes_after_sell: 15,
                    minutes_after_buy: 10,
                },
                ..Default::default()
            }),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationIssue>> {
        let mut issues = Vec::new();

        self.validate_take_profit(&mut issues);
        self.validate_stop_loss(&mut issues);
        self.validate_buy_dip(&mut issues);
        self.validate_cooldown(&mut issues);
        self.validate_risk_management(&mut issues);
        self.validate_trading_hours(&mut issues);
        self.validate_blackouts(&mut issues);
        self.validate_volume_check(&mut issues);
        self.validate_execution(&mut issues);

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    /// Whether the enabled take-profit levels are usable. Stored rules can
    /// drift out of the sum-to-100 invariant; the evaluator then treats
    /// every level as disabled and flags the strategy for repair.
    pub fn take_profit_levels_usable(&self) -> bool {
        let enabled: Vec<_> = self
            .take_profit_levels
            .iter()
            .filter(|l| l.enabled)
            .collect();
        if enabled.is_empty() {
            return false;
        }
        let sum: f64 = enabled.iter().map(|l| l.quantity_percent).sum();
        (sum - 100.0).abs() < SUM_TOLERANCE
    }

    pub fn dca_levels_usable(&self) -> bool {
        if self.buy_dip.dca_levels.is_empty() {
            return false;
        }
        let sum: f64 = self
            .buy_dip
            .dca_levels
            .iter()
            .map(|l| l.quantity_percent)
            .sum();
        (sum - 100.0).abs() < SUM_TOLERANCE
    }

    fn validate_take_profit(&self, issues: &mut Vec<ValidationIssue>) {
        let mut sum = 0.0;
        for (i, level) in self.take_profit_levels.iter().enumerate() {
            let field = format!("take_profit_levels[{i}]");
            if level.percent <= 0.0 {
                push(issues, &field, "percent must be positive");
            }
            if level.quantity_percent <= 0.0 || level.quantity_percent > 100.0 {
                push(issues, &field, "quantity_percent must be within (0, 100]");
            }
            if level.enabled {
                sum += level.quantity_percent;
                let duplicate = self.take_profit_levels[..i]
                    .iter()
                    .any(|prev| prev.enabled && (prev.percent - level.percent).abs() < SUM_TOLERANCE);
                if duplicate {
                    push(issues, &field, "duplicate percent among enabled levels");
                }
            }
        }
        let any_enabled = self.take_profit_levels.iter().any(|l| l.enabled);
        if any_enabled && (sum - 100.0).abs() > SUM_TOLERANCE {
            push(
                issues,
                "take_profit_levels",
                &format!("enabled quantity_percent values must sum to 100, got {sum}"),
            );
        }
    }

    fn validate_stop_loss(&self, issues: &mut Vec<ValidationIssue>) {
        let sl = &self.stop_loss;
        if sl.enabled && sl.percent <= 0.0 {
            push(issues, "stop_loss.percent", "must be positive when enabled");
        }
        if sl.trailing_enabled {
            if sl.trailing_percent <= 0.0 {
                push(
                    issues,
                    "stop_loss.trailing_percent",
                    "must be positive when trailing is enabled",
                );
            }
            if sl.trailing_activation_percent < 0.0 {
                push(
                    issues,
                    "stop_loss.trailing_activation_percent",
                    "must not be negative",
                );
            }
        }
    }

    fn validate_buy_dip(&self, issues: &mut Vec<ValidationIssue>) {
        let dip = &self.buy_dip;
        if dip.enabled && !dip.dca_enabled && dip.percent <= 0.0 {
            push(issues, "buy_dip.percent", "must be positive when enabled");
        }
        if dip.dca_enabled {
            if dip.dca_levels.is_empty() {
                push(issues, "buy_dip.dca_levels", "at least one level is required");
                return;
            }
            let mut sum = 0.0;
            for (i, level) in dip.dca_levels.iter().enumerate() {
                let field = format!("buy_dip.dca_levels[{i}]");
                if level.percent <= 0.0 {
                    push(issues, &field, "percent must be positive");
                }
                if level.quantity_percent <= 0.0 || level.quantity_percent > 100.0 {
                    push(issues, &field, "quantity_percent must be within (0, 100]");
                }
                if dip.dca_levels[..i]
                    .iter()
                    .any(|prev| (prev.percent - level.percent).abs() < SUM_TOLERANCE)
                {
                    push(issues, &field, "duplicate percent among levels");
                }
                sum += level.quantity_percent;
            }
            if (sum - 100.0).abs() > SUM_TOLERANCE {
                push(
                    issues,
                    "buy_dip.dca_levels",
                    &format!("quantity_percent values must sum to 100, got {sum}"),
                );
            }
        }
    }

    fn validate_cooldown(&self, _issues: &mut Vec<ValidationIssue>) {
        // Unsigned minutes cannot be negative; nothing further to check.
    }

    fn validate_risk_management(&self, issues: &mut Vec<ValidationIssue>) {
        let rm = &self.risk_management;
        for (field, value) in [
            ("risk_management.max_daily_loss_usd", rm.max_daily_loss_usd),
            ("risk_management.max_weekly_loss_usd", rm.max_weekly_loss_usd),
            ("risk_management.max_monthly_loss_usd", rm.max_monthly_loss_usd),
        ] {
            if let Some(v) = value {
                if v <= 0.0 {
                    push(issues, field, "must be positive");
                }
            }
        }
        if rm.reset_hour_utc > 23 {
            push(issues, "risk_management.reset_hour_utc", "must be within 0..=23");
        }
    }

    fn validate_trading_hours(&self, issues: &mut Vec<ValidationIssue>) {
        let th = &self.trading_hours;
        if !th.enabled {
            return;
        }
        if th.timezone.parse::<Tz>().is_err() {
            push(
                issues,
                "trading_hours.timezone",
                &format!("unknown timezone: {}", th.timezone),
            );
        }
        if th.allowed_hours.iter().any(|&h| h > 23) {
            push(issues, "trading_hours.allowed_hours", "hours must be within 0..=23");
        }
        if th.allowed_days.iter().any(|&d| d > 6) {
            push(issues, "trading_hours.allowed_days", "days must be within 0..=6");
        }
    }

    fn validate_blackouts(&self, issues: &mut Vec<ValidationIssue>) {
        for (i, period) in self.blackout_periods.iter().enumerate() {
            if period.end <= period.start {
                push(
                    issues,
                    &format!("blackout_periods[{i}]"),
                    "end must be after start",
                );
            }
        }
    }

    fn validate_volume_check(&self, issues: &mut Vec<ValidationIssue>) {
        if let Some(min) = self.volume_check.min_24h_volume_usd {
            if min < 0.0 {
                push(issues, "volume_check.min_24h_volume_usd", "must not be negative");
            }
        }
    }

    fn validate_execution(&self, issues: &mut Vec<ValidationIssue>) {
        let ex = &self.execution;
        if ex.min_order_size_usd <= 0.0 {
            push(issues, "execution.min_order_size_usd", "must be positive");
        }
        if ex.max_order_size_percent <= 0.0 || ex.max_order_size_percent > 100.0 {
            push(
                issues,
                "execution.max_order_size_percent",
                "must be within (0, 100]",
            );
        }
    }
}

fn push(issues: &mut Vec<ValidationIssue>, field: &str, message: &str) {
    issues.push(ValidationIssue {
        field: field.to_string(),
        message: message.to_string(),
    });
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_normalization_enables_only_set_fields() {
        let rules = Rules::from_legacy(Some(5.0), None, None);

        assert_eq!(rules.take_profit_levels.len(), 1);
        assert!((rules.take_profit_levels[0].percent - 5.0).abs() < f64::EPSILON);
        assert!((rules.take_profit_levels[0].quantity_percent - 100.0).abs() < f64::EPSILON);
        assert!(!rules.stop_loss.enabled, "stop loss stays disabled");
        assert!(!rules.buy_dip.enabled, "buy dip stays disabled");
        assert!(!rules.cooldown.enabled);
        assert!(!rules.trading_hours.enabled);
    }

    #[test]
    fn test_legacy_normalization_full_triple() {
        let rules = Rules::from_legacy(Some(8.0), Some(2.5), Some(3.0));
        assert!(rules.validate().is_ok());
        assert!(rules.stop_loss.enabled);
        assert!((rules.stop_loss.percent - 2.5).abs() < f64::EPSILON);
        assert!(rules.buy_dip.enabled);
        assert!((rules.buy_dip.percent - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_templates_validate() {
        for name in ["simple", "conservative", "aggressive"] {
            let rules = Rules::template(name).unwrap();
            assert!(rules.validate().is_ok(), "template {name} must be valid");
        }
        assert!(Rules::template("yolo").is_none());
    }

    #[test]
    fn test_tp_sum_must_be_100() {
        let mut rules = Rules::template("aggressive").unwrap();
        rules.take_profit_levels[0].quantity_percent = 50.0;

        let issues = rules.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.field == "take_profit_levels"));
    }

    #[test]
    fn test_disabled_levels_do_not_count_toward_sum() {
        let rules = Rules {
            take_profit_levels: vec![
                TakeProfitLevel { percent: 5.0, quantity_percent: 60.0, enabled: true },
                TakeProfitLevel { percent: 10.0, quantity_percent: 40.0, enabled: true },
                TakeProfitLevel { percent: 20.0, quantity_percent: 90.0, enabled: false },
            ],
            ..Default::default()
        };
        assert!(rules.validate().is_ok());
        assert!(rules.take_profit_levels_usable());
    }

    #[test]
    fn test_out_of_sum_levels_are_unusable_but_flagged() {
        let rules = Rules {
            take_profit_levels: vec![TakeProfitLevel {
                percent: 5.0,
                quantity_percent: 40.0,
                enabled: true,
            }],
            ..Default::default()
        };
        assert!(rules.validate().is_err());
        assert!(!rules.take_profit_levels_usable());
    }

    #[test]
    fn test_trailing_requires_positive_distance() {
        let rules = Rules {
            stop_loss: StopLossRule {
                percent: 2.0,
                enabled: true,
                trailing_enabled: true,
                trailing_percent: 0.0,
                trailing_activation_percent: 1.0,
            },
            ..Default::default()
        };
        let issues = rules.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.field == "stop_loss.trailing_percent"));
    }

    #[test]
    fn test_dca_levels_sum_and_uniqueness() {
        let rules = Rules {
            buy_dip: BuyDipRule {
                percent: 5.0,
                enabled: true,
                dca_enabled: true,
                dca_levels: vec![
                    DcaLevel { percent: 5.0, quantity_percent: 50.0 },
                    DcaLevel { percent: 5.0, quantity_percent: 50.0 },
                ],
            },
            ..Default::default()
        };
        let issues = rules.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.message.contains("duplicate")));
    }

    #[test]
    fn test_trading_hours_timezone_validation() {
        let rules = Rules {
            trading_hours: TradingHoursRule {
                enabled: true,
                timezone: "Mars/Olympus_Mons".into(),
                allowed_hours: vec![9, 10, 11],
                allowed_days: vec![1, 2, 3, 4, 5],
            },
            ..Default::default()
        };
        let issues = rules.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.field == "trading_hours.timezone"));

        let rules = Rules {
            trading_hours: TradingHoursRule {
                enabled: true,
                timezone: "America/Sao_Paulo".into(),
                allowed_hours: vec![9, 10, 11],
                allowed_days: vec![1, 2, 3, 4, 5],
            },
            ..Default::default()
        };
        assert!(rules.validate().is_ok());
    }

    #[test]
    fn test_rules_deserialize_with_omitted_subtrees() {
        let rules: Rules = serde_json::from_value(serde_json::json!({
            "take_profit_levels": [
                {"percent": 5.0, "quantity_percent": 100.0}
            ]
        }))
        .unwrap();
        assert!(rules.take_profit_levels[0].enabled, "enabled defaults to true");
        assert!(!rules.stop_loss.enabled);
        assert!(!rules.volume_check.enabled);
        assert!((rules.execution.min_order_size_usd - 10.0).abs() < f64::EPSILON);
        assert!((rules.execution.max_order_size_percent - 100.0).abs() < f64::EPSILON);
    }
}
