use std::collections::HashMap;

use anyhow::Result;

use crate::gateway::registry::ExchangeKind;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_uri: String,
    pub database_name: String,
    pub api_port: u16,
    pub jwt_secret: String,
    pub check_interval_minutes: u64,
    pub snapshot_interval_hours: u64,
    pub dry_run: bool,
    pub evaluation_deadline_secs: u64,
    pub ticker_cache_ttl_secs: u64,
    pub binance_api_url: String,
    pub coinbase_api_url: String,
    pub usd_brl_rate_url: String,
    pub rate_limit_overrides: HashMap<ExchangeKind, u32>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_uri = std::env::var("DATABASE_URI")
            .map_err(|_| anyhow::anyhow!("DATABASE_URI is required"))?;
        let jwt_secret = std::env::var("JWT_SECRET")
            .map_err(|_| anyhow::anyhow!("JWT_SECRET is required"))?;

        let check_interval_minutes = parse_env("STRATEGY_CHECK_INTERVAL_MINUTES", 5)?;
        if !(1..=60).contains(&check_interval_minutes) {
            anyhow::bail!(
                "STRATEGY_CHECK_INTERVAL_MINUTES must be within 1..=60, got {check_interval_minutes}"
            );
        }

        let snapshot_interval_hours = parse_env("SNAPSHOT_INTERVAL_HOURS", 4)?;
        if !(1..=24).contains(&snapshot_interval_hours) {
            anyhow::bail!(
                "SNAPSHOT_INTERVAL_HOURS must be within 1..=24, got {snapshot_interval_hours}"
            );
        }

        let mut rate_limit_overrides = HashMap::new();
        for kind in ExchangeKind::ALL {
            let var = format!("RATE_LIMIT_{}_PER_MINUTE", kind.id().to_uppercase());
            if let Ok(val) = std::env::var(&var) {
                let per_minute: u32 = val
                    .parse()
                    .map_err(|_| anyhow::anyhow!("{var} must be a positive integer"))?;
                if per_minute == 0 {
                    anyhow::bail!("{var} must be a positive integer");
                }
                rate_limit_overrides.insert(kind, per_minute);
            }
        }

        Ok(Self {
            database_uri,
            database_name: std::env::var("DATABASE_NAME").unwrap_or_else(|_| "multex".into()),
            api_port: parse_env("API_PORT", 8080)?,
            jwt_secret,
            check_interval_minutes,
            snapshot_interval_hours,
            dry_run: std::env::var("STRATEGY_DRY_RUN")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            evaluation_deadline_secs: parse_env("EVALUATION_DEADLINE_SECS", 30)?,
            ticker_cache_ttl_secs: parse_env("TICKER_CACHE_TTL_SECS", 30)?,
            binance_api_url: std::env::var("BINANCE_API_URL")
                .unwrap_or_else(|_| "https://api.binance.com".into()),
            coinbase_api_url: std::env::var("COINBASE_API_URL")
                .unwrap_or_else(|_| "https://api.coinbase.com".into()),
            usd_brl_rate_url: std::env::var("USD_BRL_RATE_URL")
                .unwrap_or_else(|_| "https://economia.awesomeapi.com.br/last/USD-BRL".into()),
            rate_limit_overrides,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            database_uri: "mongodb://localhost:27017".into(),
            database_name: "multex_test".into(),
            api_port: 0,
            jwt_secret: "test-secret".into(),
            check_interval_minutes: 5,
            snapshot_interval_hours: 4,
            dry_run: true,
            evaluation_deadline_secs: 30,
            ticker_cache_ttl_secs: 30,
            binance_api_url: "http://localhost:9001".into(),
            coinbase_api_url: "http://localhost:9002".into(),
            usd_brl_rate_url: "http://localhost:9003/last/USD-BRL".into(),
            rate_limit_overrides: HashMap::new(),
        }
    }
}

fn parse_env<T>(var: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
{
    match std::env::var(var) {
        Ok(val) => val
            .parse()
            .map_err(|_| anyhow::anyhow!("{var} has an invalid value: {val}")),
        Err(_) => Ok(default),
    }
}
