use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::binance::BinanceGateway;
use super::coinbase::CoinbaseGateway;
use super::dry_run::DryRunGateway;
use super::rate_limit::TokenBucket;
use super::ExchangeGateway;
use crate::config::Config;
use crate::vault::Credential;

// ---------------------------------------------------------------------------
// ExchangeKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Binance,
    Coinbase,
}

impl ExchangeKind {
    pub const ALL: [ExchangeKind; 2] = [ExchangeKind::Binance, ExchangeKind::Coinbase];

    pub fn id(self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Coinbase => "coinbase",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Binance => "Binance",
            Self::Coinbase => "Coinbase",
        }
    }

    fn default_rate_limit_per_minute(self) -> u32 {
        match self {
            Self::Binance => 1200,
            Self::Coinbase => 600,
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "coinbase" => Ok(Self::Coinbase),
            other => Err(format!("unsupported exchange: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// GatewayRegistry
// ---------------------------------------------------------------------------

/// Builds a gateway for `(exchange kind, credential)` pairs.
///
/// One token bucket per exchange is shared across every instance built for
/// it, so all of a process's traffic to one venue counts against the same
/// budget. When dry-run is enabled every built gateway is wrapped so order
/// submission is synthesized locally.
pub struct GatewayRegistry {
    http: reqwest::Client,
    dry_run: bool,
    binance_url: String,
    coinbase_url: String,
    limiters: HashMap<ExchangeKind, Arc<TokenBucket>>,
}

impl GatewayRegistry {
    pub fn from_config(config: &Config, http: reqwest::Client) -> Self {
        let limiters = ExchangeKind::ALL
            .iter()
            .map(|&kind| {
                let per_minute = config
                    .rate_limit_overrides
                    .get(&kind)
                    .copied()
                    .unwrap_or_else(|| kind.default_rate_limit_per_minute());
                (kind, Arc::new(TokenBucket::new(per_minute)))
            })
            .collect();

        Self {
            http,
            dry_run: config.dry_run,
            binance_url: config.binance_api_url.clone(),
            coinbase_url: config.coinbase_api_url.clone(),
            limiters,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn build(&self, kind: ExchangeKind, credential: &Credential) -> Arc<dyn ExchangeGateway> {
        let limiter = self.limiters[&kind].clone();
        let inner: Arc<dyn ExchangeGateway> = match kind {
            ExchangeKind::Binance => Arc::new(BinanceGateway::new(
                self.http.clone(),
                &self.binance_url,
                credential.clone(),
                limiter,
            )),
            ExchangeKind::Coinbase => Arc::new(CoinbaseGateway::new(
                self.http.clone(),
                &self.coinbase_url,
                credential.clone(),
                limiter,
            )),
        };

        if self.dry_run {
            Arc::new(DryRunGateway::new(inner))
        } else {
            inner
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("binance".parse::<ExchangeKind>().unwrap(), ExchangeKind::Binance);
        assert_eq!("Coinbase".parse::<ExchangeKind>().unwrap(), ExchangeKind::Coinbase);
        assert!("kraken".parse::<ExchangeKind>().is_err());
    }

    #[test]
    fn test_kind_serde_roundtrip() {
        let json = serde_json::to_string(&ExchangeKind::Binance).unwrap();
        assert_eq!(json, r#""binance""#);
        let kind: ExchangeKind = serde_json::from_str(&json).unwrap();
        assert_eq!(kind, ExchangeKind::Binance);
    }

    #[test]
    fn test_registry_builds_each_kind() {
        let config = Config::for_tests();
        let registry = GatewayRegistry::from_config(&config, reqwest::Client::new());
        let credential = Credential {
            api_key: "k".into(),
            api_secret: "s".into(),
            passphrase: None,
        };
        for kind in ExchangeKind::ALL {
            let _gateway = registry.build(kind, &credential);
        }
    }
}
