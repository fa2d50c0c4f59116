mod api;
mod config;
mod gateway;
mod healthcheck;
mod ledger;
mod metrics;
mod notify;
mod storage;
mod strategy;
mod vault;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use config::Config;
use gateway::registry::GatewayRegistry;
use ledger::PositionLedger;
use notify::Notifier;
use storage::mongo::Mongo;
use strategy::store::StrategyStore;
use vault::Vault;
use worker::snapshot::BrlRateCache;
use worker::{TickerCache, WorkerContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cfg = Config::from_env()?;
    tracing::info!(
        check_interval_minutes = cfg.check_interval_minutes,
        snapshot_interval_hours = cfg.snapshot_interval_hours,
        dry_run = cfg.dry_run,
        "multex_engine_starting"
    );
    if cfg.dry_run {
        tracing::warn!("dry_run_enabled_orders_will_be_simulated");
    }

    healthcheck::wait_for_services(&cfg.database_uri).await?;

    let mongo = Mongo::connect(&cfg.database_uri, &cfg.database_name).await?;
    mongo.ensure_indexes().await?;
    mongo.ensure_exchange_catalog().await?;

    let prometheus = metrics::init();

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let store = StrategyStore::new(mongo.strategies());
    let position_ledger = PositionLedger::new(mongo.positions());
    let credential_vault = Vault::new(mongo.user_exchanges());
    let notifier = Notifier::new(mongo.notifications());
    let registry = Arc::new(GatewayRegistry::from_config(&cfg, http.clone()));

    let worker_ctx = Arc::new(WorkerContext {
        config: cfg.clone(),
        store: store.clone(),
        ledger: position_ledger.clone(),
        vault: credential_vault.clone(),
        registry: registry.clone(),
        notifier: notifier.clone(),
        tickers: TickerCache::new(Duration::from_secs(cfg.ticker_cache_ttl_secs)),
        brl_rate: BrlRateCache::new(http, &cfg.usd_brl_rate_url),
        balance_history: mongo.balance_history(),
    });

    let mut tasks = JoinSet::new();
    let jobs = worker::spawn_all(worker_ctx.clone(), &mut tasks);

    let api_state = Arc::new(api::state::ApiState {
        config: cfg.clone(),
        mongo,
        store,
        ledger: position_ledger,
        vault: credential_vault,
        notifier,
        registry,
        worker: worker_ctx,
        jobs,
        prometheus,
        start_time: std::time::Instant::now(),
    });
    let api_port = cfg.api_port;
    tasks.spawn(async move { api::serve(api_state, api_port).await });

    tracing::info!("multex_engine_running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("multex_engine_shutdown");
        }
        result = async { tasks.join_next().await.unwrap() } => {
            match result {
                Ok(Ok(())) => tracing::error!("task_exited_unexpectedly"),
                Ok(Err(e)) => tracing::error!(error = %e, "task_fatal"),
                Err(e) => tracing::error!(error = %e, "task_panicked"),
            }
        }
    }

    tasks.shutdown().await;
    tracing::info!("multex_engine_stopped");
    Ok(())
}
