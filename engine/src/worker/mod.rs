pub mod maintenance;
pub mod orchestrator;
pub mod snapshot;
pub mod strategy_worker;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{Timelike, Utc};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::Config;
use crate::gateway::registry::GatewayRegistry;
use crate::gateway::{with_retry, ExchangeGateway, GatewayError, Ticker};
use crate::ledger::PositionLedger;
use crate::notify::Notifier;
use crate::strategy::store::StrategyStore;
use crate::vault::Vault;

// ---------------------------------------------------------------------------
// WorkerContext
// ---------------------------------------------------------------------------

/// Everything the background jobs share. Cheap to clone behind an Arc.
pub struct WorkerContext {
    pub config: Config,
    pub store: StrategyStore,
    pub ledger: PositionLedger,
    pub vault: Vault,
    pub registry: Arc<GatewayRegistry>,
    pub notifier: Notifier,
    pub tickers: TickerCache,
    pub brl_rate: snapshot::BrlRateCache,
    pub balance_history: mongodb::Collection<snapshot::BalanceSnapshot>,
}

// ---------------------------------------------------------------------------
// TickerCache
// ---------------------------------------------------------------------------

struct CachedTicker {
    ticker: Ticker,
    fetched_at: Instant,
}

/// Short-TTL in-process ticker cache, one entry per (exchange, token).
/// Amortizes gateway calls when many strategies share a symbol within a
/// tick.
pub struct TickerCache {
    cache: RwLock<HashMap<(String, String), CachedTicker>>,
    ttl: Duration,
}

impl TickerCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn get_or_fetch(
        &self,
        gateway: &dyn ExchangeGateway,
        exchange_id: &str,
        token: &str,
    ) -> Result<Ticker, GatewayError> {
        let key = (exchange_id.to_string(), token.to_uppercase());
        {
            let cache = self.cache.read().unwrap();
            if let Some(entry) = cache.get(&key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.ticker.clone());
                }
            }
        }

        let ticker = with_retry(|| gateway.fetch_ticker(token)).await?;

        let mut cache = self.cache.write().unwrap();
        cache.insert(
            key,
            CachedTicker {
                ticker: ticker.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(ticker)
    }

    #[cfg(test)]
    pub fn put(&self, exchange_id: &str, token: &str, ticker: Ticker) {
        let mut cache = self.cache.write().unwrap();
        cache.insert(
            (exchange_id.to_string(), token.to_uppercase()),
            CachedTicker {
                ticker,
                fetched_at: Instant::now(),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Job control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    StrategyWorker,
    BalanceSnapshot,
}

impl JobKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::StrategyWorker => "strategy_worker",
            Self::BalanceSnapshot => "balance_snapshot",
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strategy_worker" => Ok(Self::StrategyWorker),
            "balance_snapshot" => Ok(Self::BalanceSnapshot),
            other => Err(format!("unknown job: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JobStatus {
    pub running: bool,
    pub last_run_at: Option<i64>,
    pub last_duration_ms: Option<u64>,
    pub run_count: u64,
    pub last_error: Option<String>,
}

/// Start/stop/trigger surface for one recurring job, backing the job
/// control API.
pub struct JobControl {
    enabled: watch::Sender<bool>,
    trigger: Notify,
    status: Mutex<JobStatus>,
}

impl JobControl {
    pub fn new() -> Self {
        let (enabled, _) = watch::channel(true);
        Self {
            enabled,
            trigger: Notify::new(),
            status: Mutex::new(JobStatus {
                running: true,
                ..Default::default()
            }),
        }
    }

    pub fn start(&self) {
        self.enabled.send_replace(true);
        self.status.lock().unwrap().running = true;
    }

    pub fn stop(&self) {
        self.enabled.send_replace(false);
        self.status.lock().unwrap().running = false;
    }

    pub fn restart(&self) {
        self.start();
        self.trigger_now();
    }

    /// Queues one immediate run, even while stopped.
    pub fn trigger_now(&self) {
        self.trigger.notify_one();
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    pub fn status(&self) -> JobStatus {
        self.status.lock().unwrap().clone()
    }

    fn record_run(&self, started: Instant, error: Option<String>) {
        let mut status = self.status.lock().unwrap();
        status.last_run_at = Some(Utc::now().timestamp());
        status.last_duration_ms = Some(started.elapsed().as_millis() as u64);
        status.run_count += 1;
        status.last_error = error;
    }
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct JobHandles {
    pub strategy_worker: Arc<JobControl>,
    pub balance_snapshot: Arc<JobControl>,
}

impl JobHandles {
    pub fn get(&self, kind: JobKind) -> &Arc<JobControl> {
        match kind {
            JobKind::StrategyWorker => &self.strategy_worker,
            JobKind::BalanceSnapshot => &self.balance_snapshot,
        }
    }
}

// ---------------------------------------------------------------------------
// Job loop
// ---------------------------------------------------------------------------

/// Drives one recurring job: a fixed cadence plus manual triggers, with
/// missed ticks skipped rather than queued. `align_to_hour` delays the
/// first scheduled run to the top of the next hour.
pub async fn run_job<F, Fut>(
    name: &'static str,
    ctl: Arc<JobControl>,
    period: Duration,
    align_to_hour: bool,
    run_immediately: bool,
    mut task: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    if align_to_hour {
        let now = Utc::now();
        let into_hour = u64::from(now.minute()) * 60 + u64::from(now.second());
        let wait = 3600 - into_hour.min(3599);
        tracing::info!(task = name, wait_secs = wait, "job_aligning_to_hour");
        tokio::time::sleep(Duration::from_secs(wait)).await;
    }

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    if !run_immediately && !align_to_hour {
        // interval fires immediately by default; burn the first tick.
        interval.tick().await;
    }

    tracing::info!(task = name, period_secs = period.as_secs(), "job_started");

    loop {
        let triggered = tokio::select! {
            _ = interval.tick() => false,
            _ = ctl.trigger.notified() => true,
        };

        if !triggered && !ctl.is_enabled() {
            continue;
        }

        let started = Instant::now();
        match task().await {
            Ok(()) => ctl.record_run(started, None),
            Err(e) => {
                tracing::error!(task = name, error = %e, "job_run_failed");
                ctl.record_run(started, Some(e.to_string()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Restart policy
// ---------------------------------------------------------------------------

const RESTART_BASE_DELAY: Duration = Duration::from_secs(2);
const RESTART_MAX_DELAY: Duration = Duration::from_secs(300);
/// A loop that survived this long is considered healthy again and its
/// strike count resets.
const HEALTHY_RUN: Duration = Duration::from_secs(120);

fn restart_delay(strikes: u32) -> Duration {
    let doublings = strikes.saturating_sub(1).min(8);
    (RESTART_BASE_DELAY * 2u32.pow(doublings)).min(RESTART_MAX_DELAY)
}

/// Keeps one background loop alive forever.
///
/// The loops spawned here have no clean exit, so any return is a fault,
/// `Ok` included. Each fault adds a strike and the rebuild delay doubles
/// per strike up to the cap; a run that stayed up past `HEALTHY_RUN`
/// clears the strikes first.
async fn keep_alive<F, Fut>(name: &'static str, mut build: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    let mut strikes: u32 = 0;
    loop {
        let started = Instant::now();
        let fault = match build().await {
            Ok(()) => "loop returned".to_string(),
            Err(e) => e.to_string(),
        };

        if started.elapsed() >= HEALTHY_RUN {
            strikes = 0;
        }
        strikes += 1;

        let delay = restart_delay(strikes);
        tracing::error!(
            task = name,
            fault = %fault,
            strikes,
            delay_secs = delay.as_secs(),
            "background_loop_restarting"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Spawns the recurring jobs into the supplied task set, each kept alive
/// through faults by the restart policy above.
pub fn spawn_all(
    ctx: Arc<WorkerContext>,
    tasks: &mut JoinSet<anyhow::Result<()>>,
) -> JobHandles {
    let handles = JobHandles {
        strategy_worker: Arc::new(JobControl::new()),
        balance_snapshot: Arc::new(JobControl::new()),
    };

    let worker_ctx = ctx.clone();
    let worker_ctl = handles.strategy_worker.clone();
    let worker_period = Duration::from_secs(ctx.config.check_interval_minutes * 60);
    tasks.spawn(async move {
        keep_alive("strategy_worker", move || {
            let ctx = worker_ctx.clone();
            let ctl = worker_ctl.clone();
            async move {
                run_job("strategy_worker", ctl, worker_period, false, true, || {
                    strategy_worker::run_tick(ctx.clone())
                })
                .await
            }
        })
        .await
    });

    let snap_ctx = ctx.clone();
    let snap_ctl = handles.balance_snapshot.clone();
    let snap_period = Duration::from_secs(ctx.config.snapshot_interval_hours * 3600);
    tasks.spawn(async move {
        keep_alive("balance_snapshot", move || {
            let ctx = snap_ctx.clone();
            let ctl = snap_ctl.clone();
            async move {
                run_job("balance_snapshot", ctl, snap_period, true, false, || {
                    snapshot::run_snapshot(ctx.clone())
                })
                .await
            }
        })
        .await
    });

    let maint_store = ctx.store.clone();
    tasks.spawn(async move {
        keep_alive("pnl_window_maintenance", move || {
            maintenance::run(maint_store.clone())
        })
        .await
    });

    handles
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
