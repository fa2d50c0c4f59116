use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;

use crate::strategy::store::StrategyStore;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Hourly sweep that rolls expired PnL windows: daily at each strategy's
/// configured reset hour, weekly on ISO-week boundaries, monthly on the
/// first of the month.
pub async fn run(store: StrategyStore) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!("pnl_window_maintenance_started");

    loop {
        interval.tick().await;
        if let Err(e) = store.reset_pnl_windows(Utc::now()).await {
            tracing::warn!(error = %e, "pnl_window_sweep_failed");
        }
    }
}
