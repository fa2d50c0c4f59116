use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// ---------------------------------------------------------------------------
// Metric name constants
// ---------------------------------------------------------------------------

pub const STRATEGIES_CHECKED: &str = "multex_strategies_checked_total";
pub const STRATEGIES_TRIGGERED: &str = "multex_strategies_triggered_total";
pub const EVALUATION_ERRORS: &str = "multex_evaluation_errors_total";
pub const ORDERS_SUBMITTED: &str = "multex_orders_submitted_total";
pub const ORDER_FAILURES: &str = "multex_order_failures_total";
pub const SNAPSHOTS_WRITTEN: &str = "multex_balance_snapshots_total";
pub const TICK_DURATION: &str = "multex_tick_duration_seconds";

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

pub fn init() -> PrometheusHandle {
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(TICK_DURATION.to_string()),
            &[0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0],
        )
        .expect("failed to set tick duration buckets");

    let handle = builder
        .install_recorder()
        .expect("failed to install Prometheus metrics recorder");

    describe_metrics();

    handle
}

fn describe_metrics() {
    metrics::describe_counter!(STRATEGIES_CHECKED, "Strategies evaluated across all ticks");
    metrics::describe_counter!(STRATEGIES_TRIGGERED, "Evaluations that produced an executable decision");
    metrics::describe_counter!(EVALUATION_ERRORS, "Per-strategy evaluation failures");
    metrics::describe_counter!(ORDERS_SUBMITTED, "Orders recorded after a fill");
    metrics::describe_counter!(ORDER_FAILURES, "Orders rejected or unfilled");
    metrics::describe_counter!(SNAPSHOTS_WRITTEN, "Balance snapshot documents appended");
    metrics::describe_histogram!(TICK_DURATION, "Wall time of one strategy worker tick (seconds)");
}
