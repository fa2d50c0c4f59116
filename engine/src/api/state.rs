use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::gateway::registry::GatewayRegistry;
use crate::ledger::PositionLedger;
use crate::notify::Notifier;
use crate::storage::mongo::Mongo;
use crate::strategy::store::StrategyStore;
use crate::vault::Vault;
use crate::worker::{JobHandles, WorkerContext};

pub struct ApiState {
    pub config: Config,
    pub mongo: Mongo,
    pub store: StrategyStore,
    pub ledger: PositionLedger,
    pub vault: Vault,
    pub notifier: Notifier,
    pub registry: Arc<GatewayRegistry>,
    pub worker: Arc<WorkerContext>,
    pub jobs: JobHandles,
    pub prometheus: PrometheusHandle,
    pub start_time: std::time::Instant,
}
