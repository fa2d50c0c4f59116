use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mongodb::bson::oid::ObjectId;
use uuid::Uuid;

use super::{orchestrator, WorkerContext};
use crate::gateway::{ExchangeGateway, GatewayError};
use crate::ledger::Position;
use crate::notify::NotificationKind;
use crate::strategy::evaluator::{self, EvalInput, MarketData};
use crate::strategy::Strategy;
use crate::vault::VaultError;

/// Leases outlive the evaluation deadline by a margin so a healthy worker
/// never loses one mid-flight, while a crashed worker's lease expires well
/// before the next tick.
const LEASE_TTL_FACTOR: i64 = 3;

#[derive(Debug, Default)]
struct TickOutcome {
    checked: u64,
    triggered: u64,
    skipped: u64,
    errors: u64,
}

impl TickOutcome {
    fn absorb(&mut self, other: TickOutcome) {
        self.checked += other.checked;
        self.triggered += other.triggered;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

/// One scheduled pass over every active strategy.
///
/// Strategies are grouped by (user, exchange) so one gateway and one
/// ticker fetch serve the whole group; groups run concurrently, strategies
/// within a group sequentially. Per-strategy failures are isolated.
pub async fn run_tick(ctx: Arc<WorkerContext>) -> anyhow::Result<()> {
    let started = std::time::Instant::now();
    let strategies = ctx.store.list_active().await?;
    if strategies.is_empty() {
        tracing::debug!("no_active_strategies");
        return Ok(());
    }

    let tick_id = Uuid::new_v4().to_string();
    let mut groups: HashMap<(String, String), Vec<Strategy>> = HashMap::new();
    for strategy in strategies {
        groups
            .entry((strategy.user_id.clone(), strategy.exchange_id.clone()))
            .or_default()
            .push(strategy);
    }

    let group_runs = groups.into_iter().map(|((user_id, exchange_id), group)| {
        let ctx = ctx.clone();
        let tick_id = tick_id.clone();
        async move { process_group(ctx, &user_id, &exchange_id, group, &tick_id).await }
    });
    let outcomes = futures::future::join_all(group_runs).await;

    let mut total = TickOutcome::default();
    for outcome in outcomes {
        total.absorb(outcome);
    }

    metrics::counter!(crate::metrics::STRATEGIES_CHECKED).increment(total.checked);
    metrics::counter!(crate::metrics::STRATEGIES_TRIGGERED).increment(total.triggered);
    metrics::histogram!(crate::metrics::TICK_DURATION).record(started.elapsed().as_secs_f64());

    tracing::info!(
        checked = total.checked,
        triggered = total.triggered,
        skipped = total.skipped,
        errors = total.errors,
        "strategy_check_completed"
    );
    Ok(())
}

async fn process_group(
    ctx: Arc<WorkerContext>,
    user_id: &str,
    exchange_id: &str,
    strategies: Vec<Strategy>,
    tick_id: &str,
) -> TickOutcome {
    let mut outcome = TickOutcome::default();

    let (kind, credential) = match ctx.vault.get_credential(user_id, exchange_id).await {
        Ok(v) => v,
        Err(VaultError::NotLinked) | Err(VaultError::Disabled) => {
            tracing::debug!(user_id, exchange_id, "exchange_inactive_group_skipped");
            outcome.skipped += strategies.len() as u64;
            return outcome;
        }
        Err(e) => {
            tracing::warn!(user_id, exchange_id, error = %e, "credential_lookup_failed");
            outcome.errors += strategies.len() as u64;
            return outcome;
        }
    };
    let gateway = ctx.registry.build(kind, &credential);

    for strategy in strategies {
        match process_strategy(&ctx, gateway.as_ref(), &strategy, tick_id).await {
            Ok(StrategyOutcome::Triggered) => {
                outcome.checked += 1;
                outcome.triggered += 1;
            }
            Ok(StrategyOutcome::Idle) => outcome.checked += 1,
            Ok(StrategyOutcome::Skipped) => outcome.skipped += 1,
            Err(e) => {
                outcome.errors += 1;
                metrics::counter!(crate::metrics::EVALUATION_ERRORS).increment(1);

                // Bad credentials poison the whole group: disable the link,
                // tell the user, and stop hitting the exchange this tick.
                if matches!(e.downcast_ref::<GatewayError>(), Some(GatewayError::Auth(_))) {
                    tracing::warn!(user_id, exchange_id, error = %e, "auth_failed_disabling_exchange");
                    let _ = ctx.vault.mark_invalid(user_id, exchange_id).await;
                    ctx.notifier
                        .push(
                            user_id,
                            NotificationKind::CredentialsInvalid,
                            "Exchange credentials rejected",
                            &format!(
                                "{exchange_id} rejected your API credentials; the link was disabled."
                            ),
                        )
                        .await;
                    break;
                }
                tracing::error!(
                    user_id,
                    exchange_id,
                    strategy_id = ?strategy.id,
                    error = %e,
                    "strategy_check_failed"
                );
            }
        }
    }
    outcome
}

enum StrategyOutcome {
    Triggered,
    Idle,
    Skipped,
}

async fn process_strategy(
    ctx: &Arc<WorkerContext>,
    gateway: &dyn ExchangeGateway,
    strategy: &Strategy,
    tick_id: &str,
) -> anyhow::Result<StrategyOutcome> {
    let id = strategy
        .id
        .ok_or_else(|| anyhow::anyhow!("strategy document without _id"))?;

    let deadline = Duration::from_secs(ctx.config.evaluation_deadline_secs);
    let Some(lease) = ctx
        .store
        .acquire_lease(id, ctx.config.evaluation_deadline_secs as i64 * LEASE_TTL_FACTOR)
        .await?
    else {
        // Another tick (or instance) holds this strategy.
        tracing::debug!(strategy_id = %id, "lease_held_elsewhere");
        return Ok(StrategyOutcome::Skipped);
    };

    let result = tokio::time::timeout(deadline, evaluate_one(ctx, gateway, strategy, id, tick_id)).await;
    ctx.store.release_lease(id, &lease).await.ok();

    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::warn!(strategy_id = %id, "evaluation_deadline_elapsed");
            Ok(StrategyOutcome::Skipped)
        }
    }
}

async fn evaluate_one(
    ctx: &Arc<WorkerContext>,
    gateway: &dyn ExchangeGateway,
    strategy: &Strategy,
    id: ObjectId,
    tick_id: &str,
) -> anyhow::Result<StrategyOutcome> {
    let Some(position) = load_or_seed_position(ctx, gateway, strategy).await? else {
        tracing::debug!(strategy_id = %id, token = %strategy.token, "no_position_to_evaluate");
        ctx.store.stamp_checked(id).await.ok();
        return Ok(StrategyOutcome::Skipped);
    };

    let ticker = ctx
        .tickers
        .get_or_fetch(gateway, &strategy.exchange_id, &strategy.token)
        .await?;

    let now = Utc::now();
    let input = EvalInput {
        rules: &strategy.rules,
        tracking: &strategy.tracking,
        entry_price: position.entry_price,
        current_price: ticker.last,
        holding_amount: position.amount,
        market: MarketData {
            volume_24h: ticker.volume_24h,
            change_24h: ticker.change_24h,
        },
    };
    let evaluation = evaluator::evaluate(&input, now);

    // Side effects the evaluator requested, persisted before any order so
    // the next tick sees them even if execution fails.
    if let Some(update) = evaluation.trailing {
        ctx.store.update_trailing(id, &update).await?;
    }
    if evaluation.needs_repair && !strategy.needs_repair {
        ctx.store.mark_needs_repair(id).await?;
    }
    if evaluation.pause_requested {
        ctx.store.set_active(id, false).await?;
        ctx.notifier
            .push(
                &strategy.user_id,
                NotificationKind::StrategyPaused,
                "Strategy paused by circuit breaker",
                &format!(
                    "{} on {} hit a loss limit and was paused.",
                    strategy.token, strategy.exchange_id
                ),
            )
            .await;
        ctx.store.stamp_checked(id).await.ok();
        return Ok(StrategyOutcome::Idle);
    }

    let mut outcome = StrategyOutcome::Idle;
    if evaluation.decision.should_trigger {
        let executed = orchestrator::execute_decision(
            ctx,
            gateway,
            strategy,
            &position,
            &ticker,
            &evaluation.decision,
            tick_id,
        )
        .await?;
        if executed {
            outcome = StrategyOutcome::Triggered;
        }
    }

    ctx.store.stamp_checked(id).await.ok();
    Ok(outcome)
}

/// Loads the strategy's position, seeding it from the live exchange
/// balance when the ledger has never seen this asset.
async fn load_or_seed_position(
    ctx: &Arc<WorkerContext>,
    gateway: &dyn ExchangeGateway,
    strategy: &Strategy,
) -> anyhow::Result<Option<Position>> {
    if let Some(position) = ctx
        .ledger
        .get(&strategy.user_id, &strategy.exchange_id, &strategy.token)
        .await?
    {
        return Ok(Some(position));
    }

    tracing::info!(
        user_id = %strategy.user_id,
        exchange_id = %strategy.exchange_id,
        token = %strategy.token,
        "position_missing_syncing_from_balance"
    );

    let balances = crate::gateway::with_retry(|| gateway.fetch_balances()).await?;
    let Some(balance) = balances
        .iter()
        .find(|b| b.asset.eq_ignore_ascii_case(&strategy.token))
    else {
        return Ok(None);
    };
    if balance.total() <= 0.0 {
        return Ok(None);
    }

    let ticker = ctx
        .tickers
        .get_or_fetch(gateway, &strategy.exchange_id, &strategy.token)
        .await?;
    ctx.ledger
        .sync_amount(
            &strategy.user_id,
            &strategy.exchange_id,
            &strategy.token,
            balance.total(),
            ticker.last,
        )
        .await?;

    Ok(ctx
        .ledger
        .get(&strategy.user_id, &strategy.exchange_id, &strategy.token)
        .await?)
}
