use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use tower::ServiceExt;

use super::auth::issue_token;
use super::state::ApiState;
use crate::config::Config;
use crate::gateway::registry::GatewayRegistry;
use crate::ledger::PositionLedger;
use crate::notify::Notifier;
use crate::storage::mongo::Mongo;
use crate::strategy::store::StrategyStore;
use crate::vault::Vault;
use crate::worker::snapshot::BrlRateCache;
use crate::worker::{JobControl, JobHandles, TickerCache, WorkerContext};

async fn test_state() -> Arc<ApiState> {
    let config = Config::for_tests();
    let mongo = Mongo::connect_lazy(&config.database_uri, &config.database_name)
        .await
        .unwrap();
    let http = reqwest::Client::new();

    let store = StrategyStore::new(mongo.strategies());
    let ledger = PositionLedger::new(mongo.positions());
    let vault = Vault::new(mongo.user_exchanges());
    let notifier = Notifier::new(mongo.notifications());
    let registry = Arc::new(GatewayRegistry::from_config(&config, http.clone()));

    let worker = Arc::new(WorkerContext {
        config: config.clone(),
        store: store.clone(),
        ledger: ledger.clone(),
        vault: vault.clone(),
        registry: registry.clone(),
        notifier: notifier.clone(),
        tickers: TickerCache::new(Duration::from_secs(config.ticker_cache_ttl_secs)),
        brl_rate: BrlRateCache::new(http, &config.usd_brl_rate_url),
        balance_history: mongo.balance_history(),
    });

    Arc::new(ApiState {
        config,
        mongo,
        store,
        ledger,
        vault,
        notifier,
        registry,
        worker,
        jobs: JobHandles {
            strategy_worker: Arc::new(JobControl::new()),
            balance_snapshot: Arc::new(JobControl::new()),
        },
        prometheus: PrometheusBuilder::new().build_recorder().handle(),
        start_time: std::time::Instant::now(),
    })
}

fn bearer(state: &ApiState, user_id: &str) -> String {
    format!("Bearer {}", issue_token(&state.config.jwt_secret, user_id, 3600))
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_is_public() {
    let state = test_state().await;
    let app = super::router(state);

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = body_json(resp).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["status"], "ok");
    assert_eq!(json["error"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_protected_route_requires_token() {
    let state = test_state().await;
    let app = super::router(state);

    let req = Request::builder()
        .uri("/api/v1/strategies?user_id=u1")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let json = body_json(resp).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["type"], "unauthorized");
}

#[tokio::test]
async fn test_expired_token_rejected() {
    let state = test_state().await;
    let token = issue_token(&state.config.jwt_secret, "u1", -10);
    let app = super::router(state);

    let req = Request::builder()
        .uri("/api/v1/strategies?user_id=u1")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_list_with_foreign_user_id_is_forbidden() {
    let state = test_state().await;
    let auth = bearer(&state, "u1");
    let app = super::router(state);

    let req = Request::builder()
        .uri("/api/v1/strategies?user_id=someone-else")
        .header("authorization", auth)
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let json = body_json(resp).await;
    assert_eq!(json["error"]["type"], "unauthorized");
}

#[tokio::test]
async fn test_malformed_strategy_id_is_a_validation_error() {
    let state = test_state().await;
    let auth = bearer(&state, "u1");
    let app = super::router(state);

    let req = Request::builder()
        .uri("/api/v1/strategies/not-an-object-id")
        .header("authorization", auth)
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let json = body_json(resp).await;
    assert_eq!(json["error"]["type"], "validation_error");
}

#[tokio::test]
async fn test_create_with_foreign_user_id_is_forbidden() {
    let state = test_state().await;
    let auth = bearer(&state, "u1");
    let app = super::router(state);

    let body = serde_json::json!({
        "user_id": "someone-else",
        "exchange_id": "binance",
        "token": "BTC",
        "take_profit_percent": 5.0
    });
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/strategies")
        .header("authorization", auth)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_create_requires_token_symbol() {
    let state = test_state().await;
    let auth = bearer(&state, "u1");
    let app = super::router(state);

    let body = serde_json::json!({
        "exchange_id": "binance",
        "token": "  ",
        "take_profit_percent": 5.0
    });
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/strategies")
        .header("authorization", auth)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_manual_order_validates_amount() {
    let state = test_state().await;
    let auth = bearer(&state, "u1");
    let app = super::router(state);

    let body = serde_json::json!({
        "exchange_id": "binance",
        "token": "BTC",
        "amount": 0.0
    });
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/orders/buy")
        .header("authorization", auth)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let json = body_json(resp).await;
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .contains("amount"));
}

#[tokio::test]
async fn test_jobs_status_reports_both_jobs() {
    let state = test_state().await;
    let auth = bearer(&state, "u1");
    let app = super::router(state.clone());

    let req = Request::builder()
        .uri("/api/v1/jobs/status")
        .header("authorization", auth)
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = body_json(resp).await;
    assert_eq!(json["data"]["strategy_worker"]["running"], true);
    assert_eq!(json["data"]["balance_snapshot"]["running"], true);
    assert_eq!(json["data"]["dry_run"], true);
}

#[tokio::test]
async fn test_job_control_stop_flips_running_flag() {
    let state = test_state().await;
    let auth = bearer(&state, "u1");
    let app = super::router(state.clone());

    let body = serde_json::json!({ "job": "strategy_worker", "action": "stop" });
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/jobs/control")
        .header("authorization", auth)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(!state.jobs.strategy_worker.is_enabled());
}

#[tokio::test]
async fn test_job_control_rejects_unknown_job_and_action() {
    let state = test_state().await;
    let auth = bearer(&state, "u1");
    let app = super::router(state);

    let body = serde_json::json!({ "job": "mystery", "action": "stop" });
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/jobs/control")
        .header("authorization", auth.clone())
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body = serde_json::json!({ "job": "strategy_worker", "action": "explode" });
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/jobs/control")
        .header("authorization", auth)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_manual_job_trigger() {
    let state = test_state().await;
    let auth = bearer(&state, "u1");
    let app = super::router(state);

    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/jobs/trigger/balance_snapshot")
        .header("authorization", auth)
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
