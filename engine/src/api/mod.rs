pub mod auth;
pub mod error;
pub mod handlers;
pub mod response;
pub mod state;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;

use state::ApiState;

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/metrics", get(handlers::metrics::render))
        .route(
            "/api/v1/strategies",
            post(handlers::strategy::create).get(handlers::strategy::list),
        )
        .route(
            "/api/v1/strategies/{id}",
            get(handlers::strategy::get_one)
                .put(handlers::strategy::update)
                .delete(handlers::strategy::delete_one),
        )
        .route("/api/v1/strategies/{id}/check", post(handlers::strategy::check))
        .route("/api/v1/positions", get(handlers::positions::list))
        .route("/api/v1/positions/sync", post(handlers::positions::sync))
        .route("/api/v1/positions/{id}", get(handlers::positions::get_one))
        .route("/api/v1/orders/buy", post(handlers::orders::buy))
        .route("/api/v1/orders/sell", post(handlers::orders::sell))
        .route("/api/v1/jobs/status", get(handlers::jobs::status))
        .route("/api/v1/jobs/control", post(handlers::jobs::control))
        .route("/api/v1/jobs/trigger/{job}", post(handlers::jobs::trigger))
        .route("/api/v1/exchanges/link", post(handlers::exchanges::link))
        .route("/api/v1/exchanges/unlink", delete(handlers::exchanges::unlink))
        .route("/api/v1/exchanges/disconnect", post(handlers::exchanges::disconnect))
        .route("/api/v1/exchanges/connect", post(handlers::exchanges::connect))
        .route("/api/v1/exchanges/delete", delete(handlers::exchanges::delete_exchange))
        .route("/api/v1/notifications", get(handlers::notifications::list))
        .route("/api/v1/notifications/read", post(handlers::notifications::mark_read))
        .route("/api/v1/balances/history", get(handlers::balances::history))
        .with_state(state)
}

pub async fn serve(state: Arc<ApiState>, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "api_listening");
    axum::serve(listener, app).await?;
    Ok(())
}
