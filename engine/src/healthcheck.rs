use std::time::Duration;

use anyhow::{Context, Result};
use mongodb::bson::doc;

const CHECK_INTERVAL: Duration = Duration::from_secs(2);
const TIMEOUT: Duration = Duration::from_secs(60);

/// Blocks until MongoDB is reachable.
///
/// Polled every 2 seconds; fails after 60 seconds so a misconfigured
/// deployment dies loudly instead of spinning.
pub async fn wait_for_services(database_uri: &str) -> Result<()> {
    tracing::info!("healthcheck_starting");
    wait_for_mongo(database_uri).await?;
    tracing::info!("healthcheck_passed");
    Ok(())
}

async fn wait_for_mongo(uri: &str) -> Result<()> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;

    loop {
        let check = async {
            let client = mongodb::Client::with_uri_str(uri).await?;
            client
                .database("admin")
                .run_command(doc! { "ping": 1 })
                .await?;
            Ok::<(), anyhow::Error>(())
        };

        match check.await {
            Ok(()) => {
                tracing::info!("mongo_ready");
                return Ok(());
            }
            Err(e) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(e).context("MongoDB not ready within 60s");
                }
                tracing::warn!(error = %e, "waiting_for_mongo");
                tokio::time::sleep(CHECK_INTERVAL).await;
            }
        }
    }
}
