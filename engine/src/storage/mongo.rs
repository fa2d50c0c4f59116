use anyhow::{Context, Result};
use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};

use crate::gateway::registry::ExchangeKind;
use crate::ledger::Position;
use crate::notify::Notification;
use crate::strategy::Strategy;
use crate::vault::UserExchanges;
use crate::worker::snapshot::BalanceSnapshot;

// ---------------------------------------------------------------------------
// Exchange catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeInfo {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub kind: ExchangeKind,
}

// ---------------------------------------------------------------------------
// Mongo
// ---------------------------------------------------------------------------

/// Connection handle plus typed collection accessors. Collections follow
/// the document layout the services expect; indexes are created at boot.
#[derive(Clone)]
pub struct Mongo {
    db: Database,
}

impl Mongo {
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        tracing::info!("mongo_connecting");
        let client = Client::with_uri_str(uri)
            .await
            .context("failed to build MongoDB client")?;
        let db = client.database(database);
        db.run_command(doc! { "ping": 1 })
            .await
            .context("MongoDB ping failed")?;
        tracing::info!(database, "mongo_connected");
        Ok(Self { db })
    }

    /// Builds the handle without pinging; router tests construct state
    /// against a database that is never reached.
    #[cfg(test)]
    pub async fn connect_lazy(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .context("failed to build MongoDB client")?;
        Ok(Self {
            db: client.database(database),
        })
    }

    pub fn strategies(&self) -> Collection<Strategy> {
        self.db.collection("strategies")
    }

    pub fn positions(&self) -> Collection<Position> {
        self.db.collection("positions")
    }

    pub fn user_exchanges(&self) -> Collection<UserExchanges> {
        self.db.collection("user_exchanges")
    }

    pub fn balance_history(&self) -> Collection<BalanceSnapshot> {
        self.db.collection("balance_history")
    }

    pub fn exchanges(&self) -> Collection<ExchangeInfo> {
        self.db.collection("exchanges")
    }

    pub fn notifications(&self) -> Collection<Notification> {
        self.db.collection("notifications")
    }

    pub async fn ensure_indexes(&self) -> Result<()> {
        let unique = IndexOptions::builder().unique(true).build();

        self.strategies()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "user_id": 1, "exchange_id": 1, "token": 1 })
                    .options(unique.clone())
                    .build(),
            )
            .await?;
        self.strategies()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "user_id": 1, "is_active": 1 })
                    .build(),
            )
            .await?;

        self.positions()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "user_id": 1, "exchange_id": 1, "token": 1 })
                    .options(unique.clone())
                    .build(),
            )
            .await?;

        self.user_exchanges()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "user_id": 1 })
                    .options(unique)
                    .build(),
            )
            .await?;

        self.balance_history()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "user_id": 1, "timestamp": -1 })
                    .build(),
            )
            .await?;

        self.notifications()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "user_id": 1, "is_read": 1, "created_at": -1 })
                    .build(),
            )
            .await?;

        tracing::info!("mongo_indexes_ensured");
        Ok(())
    }

    /// Seeds the exchange catalog with every supported venue. Idempotent.
    pub async fn ensure_exchange_catalog(&self) -> Result<()> {
        let catalog = self.exchanges();
        for kind in ExchangeKind::ALL {
            catalog
                .update_one(
                    doc! { "_id": kind.id() },
                    doc! { "$set": { "name": kind.display_name(), "kind": kind.id() } },
                )
                .upsert(true)
                .await?;
        }
        Ok(())
    }

    pub async fn exchange_exists(&self, exchange_id: &str) -> Result<bool> {
        Ok(self
            .exchanges()
            .find_one(doc! { "_id": exchange_id })
            .await?
            .is_some())
    }
}
