use chrono::Utc;
use mongodb::bson::doc;
use mongodb::Collection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::registry::ExchangeKind;

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Opaque credential handle the gateway consumes. Encryption at rest is
/// handled outside this service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedExchange {
    pub exchange_id: String,
    pub kind: ExchangeKind,
    pub credential: Credential,
    pub is_active: bool,
    pub linked_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserExchanges {
    pub user_id: String,
    #[serde(default)]
    pub exchanges: Vec<LinkedExchange>,
    pub updated_at: i64,
}

// ---------------------------------------------------------------------------
// VaultError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("exchange not linked")]
    NotLinked,
    #[error("exchange link is disabled")]
    Disabled,
    #[error(transparent)]
    Db(#[from] mongodb::error::Error),
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// Maps (user, exchange) to a credential handle. The engine consumes only
/// the read side; linking and lifecycle operations back the exchange API
/// endpoints.
#[derive(Clone)]
pub struct Vault {
    collection: Collection<UserExchanges>,
}

impl Vault {
    pub fn new(collection: Collection<UserExchanges>) -> Self {
        Self { collection }
    }

    /// Read side used by the workers. A soft-disconnected link yields
    /// `Disabled` so callers can skip rather than fail.
    pub async fn get_credential(
        &self,
        user_id: &str,
        exchange_id: &str,
    ) -> Result<(ExchangeKind, Credential), VaultError> {
        let doc = self
            .collection
            .find_one(doc! { "user_id": user_id })
            .await?
            .ok_or(VaultError::NotLinked)?;

        let link = doc
            .exchanges
            .into_iter()
            .find(|e| e.exchange_id == exchange_id)
            .ok_or(VaultError::NotLinked)?;

        if !link.is_active {
            return Err(VaultError::Disabled);
        }
        Ok((link.kind, link.credential))
    }

    pub async fn list_links(&self, user_id: &str) -> Result<Vec<LinkedExchange>, VaultError> {
        let doc = self.collection.find_one(doc! { "user_id": user_id }).await?;
        Ok(doc.map(|d| d.exchanges).unwrap_or_default())
    }

    pub async fn list_active(&self, user_id: &str) -> Result<Vec<LinkedExchange>, VaultError> {
        let mut links = self.list_links(user_id).await?;
        links.retain(|l| l.is_active);
        Ok(links)
    }

    /// Users the balance snapshot pipeline should visit.
    pub async fn users_with_active_exchanges(&self) -> Result<Vec<String>, VaultError> {
        let values = self
            .collection
            .distinct("user_id", doc! { "exchanges.is_active": true })
            .await?;
        Ok(values
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect())
    }

    /// Links (or re-links) an exchange, activating it and replacing any
    /// previous credential.
    pub async fn link(
        &self,
        user_id: &str,
        exchange_id: &str,
        kind: ExchangeKind,
        credential: Credential,
    ) -> Result<(), VaultError> {
        let now = Utc::now().timestamp();

        // Drop any existing entry first so re-linking replaces it.
        self.collection
            .update_one(
                doc! { "user_id": user_id },
                doc! { "$pull": { "exchanges": { "exchange_id": exchange_id } } },
            )
            .await?;

        let entry = mongodb::bson::to_bson(&LinkedExchange {
            exchange_id: exchange_id.to_string(),
            kind,
            credential,
            is_active: true,
            linked_at: now,
        })
        .map_err(mongodb::error::Error::from)?;

        self.collection
            .update_one(
                doc! { "user_id": user_id },
                doc! {
                    "$push": { "exchanges": entry },
                    "$set": { "updated_at": now },
                    "$setOnInsert": { "user_id": user_id },
                },
            )
            .upsert(true)
            .await?;

        tracing::info!(user_id, exchange_id, "exchange_linked");
        Ok(())
    }

    pub async fn unlink(&self, user_id: &str, exchange_id: &str) -> Result<bool, VaultError> {
        let result = self
            .collection
            .update_one(
                doc! { "user_id": user_id },
                doc! {
                    "$pull": { "exchanges": { "exchange_id": exchange_id } },
                    "$set": { "updated_at": Utc::now().timestamp() },
                },
            )
            .await?;
        let removed = result.modified_count > 0;
        if removed {
            tracing::info!(user_id, exchange_id, "exchange_unlinked");
        }
        Ok(removed)
    }

    /// Soft-disconnect: clears the active flag but keeps the handle.
    pub async fn disconnect(&self, user_id: &str, exchange_id: &str) -> Result<bool, VaultError> {
        self.set_active(user_id, exchange_id, false).await
    }

    pub async fn connect(&self, user_id: &str, exchange_id: &str) -> Result<bool, VaultError> {
        self.set_active(user_id, exchange_id, true).await
    }

    /// AuthError disposition: the link is disabled until the user re-links
    /// or reconnects with valid credentials.
    pub async fn mark_invalid(&self, user_id: &str, exchange_id: &str) -> Result<bool, VaultError> {
        let changed = self.set_active(user_id, exchange_id, false).await?;
        if changed {
            tracing::warn!(user_id, exchange_id, "exchange_credentials_invalidated");
        }
        Ok(changed)
    }

    async fn set_active(
        &self,
        user_id: &str,
        exchange_id: &str,
        is_active: bool,
    ) -> Result<bool, VaultError> {
        let result = self
            .collection
            .update_one(
                doc! { "user_id": user_id, "exchanges.exchange_id": exchange_id },
                doc! {
                    "$set": {
                        "exchanges.$.is_active": is_active,
                        "updated_at": Utc::now().timestamp(),
                    }
                },
            )
            .await?;
        Ok(result.matched_count > 0)
    }
}
