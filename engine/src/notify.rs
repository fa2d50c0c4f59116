use chrono::Utc;
use futures::stream::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::doc;
use mongodb::Collection;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    StrategyExecuted,
    OrderFailed,
    StrategyPaused,
    CredentialsInvalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub is_read: bool,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Best-effort user-facing side channel. Failures are logged and swallowed:
/// a missed notification must never affect the next trading decision.
#[derive(Clone)]
pub struct Notifier {
    collection: Collection<Notification>,
}

impl Notifier {
    pub fn new(collection: Collection<Notification>) -> Self {
        Self { collection }
    }

    pub async fn push(&self, user_id: &str, kind: NotificationKind, title: &str, body: &str) {
        let notification = Notification {
            id: None,
            user_id: user_id.to_string(),
            kind,
            title: title.to_string(),
            body: body.to_string(),
            is_read: false,
            created_at: Utc::now().timestamp(),
        };
        if let Err(e) = self.collection.insert_one(&notification).await {
            tracing::warn!(user_id, kind = ?kind, error = %e, "notification_write_failed");
        }
    }

    pub async fn list(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<Notification>, mongodb::error::Error> {
        let mut filter = doc! { "user_id": user_id };
        if unread_only {
            filter.insert("is_read", false);
        }
        let cursor = self
            .collection
            .find(filter)
            .sort(doc! { "created_at": -1 })
            .limit(limit)
            .await?;
        cursor.try_collect().await
    }

    pub async fn mark_read(
        &self,
        user_id: &str,
        ids: &[ObjectId],
    ) -> Result<u64, mongodb::error::Error> {
        let result = self
            .collection
            .update_many(
                doc! { "user_id": user_id, "_id": { "$in": ids.to_vec() } },
                doc! { "$set": { "is_read": true } },
            )
            .await?;
        Ok(result.modified_count)
    }
}
