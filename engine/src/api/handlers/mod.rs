pub mod balances;
pub mod exchanges;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod notifications;
pub mod orders;
pub mod positions;
pub mod strategy;

use mongodb::bson::oid::ObjectId;

use super::error::ApiError;

pub(crate) fn parse_object_id(raw: &str) -> Result<ObjectId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::validation(format!("invalid id: {raw}")))
}
