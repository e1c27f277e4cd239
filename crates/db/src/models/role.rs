use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct IdentityRole {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}
