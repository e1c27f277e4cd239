use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A local identity. Federated sign-ins and local registrations both land here.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct IdentityAccount {
    pub id: Uuid,
    pub user_name: String,
    pub display_name: Option<String>,
    /// Not unique: several accounts may share an address.
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdentityAccount {
    pub fn has_password(&self) -> bool {
        self.password_hash.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAccount {
    pub user_name: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
}

/// Partial profile update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAccount {
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
}

/// Upper-cased, trimmed form used for uniqueness checks and lookups.
pub fn normalize_key(value: &str) -> String {
    value.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_key_is_case_and_whitespace_insensitive() {
        assert_eq!(normalize_key("  Alice@Example.org "), "ALICE@EXAMPLE.ORG");
        assert_eq!(normalize_key("admin"), normalize_key("ADMIN"));
    }

    #[test]
    fn password_hash_is_never_serialized() {
        let now = Utc::now();
        let account = IdentityAccount {
            id: Uuid::new_v4(),
            user_name: "alice".to_string(),
            display_name: None,
            email: None,
            password_hash: Some("$argon2id$secret".to_string()),
            created_at: now,
            updated_at: now,
        };

        let json = serde_json::to_string(&account).unwrap();
        assert!(!json.contains("argon2id"));
        assert!(json.contains("\"user_name\":\"alice\""));
    }
}
