use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::account::IdentityAccount;

/// Link from an external provider's subject to a local account.
///
/// Unique per `(provider, provider_subject)`; an account holds at most one
/// link per provider.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ExternalLoginLink {
    pub provider: String,
    pub provider_subject: String,
    pub provider_display_name: String,
    pub account_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// What a completed external handshake tells us about the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIdentity {
    /// Canonical (lower-case) provider name, e.g. `google`.
    pub provider: String,
    pub provider_display_name: String,
    /// Provider-issued subject id.
    pub subject: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl ExternalIdentity {
    /// User name given to accounts created from this identity. Emails are not
    /// unique, so the provider pair is used instead. The subject is hex encoded
    /// because user names compare case-insensitively and subjects do not.
    pub fn derived_user_name(&self) -> String {
        format!("{}:{}", self.provider, hex::encode(self.subject.as_bytes()))
    }
}

/// Outcome of an atomic find-or-create on an external identity.
#[derive(Debug, Clone)]
pub struct FederatedAccount {
    pub account: IdentityAccount,
    pub link: ExternalLoginLink,
    /// True only for the caller whose transaction created the account.
    pub created: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(provider: &str, subject: &str) -> ExternalIdentity {
        ExternalIdentity {
            provider: provider.to_string(),
            provider_display_name: provider.to_string(),
            subject: subject.to_string(),
            email: Some("x@y.com".to_string()),
            name: None,
        }
    }

    #[test]
    fn derived_user_name_uses_provider_pair() {
        assert_eq!(
            identity("google", "abc123").derived_user_name(),
            "google:616263313233"
        );
    }

    #[test]
    fn derived_user_names_keep_case_variant_subjects_apart() {
        let upper = identity("okta", "00uAbC").derived_user_name();
        let lower = identity("okta", "00uabc").derived_user_name();
        assert_ne!(
            crate::models::normalize_key(&upper),
            crate::models::normalize_key(&lower)
        );
    }
}
