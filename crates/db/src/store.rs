//! Engine-neutral access to the identity schema.
//!
//! Both engines implement [`IdentityStore`]; the rest of the workspace only
//! ever holds an `Arc<dyn IdentityStore>` handed out by [`crate::DBService`].

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    engine::Engine,
    models::{
        CreateAccount, ExternalIdentity, ExternalLoginLink, FederatedAccount, IdentityAccount,
        IdentityRole, UpdateAccount,
    },
};

#[derive(Debug, Error)]
pub enum IdentityStoreError {
    #[error("record not found")]
    NotFound,
    #[error("role `{0}` does not exist")]
    RoleNotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for IdentityStoreError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::RowNotFound => Self::NotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                tracing::debug!(detail = %db_err.message(), "Unique constraint violated");
                Self::Conflict("a record with the same key already exists".to_string())
            }
            _ => Self::Database(error),
        }
    }
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    fn engine(&self) -> Engine;

    /// Cheap round-trip used by health checks.
    async fn ping(&self) -> Result<(), IdentityStoreError>;

    /// Flush and close the pool. Called once during graceful shutdown.
    async fn close(&self);

    async fn create_account(
        &self,
        data: &CreateAccount,
    ) -> Result<IdentityAccount, IdentityStoreError>;

    async fn find_account(&self, id: Uuid) -> Result<Option<IdentityAccount>, IdentityStoreError>;

    async fn find_account_by_user_name(
        &self,
        user_name: &str,
    ) -> Result<Option<IdentityAccount>, IdentityStoreError>;

    /// Accounts sharing an email address, oldest first.
    async fn find_accounts_by_email(
        &self,
        email: &str,
    ) -> Result<Vec<IdentityAccount>, IdentityStoreError>;

    async fn update_account(
        &self,
        id: Uuid,
        data: &UpdateAccount,
    ) -> Result<IdentityAccount, IdentityStoreError>;

    async fn find_external_login(
        &self,
        provider: &str,
        subject: &str,
    ) -> Result<Option<ExternalLoginLink>, IdentityStoreError>;

    async fn list_external_logins(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<ExternalLoginLink>, IdentityStoreError>;

    /// Attach a provider to an existing account. Fails with `Conflict` when the
    /// pair is already linked or the account already has that provider.
    async fn add_external_login(
        &self,
        account_id: Uuid,
        identity: &ExternalIdentity,
    ) -> Result<ExternalLoginLink, IdentityStoreError>;

    async fn remove_external_login(
        &self,
        account_id: Uuid,
        provider: &str,
    ) -> Result<(), IdentityStoreError>;

    /// Resolve the account linked to `identity`, creating account and link in
    /// one transaction when the pair is unseen. Concurrent callers for the same
    /// pair converge on a single account.
    async fn find_or_create_external(
        &self,
        identity: &ExternalIdentity,
    ) -> Result<FederatedAccount, IdentityStoreError>;

    /// Idempotent: returns the existing role when the name is taken.
    async fn create_role(&self, name: &str) -> Result<IdentityRole, IdentityStoreError>;

    async fn add_to_role(&self, account_id: Uuid, role: &str) -> Result<(), IdentityStoreError>;

    async fn roles_for(&self, account_id: Uuid) -> Result<Vec<String>, IdentityStoreError>;
}
