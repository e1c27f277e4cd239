//! Maps completed external handshakes onto local identity records.

use std::sync::Arc;

use db::{
    IdentityStore, IdentityStoreError,
    models::{ExternalLoginLink, IdentityAccount},
};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::oauth::{ExternalLoginInfo, ProviderRegistration};

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("external identity is missing its {0}")]
    InvalidIdentity(&'static str),
    #[error("account already has a `{provider}` login, or that login belongs to another account")]
    AlreadyLinked { provider: String },
    #[error("account not found")]
    AccountNotFound,
    #[error("no `{0}` login on this account")]
    LoginNotFound(String),
    #[error(transparent)]
    Store(#[from] IdentityStoreError),
}

#[derive(Debug, Clone)]
pub struct FederatedSignIn {
    pub account: IdentityAccount,
    pub roles: Vec<String>,
    /// True only when this sign-in created the account.
    pub created: bool,
}

#[derive(Clone)]
pub struct FederationService {
    store: Arc<dyn IdentityStore>,
}

impl FederationService {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    fn normalized(info: &ExternalLoginInfo) -> Result<ExternalLoginInfo, FederationError> {
        let provider = ProviderRegistration::canonical_name(&info.provider);
        if provider.is_empty() {
            return Err(FederationError::InvalidIdentity("provider"));
        }
        let subject = info.subject.trim();
        if subject.is_empty() {
            return Err(FederationError::InvalidIdentity("subject"));
        }

        let provider_display_name = if info.provider_display_name.trim().is_empty() {
            ProviderRegistration::default_display_name(&provider)
        } else {
            info.provider_display_name.clone()
        };

        Ok(ExternalLoginInfo {
            provider,
            provider_display_name,
            subject: subject.to_string(),
            email: info.email.clone(),
            name: info.name.clone(),
        })
    }

    /// Resolve the local account for an external identity, creating account
    /// and link on first sight. Emails are never used to match accounts.
    pub async fn sign_in(
        &self,
        info: &ExternalLoginInfo,
    ) -> Result<FederatedSignIn, FederationError> {
        let info = Self::normalized(info)?;
        let federated = self.store.find_or_create_external(&info).await?;

        if federated.created {
            info!(
                account_id = %federated.account.id,
                provider = %info.provider,
                "First external sign-in, account created"
            );
        }

        let roles = self.store.roles_for(federated.account.id).await?;
        Ok(FederatedSignIn {
            account: federated.account,
            roles,
            created: federated.created,
        })
    }

    /// Attach another provider to an existing account. Re-linking the same
    /// pair to the same account is a no-op.
    pub async fn link(
        &self,
        account_id: Uuid,
        info: &ExternalLoginInfo,
    ) -> Result<ExternalLoginLink, FederationError> {
        let info = Self::normalized(info)?;

        if let Some(existing) = self
            .store
            .find_external_login(&info.provider, &info.subject)
            .await?
        {
            if existing.account_id == account_id {
                return Ok(existing);
            }
            return Err(FederationError::AlreadyLinked {
                provider: info.provider,
            });
        }

        match self.store.add_external_login(account_id, &info).await {
            Ok(link) => {
                info!(%account_id, provider = %info.provider, "Linked external login");
                Ok(link)
            }
            Err(IdentityStoreError::Conflict(_)) => Err(FederationError::AlreadyLinked {
                provider: info.provider,
            }),
            Err(IdentityStoreError::NotFound) => Err(FederationError::AccountNotFound),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn unlink(&self, account_id: Uuid, provider: &str) -> Result<(), FederationError> {
        let provider = ProviderRegistration::canonical_name(provider);
        match self.store.remove_external_login(account_id, &provider).await {
            Ok(()) => Ok(()),
            Err(IdentityStoreError::NotFound) => Err(FederationError::LoginNotFound(provider)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn logins(&self, account_id: Uuid) -> Result<Vec<ExternalLoginLink>, FederationError> {
        Ok(self.store.list_external_logins(account_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use db::{IdentityStore, models::CreateAccount, test_utils::create_test_store};

    use super::*;

    fn google(subject: &str, email: &str) -> ExternalLoginInfo {
        ExternalLoginInfo {
            provider: "Google".to_string(),
            provider_display_name: String::new(),
            subject: subject.to_string(),
            email: Some(email.to_string()),
            name: None,
        }
    }

    #[tokio::test]
    async fn first_callback_creates_second_resolves_same_account() {
        let (store, _temp_dir) = create_test_store().await;
        let service = FederationService::new(Arc::new(store));

        let first = service.sign_in(&google("abc123", "x@y.com")).await.unwrap();
        let second = service.sign_in(&google("abc123", "x@y.com")).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.account.id, second.account.id);
        assert_eq!(first.account.email.as_deref(), Some("x@y.com"));

        let logins = service.logins(first.account.id).await.unwrap();
        assert_eq!(logins.len(), 1);
        assert_eq!(logins[0].provider, "google");
        assert_eq!(logins[0].provider_subject, "abc123");
        assert_eq!(logins[0].provider_display_name, "Google");
    }

    #[tokio::test]
    async fn shared_email_does_not_merge_accounts() {
        let (store, _temp_dir) = create_test_store().await;
        let service = FederationService::new(Arc::new(store));

        let a = service.sign_in(&google("one", "x@y.com")).await.unwrap();
        let b = service.sign_in(&google("two", "x@y.com")).await.unwrap();
        assert_ne!(a.account.id, b.account.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callbacks_create_one_account() {
        let (store, _temp_dir) = create_test_store().await;
        let store: Arc<dyn IdentityStore> = Arc::new(store);
        let service = FederationService::new(store.clone());

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.sign_in(&google("race", "r@y.com")).await })
            })
            .collect();

        let mut ids = Vec::new();
        let mut created = 0;
        for task in tasks {
            let result = task.await.unwrap().unwrap();
            ids.push(result.account.id);
            created += usize::from(result.created);
        }

        assert_eq!(created, 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(store.list_external_logins(ids[0]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blank_subject_is_rejected() {
        let (store, _temp_dir) = create_test_store().await;
        let service = FederationService::new(Arc::new(store));

        let err = service.sign_in(&google("  ", "x@y.com")).await.unwrap_err();
        assert!(matches!(err, FederationError::InvalidIdentity("subject")));
    }

    #[tokio::test]
    async fn link_attaches_second_provider_and_rejects_duplicates() {
        let (store, _temp_dir) = create_test_store().await;
        let store: Arc<dyn IdentityStore> = Arc::new(store);
        let service = FederationService::new(store.clone());

        let account = service.sign_in(&google("g-1", "x@y.com")).await.unwrap().account;
        let microsoft = ExternalLoginInfo {
            provider: "microsoft".to_string(),
            provider_display_name: "Microsoft".to_string(),
            subject: "m-1".to_string(),
            email: None,
            name: None,
        };

        service.link(account.id, &microsoft).await.unwrap();
        // Same pair, same account: idempotent.
        service.link(account.id, &microsoft).await.unwrap();

        let resolved = service.sign_in(&microsoft).await.unwrap();
        assert_eq!(resolved.account.id, account.id);

        // Second Google subject on the same account.
        let err = service
            .link(account.id, &google("g-2", "x@y.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::AlreadyLinked { .. }));

        // Pair already owned by someone else.
        let other = store
            .create_account(&CreateAccount {
                user_name: "other".to_string(),
                display_name: None,
                email: None,
                password_hash: None,
            })
            .await
            .unwrap();
        let err = service.link(other.id, &microsoft).await.unwrap_err();
        assert!(matches!(err, FederationError::AlreadyLinked { .. }));

        service.unlink(account.id, "Microsoft").await.unwrap();
        assert_eq!(service.logins(account.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sign_in_reports_roles() {
        let (store, _temp_dir) = create_test_store().await;
        let store: Arc<dyn IdentityStore> = Arc::new(store);
        let service = FederationService::new(store.clone());

        let first = service.sign_in(&google("admin", "a@y.com")).await.unwrap();
        assert!(first.roles.is_empty());

        store.create_role("Admin").await.unwrap();
        store.add_to_role(first.account.id, "Admin").await.unwrap();

        let again = service.sign_in(&google("admin", "a@y.com")).await.unwrap();
        assert_eq!(again.roles, vec!["Admin"]);
    }
}
