use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction, migrate::MigrateError, postgres::PgPoolOptions};
use uuid::Uuid;

use crate::{
    engine::Engine,
    models::{
        CreateAccount, ExternalIdentity, ExternalLoginLink, FederatedAccount, IdentityAccount,
        IdentityRole, UpdateAccount, normalize_key,
    },
    store::{IdentityStore, IdentityStoreError},
};

type Tx<'a> = Transaction<'a, Postgres>;

/// Can be overridden via `BROKER_PG_MAX_CONNECTIONS`.
const DEFAULT_MAX_CONNECTIONS: u32 = 20;

/// Reads `BROKER_PG_MAX_CONNECTIONS`; falls back to 20 when unset, zero or
/// not a number.
pub fn get_max_connections() -> u32 {
    std::env::var("BROKER_PG_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_MAX_CONNECTIONS)
}

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(get_max_connections())
        .connect(database_url)
        .await
}

pub async fn migrate(pool: &PgPool) -> Result<(), MigrateError> {
    sqlx::migrate!("./migrations/postgres").run(pool).await
}

#[derive(Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Winner's result for a caller that lost the find-or-create race.
    async fn existing_federation(
        &self,
        identity: &ExternalIdentity,
    ) -> Result<FederatedAccount, IdentityStoreError> {
        let link = self
            .find_external_login(&identity.provider, &identity.subject)
            .await?
            .ok_or_else(|| {
                IdentityStoreError::Conflict(format!(
                    "user name `{}` is held by an unlinked account",
                    identity.derived_user_name()
                ))
            })?;
        let account = self
            .find_account(link.account_id)
            .await?
            .ok_or(IdentityStoreError::NotFound)?;

        Ok(FederatedAccount {
            account,
            link,
            created: false,
        })
    }

    async fn insert_account_tx(
        tx: &mut Tx<'_>,
        id: Uuid,
        data: &CreateAccount,
    ) -> Result<Option<IdentityAccount>, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, IdentityAccount>(
            r#"
            INSERT INTO identity_accounts (
                id, user_name, normalized_user_name, display_name, email,
                normalized_email, password_hash, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (normalized_user_name) DO NOTHING
            RETURNING id, user_name, display_name, email, password_hash, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(&data.user_name)
        .bind(normalize_key(&data.user_name))
        .bind(&data.display_name)
        .bind(&data.email)
        .bind(data.email.as_deref().map(normalize_key))
        .bind(&data.password_hash)
        .bind(now)
        .fetch_optional(&mut **tx)
        .await
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    async fn ping(&self) -> Result<(), IdentityStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Postgres connection pool closed");
    }

    async fn create_account(
        &self,
        data: &CreateAccount,
    ) -> Result<IdentityAccount, IdentityStoreError> {
        let mut tx = self.pool.begin().await?;
        let account = Self::insert_account_tx(&mut tx, Uuid::new_v4(), data).await?;
        let Some(account) = account else {
            tx.rollback().await?;
            return Err(IdentityStoreError::Conflict(format!(
                "user name `{}` is already taken",
                data.user_name
            )));
        };
        tx.commit().await?;
        Ok(account)
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<IdentityAccount>, IdentityStoreError> {
        let account = sqlx::query_as::<_, IdentityAccount>(
            r#"
            SELECT id, user_name, display_name, email, password_hash, created_at, updated_at
            FROM identity_accounts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn find_account_by_user_name(
        &self,
        user_name: &str,
    ) -> Result<Option<IdentityAccount>, IdentityStoreError> {
        let account = sqlx::query_as::<_, IdentityAccount>(
            r#"
            SELECT id, user_name, display_name, email, password_hash, created_at, updated_at
            FROM identity_accounts
            WHERE normalized_user_name = $1
            "#,
        )
        .bind(normalize_key(user_name))
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn find_accounts_by_email(
        &self,
        email: &str,
    ) -> Result<Vec<IdentityAccount>, IdentityStoreError> {
        let accounts = sqlx::query_as::<_, IdentityAccount>(
            r#"
            SELECT id, user_name, display_name, email, password_hash, created_at, updated_at
            FROM identity_accounts
            WHERE normalized_email = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(normalize_key(email))
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    async fn update_account(
        &self,
        id: Uuid,
        data: &UpdateAccount,
    ) -> Result<IdentityAccount, IdentityStoreError> {
        let account = sqlx::query_as::<_, IdentityAccount>(
            r#"
            UPDATE identity_accounts
            SET display_name     = COALESCE($2, display_name),
                email            = COALESCE($3, email),
                normalized_email = COALESCE($4, normalized_email),
                password_hash    = COALESCE($5, password_hash),
                updated_at       = $6
            WHERE id = $1
            RETURNING id, user_name, display_name, email, password_hash, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(&data.display_name)
        .bind(&data.email)
        .bind(data.email.as_deref().map(normalize_key))
        .bind(&data.password_hash)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(IdentityStoreError::NotFound)?;

        Ok(account)
    }

    async fn find_external_login(
        &self,
        provider: &str,
        subject: &str,
    ) -> Result<Option<ExternalLoginLink>, IdentityStoreError> {
        let link = sqlx::query_as::<_, ExternalLoginLink>(
            r#"
            SELECT provider, provider_subject, provider_display_name, account_id, created_at
            FROM external_logins
            WHERE provider = $1 AND provider_subject = $2
            "#,
        )
        .bind(provider)
        .bind(subject)
        .fetch_optional(&self.pool)
        .await?;

        Ok(link)
    }

    async fn list_external_logins(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<ExternalLoginLink>, IdentityStoreError> {
        let links = sqlx::query_as::<_, ExternalLoginLink>(
            r#"
            SELECT provider, provider_subject, provider_display_name, account_id, created_at
            FROM external_logins
            WHERE account_id = $1
            ORDER BY provider ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(links)
    }

    async fn add_external_login(
        &self,
        account_id: Uuid,
        identity: &ExternalIdentity,
    ) -> Result<ExternalLoginLink, IdentityStoreError> {
        if self.find_account(account_id).await?.is_none() {
            return Err(IdentityStoreError::NotFound);
        }

        let link = sqlx::query_as::<_, ExternalLoginLink>(
            r#"
            INSERT INTO external_logins (
                provider, provider_subject, provider_display_name, account_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5)
            RETURNING provider, provider_subject, provider_display_name, account_id, created_at
            "#,
        )
        .bind(&identity.provider)
        .bind(&identity.subject)
        .bind(&identity.provider_display_name)
        .bind(account_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(link)
    }

    async fn remove_external_login(
        &self,
        account_id: Uuid,
        provider: &str,
    ) -> Result<(), IdentityStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM external_logins
            WHERE account_id = $1 AND provider = $2
            "#,
        )
        .bind(account_id)
        .bind(provider)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IdentityStoreError::NotFound);
        }
        Ok(())
    }

    async fn find_or_create_external(
        &self,
        identity: &ExternalIdentity,
    ) -> Result<FederatedAccount, IdentityStoreError> {
        if let Some(link) = self
            .find_external_login(&identity.provider, &identity.subject)
            .await?
        {
            let account = self
                .find_account(link.account_id)
                .await?
                .ok_or(IdentityStoreError::NotFound)?;
            return Ok(FederatedAccount {
                account,
                link,
                created: false,
            });
        }

        let data = CreateAccount {
            user_name: identity.derived_user_name(),
            display_name: identity.name.clone(),
            email: identity.email.clone(),
            password_hash: None,
        };

        // A concurrent insert of the same pair blocks on the unique index until
        // the other transaction commits, then reports zero rows here.
        let mut tx = self.pool.begin().await?;
        let Some(account) = Self::insert_account_tx(&mut tx, Uuid::new_v4(), &data).await? else {
            tx.rollback().await?;
            return self.existing_federation(identity).await;
        };

        let link = sqlx::query_as::<_, ExternalLoginLink>(
            r#"
            INSERT INTO external_logins (
                provider, provider_subject, provider_display_name, account_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            RETURNING provider, provider_subject, provider_display_name, account_id, created_at
            "#,
        )
        .bind(&identity.provider)
        .bind(&identity.subject)
        .bind(&identity.provider_display_name)
        .bind(account.id)
        .bind(account.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(link) = link else {
            tx.rollback().await?;
            return self.existing_federation(identity).await;
        };

        tx.commit().await?;
        tracing::info!(
            account_id = %account.id,
            provider = %identity.provider,
            "Created account for external identity"
        );

        Ok(FederatedAccount {
            account,
            link,
            created: true,
        })
    }

    async fn create_role(&self, name: &str) -> Result<IdentityRole, IdentityStoreError> {
        sqlx::query(
            r#"
            INSERT INTO identity_roles (id, name, normalized_name, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (normalized_name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(normalize_key(name))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let role = sqlx::query_as::<_, IdentityRole>(
            r#"
            SELECT id, name, created_at
            FROM identity_roles
            WHERE normalized_name = $1
            "#,
        )
        .bind(normalize_key(name))
        .fetch_one(&self.pool)
        .await?;

        Ok(role)
    }

    async fn add_to_role(&self, account_id: Uuid, role: &str) -> Result<(), IdentityStoreError> {
        let role_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM identity_roles WHERE normalized_name = $1
            "#,
        )
        .bind(normalize_key(role))
        .fetch_optional(&self.pool)
        .await?;

        let role_id = role_id.ok_or_else(|| IdentityStoreError::RoleNotFound(role.to_string()))?;

        if self.find_account(account_id).await?.is_none() {
            return Err(IdentityStoreError::NotFound);
        }

        sqlx::query(
            r#"
            INSERT INTO account_roles (account_id, role_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(role_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn roles_for(&self, account_id: Uuid) -> Result<Vec<String>, IdentityStoreError> {
        let roles: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT r.name
            FROM account_roles ar
            JOIN identity_roles r ON r.id = ar.role_id
            WHERE ar.account_id = $1
            ORDER BY r.name ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(roles)
    }
}
