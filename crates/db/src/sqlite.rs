use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    Error, Executor, Sqlite, SqlitePool, Transaction,
    migrate::MigrateError,
    sqlite::{
        SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
        SqliteSynchronous,
    },
};
use uuid::Uuid;

use crate::{
    engine::Engine,
    models::{
        CreateAccount, ExternalIdentity, ExternalLoginLink, FederatedAccount, IdentityAccount,
        IdentityRole, UpdateAccount, normalize_key,
    },
    retry::{RetryConfig, with_retry},
    store::{IdentityStore, IdentityStoreError},
};

type Tx<'a> = Transaction<'a, Sqlite>;

/// SQLite has a single writer; a handful of connections is plenty.
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
/// How long a writer waits on the database lock before SQLITE_BUSY.
const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Reads `BROKER_SQLITE_MAX_CONNECTIONS`, accepting 1..=100.
pub fn get_max_connections() -> u32 {
    std::env::var("BROKER_SQLITE_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|&n| n > 0 && n <= 100)
        .unwrap_or(DEFAULT_MAX_CONNECTIONS)
}

/// Applied to every new connection.
///
/// `synchronous` is set after `mmap_size`; with mmap enabled and no explicit
/// synchronous mode, heavy write load can surface SQLITE_IOERR.
async fn apply_performance_pragmas(conn: &mut SqliteConnection) -> Result<(), Error> {
    conn.execute("PRAGMA temp_store = 2").await?;
    conn.execute("PRAGMA mmap_size = 67108864").await?;
    conn.execute("PRAGMA synchronous = NORMAL").await?;
    conn.execute("PRAGMA cache_size = -16000").await?;
    Ok(())
}

pub fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(DEFAULT_BUSY_TIMEOUT_SECS)))
}

pub async fn create_pool(database_url: &str) -> Result<SqlitePool, Error> {
    let max_connections = get_max_connections();
    tracing::info!(
        max_connections,
        min_connections = DEFAULT_MIN_CONNECTIONS,
        "Initializing SQLite connection pool"
    );

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .min_connections(DEFAULT_MIN_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS))
        .idle_timeout(Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)))
        .after_connect(|conn, _meta| Box::pin(async move { apply_performance_pragmas(conn).await }))
        .connect_with(connect_options(database_url)?)
        .await
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), MigrateError> {
    sqlx::migrate!("./migrations/sqlite").run(pool).await
}

#[derive(Clone)]
pub struct SqliteIdentityStore {
    pool: SqlitePool,
    retry: RetryConfig,
}

impl SqliteIdentityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry: RetryConfig::high_contention(),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert_account_tx(
        tx: &mut Tx<'_>,
        id: Uuid,
        data: &CreateAccount,
    ) -> Result<Option<IdentityAccount>, Error> {
        let now = Utc::now();
        sqlx::query_as::<_, IdentityAccount>(
            r#"
            INSERT INTO identity_accounts (
                id, user_name, normalized_user_name, display_name, email,
                normalized_email, password_hash, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        .bind(now)
        .fetch_optional(&mut **tx)
        .await
    }

    async fn try_create_account(
        pool: &SqlitePool,
        data: &CreateAccount,
    ) -> Result<Option<IdentityAccount>, Error> {
        let mut tx = pool.begin().await?;
        let account = Self::insert_account_tx(&mut tx, Uuid::new_v4(), data).await?;
        if account.is_some() {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(account)
    }

    /// One attempt at the create path. `None` means another writer linked
    /// the pair (or took the derived user name) first.
    async fn try_create_federated(
        pool: &SqlitePool,
        identity: &ExternalIdentity,
    ) -> Result<Option<FederatedAccount>, Error> {
        let data = CreateAccount {
            user_name: identity.derived_user_name(),
            display_name: identity.name.clone(),
            email: identity.email.clone(),
            password_hash: None,
        };

        // The account insert is the first statement so the transaction takes
        // the write lock before reading anything.
        let mut tx = pool.begin().await?;
        let Some(account) = Self::insert_account_tx(&mut tx, Uuid::new_v4(), &data).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let link = sqlx::query_as::<_, ExternalLoginLink>(
            r#"
            INSERT INTO external_logins (
                provider, provider_subject, provider_display_name, account_id, created_at
            )
            VALUES (?, ?, ?, ?, ?)
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
            return Ok(None);
        };

        tx.commit().await?;
        Ok(Some(FederatedAccount {
            account,
            link,
            created: true,
        }))
    }

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
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    fn engine(&self) -> Engine {
        Engine::Sqlite
    }

    async fn ping(&self) -> Result<(), IdentityStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        // Fold the WAL back into the main file before the pool goes away.
        match sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
        {
            Ok(_) => tracing::info!("Final WAL checkpoint completed"),
            Err(e) => tracing::warn!("Final WAL checkpoint failed: {}", e),
        }
        self.pool.close().await;
        tracing::info!("SQLite connection pool closed");
    }

    async fn create_account(
        &self,
        data: &CreateAccount,
    ) -> Result<IdentityAccount, IdentityStoreError> {
        let account = with_retry(&self.retry, "create_account", || {
            Self::try_create_account(&self.pool, data)
        })
        .await?;

        account.ok_or_else(|| {
            IdentityStoreError::Conflict(format!(
                "user name `{}` is already taken",
                data.user_name
            ))
        })
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<IdentityAccount>, IdentityStoreError> {
        let account = sqlx::query_as::<_, IdentityAccount>(
            r#"
            SELECT id, user_name, display_name, email, password_hash, created_at, updated_at
            FROM identity_accounts
            WHERE id = ?
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
            WHERE normalized_user_name = ?
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
            WHERE normalized_email = ?
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
        let account = with_retry(&self.retry, "update_account", || async move {
            sqlx::query_as::<_, IdentityAccount>(
                r#"
                UPDATE identity_accounts
                SET display_name     = COALESCE(?, display_name),
                    email            = COALESCE(?, email),
                    normalized_email = COALESCE(?, normalized_email),
                    password_hash    = COALESCE(?, password_hash),
                    updated_at       = ?
                WHERE id = ?
                RETURNING id, user_name, display_name, email, password_hash, created_at, updated_at
                "#,
            )
            .bind(&data.display_name)
            .bind(&data.email)
            .bind(data.email.as_deref().map(normalize_key))
            .bind(&data.password_hash)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
        })
        .await?;

        account.ok_or(IdentityStoreError::NotFound)
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
            WHERE provider = ? AND provider_subject = ?
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
            WHERE account_id = ?
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

        let link = with_retry(&self.retry, "add_external_login", || async move {
            sqlx::query_as::<_, ExternalLoginLink>(
                r#"
                INSERT INTO external_logins (
                    provider, provider_subject, provider_display_name, account_id, created_at
                )
                VALUES (?, ?, ?, ?, ?)
                RETURNING provider, provider_subject, provider_display_name, account_id, created_at
                "#,
            )
            .bind(&identity.provider)
            .bind(&identity.subject)
            .bind(&identity.provider_display_name)
            .bind(account_id)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
        })
        .await?;

        Ok(link)
    }

    async fn remove_external_login(
        &self,
        account_id: Uuid,
        provider: &str,
    ) -> Result<(), IdentityStoreError> {
        let result = with_retry(&self.retry, "remove_external_login", || async move {
            sqlx::query("DELETE FROM external_logins WHERE account_id = ? AND provider = ?")
                .bind(account_id)
                .bind(provider)
                .execute(&self.pool)
                .await
        })
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

        let created = with_retry(&self.retry, "find_or_create_external", || {
            Self::try_create_federated(&self.pool, identity)
        })
        .await?;

        match created {
            Some(federated) => {
                tracing::info!(
                    account_id = %federated.account.id,
                    provider = %identity.provider,
                    "Created account for external identity"
                );
                Ok(federated)
            }
            None => self.existing_federation(identity).await,
        }
    }

    async fn create_role(&self, name: &str) -> Result<IdentityRole, IdentityStoreError> {
        with_retry(&self.retry, "create_role", || async move {
            sqlx::query(
                r#"
                INSERT INTO identity_roles (id, name, normalized_name, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (normalized_name) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(normalize_key(name))
            .bind(Utc::now())
            .execute(&self.pool)
            .await
        })
        .await?;

        let role = sqlx::query_as::<_, IdentityRole>(
            "SELECT id, name, created_at FROM identity_roles WHERE normalized_name = ?",
        )
        .bind(normalize_key(name))
        .fetch_one(&self.pool)
        .await?;

        Ok(role)
    }

    async fn add_to_role(&self, account_id: Uuid, role: &str) -> Result<(), IdentityStoreError> {
        let role_id: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM identity_roles WHERE normalized_name = ?")
                .bind(normalize_key(role))
                .fetch_optional(&self.pool)
                .await?;

        let role_id = role_id.ok_or_else(|| IdentityStoreError::RoleNotFound(role.to_string()))?;

        if self.find_account(account_id).await?.is_none() {
            return Err(IdentityStoreError::NotFound);
        }

        with_retry(&self.retry, "add_to_role", || async move {
            sqlx::query(
                "INSERT INTO account_roles (account_id, role_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(account_id)
            .bind(role_id)
            .execute(&self.pool)
            .await
        })
        .await?;

        Ok(())
    }

    async fn roles_for(&self, account_id: Uuid) -> Result<Vec<String>, IdentityStoreError> {
        let roles: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT r.name
            FROM account_roles ar
            JOIN identity_roles r ON r.id = ar.role_id
            WHERE ar.account_id = ?
            ORDER BY r.name ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(roles)
    }
}
