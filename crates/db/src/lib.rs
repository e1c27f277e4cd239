use std::sync::Arc;

use sqlx::migrate::MigrateError;
use thiserror::Error;
use tracing::info;

pub mod engine;
pub mod models;
pub mod postgres;
pub mod retry;
pub mod sqlite;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use engine::{DatabaseConfig, Engine, EngineError};
pub use postgres::PgIdentityStore;
pub use retry::{RetryConfig, is_retryable_error, with_retry};
pub use sqlite::SqliteIdentityStore;
pub use store::{IdentityStore, IdentityStoreError};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to connect to {engine}: {source}")]
    Connect {
        engine: Engine,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to migrate {engine} schema: {source}")]
    Migrate {
        engine: Engine,
        #[source]
        source: MigrateError,
    },
}

/// The activated persistence engine and the identity store bound to it.
#[derive(Clone)]
pub struct DBService {
    engine: Engine,
    store: Arc<dyn IdentityStore>,
}

impl DBService {
    /// Pick the engine from `config`, connect, and bring its schema up to date.
    ///
    /// Fails before any connection is attempted when zero or (without a
    /// preferred engine) two connection strings are configured.
    pub async fn select_and_activate(config: &DatabaseConfig) -> Result<DBService, DbError> {
        let engine = config.select_engine()?;
        let url = config
            .url_for(engine)
            .ok_or(DbError::Engine(EngineError::NotConfigured))?;

        info!(engine = %engine, migrations = engine.migrations_dir(), "Activating identity store");

        let store: Arc<dyn IdentityStore> = match engine {
            Engine::Postgres => {
                let pool = postgres::create_pool(url)
                    .await
                    .map_err(|source| DbError::Connect { engine, source })?;
                postgres::migrate(&pool)
                    .await
                    .map_err(|source| DbError::Migrate { engine, source })?;
                Arc::new(PgIdentityStore::new(pool))
            }
            Engine::Sqlite => {
                let pool = sqlite::create_pool(url)
                    .await
                    .map_err(|source| DbError::Connect { engine, source })?;
                sqlite::migrate(&pool)
                    .await
                    .map_err(|source| DbError::Migrate { engine, source })?;
                Arc::new(SqliteIdentityStore::new(pool))
            }
        };

        Ok(DBService { engine, store })
    }

    /// Wrap an already-migrated store.
    pub fn from_store(store: Arc<dyn IdentityStore>) -> Self {
        Self {
            engine: store.engine(),
            store,
        }
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn store(&self) -> Arc<dyn IdentityStore> {
        self.store.clone()
    }
}
