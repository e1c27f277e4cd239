//! Helpers for tests that need a migrated SQLite identity store.
//!
//! A template database is migrated once per test binary; each test gets its
//! own copy in a fresh temp dir.

use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use tempfile::TempDir;
use tokio::sync::OnceCell;

use crate::{DBService, SqliteIdentityStore, sqlite};

static TEMPLATE_DIR: OnceLock<TempDir> = OnceLock::new();
static TEMPLATE_READY: OnceCell<()> = OnceCell::const_new();

fn get_template_dir() -> &'static TempDir {
    TEMPLATE_DIR.get_or_init(|| TempDir::new().expect("Failed to create template temp dir"))
}

async fn ensure_template_ready() {
    TEMPLATE_READY
        .get_or_init(|| async {
            let template_path = get_template_dir().path().join("template.db");
            let options = sqlite::connect_options(&format!("sqlite://{}", template_path.display()))
                .expect("Invalid template database URL");

            let pool = SqlitePoolOptions::new()
                .min_connections(0)
                .max_connections(1)
                .connect_with(options)
                .await
                .expect("Failed to create template pool");

            sqlite::migrate(&pool)
                .await
                .expect("Failed to run migrations on template");

            pool.close().await;
            tracing::debug!("Template database ready at {:?}", template_path);
        })
        .await;
}

/// Pool over a private copy of the migrated template. Keep the `TempDir`
/// alive for as long as the pool is used.
pub async fn create_test_pool() -> (SqlitePool, TempDir) {
    ensure_template_ready().await;

    let temp_dir = TempDir::new().expect("Failed to create test temp dir");
    let db_path = temp_dir.path().join("test.db");
    let template_path = get_template_dir().path().join("template.db");
    std::fs::copy(&template_path, &db_path).expect("Failed to copy template database");

    let options = sqlite::connect_options(&format!("sqlite://{}", db_path.display()))
        .expect("Invalid test database URL");

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await
        .expect("Failed to create test pool");

    (pool, temp_dir)
}

pub async fn create_test_store() -> (SqliteIdentityStore, TempDir) {
    let (pool, temp_dir) = create_test_pool().await;
    (SqliteIdentityStore::new(pool), temp_dir)
}

pub async fn create_test_db_service() -> (DBService, TempDir) {
    let (store, temp_dir) = create_test_store().await;
    (DBService::from_store(Arc::new(store)), temp_dir)
}
