//! Shared fixtures for unit tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::Config;
use crate::db::{Account, AccountRepository, CreateAccount, Role};

/// Fresh in-memory database with migrations applied.
///
/// A single connection that never expires, otherwise every new connection
/// would see its own empty in-memory database.
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    pool
}

/// File-backed WAL database shared by `connections` connections, for tests
/// that need writers racing on separate connections.
pub async fn file_pool(connections: u32) -> (SqlitePool, PathBuf) {
    let path = std::env::temp_dir().join(format!("donation-ledger-{}.db", Uuid::new_v4()));
    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30));
    let pool = SqlitePoolOptions::new()
        .max_connections(connections)
        .connect_with(options)
        .await
        .expect("open file sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    (pool, path)
}

/// Close the pool and remove the database file and its WAL siblings.
pub async fn drop_file_pool(pool: SqlitePool, path: PathBuf) {
    pool.close().await;
    for suffix in ["", "-wal", "-shm"] {
        let mut file = path.clone().into_os_string();
        file.push(suffix);
        let _ = std::fs::remove_file(file);
    }
}

pub async fn create_account(pool: &SqlitePool, name: &str, role: Role) -> Account {
    AccountRepository::create(
        pool,
        CreateAccount {
            name: name.to_string(),
            email: format!("{}@example.org", Uuid::new_v4()),
            role,
            needs: vec![],
        },
    )
    .await
    .expect("create account")
}

pub async fn load(pool: &SqlitePool, id: &str) -> Account {
    AccountRepository::find_by_id(pool, id)
        .await
        .expect("load account")
        .expect("account exists")
}

/// Config tuned for tests: no real backoff waits.
pub fn test_config() -> Arc<Config> {
    let mut config = Config::default();
    config.fanout.initial_backoff_ms = 1;
    config.fanout.max_backoff_ms = 2;
    config.ledger.write_timeout_ms = 2000;
    config.reconciliation.enabled = false;
    Arc::new(config)
}
