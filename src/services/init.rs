//! Startup helpers:
//! - database connection + migrations
//! - wiring of the ledger, request book, dispatcher and reconciler
//! - background worker spawn helpers

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::services::ledger::{LedgerWriter, SqliteLedgerStore};
use crate::services::lifecycle::Lifecycle;
use crate::services::notifications::{NotificationDispatcher, SqliteInbox};
use crate::services::reconciliation::Reconciler;
use crate::services::requests::RequestBook;
use crate::AppState;

/// Redact potentially sensitive information from a database URL before logging.
///
/// Attempts to parse the URL and remove userinfo (username:password) components.
/// Falls back to removing everything before '@' or returning "(redacted)".
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url::Url::parse(db_url) {
        let host = url.host_str().unwrap_or("");
        let port_part = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        format!("{}://{}{}{}", url.scheme(), host, port_part, url.path())
    } else if let Some(at_pos) = db_url.find('@') {
        format!("(redacted){}", &db_url[at_pos + 1..])
    } else {
        "(redacted)".to_string()
    }
}

/// Open the SQLite pool and run migrations.
///
/// The parent directory of the database file is created when missing.
pub async fn init_db(config: &Config) -> Result<SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    let db_file_path = Path::new(db_path);

    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;
    tracing::info!("Connected to database file: {}", db_file_path.display());

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Wire the services over one pool.
pub fn build_state(pool: SqlitePool, config: Config) -> Arc<AppState> {
    let ledger = Arc::new(LedgerWriter::new(
        Arc::new(SqliteLedgerStore::new(
            pool.clone(),
            config.ledger.max_write_attempts,
        )),
        &config.ledger,
    ));
    let requests = RequestBook::new(
        pool.clone(),
        ledger.clone(),
        config.ledger.max_write_attempts,
    );
    let dispatcher = NotificationDispatcher::new(
        Arc::new(SqliteInbox::new(pool.clone())),
        config.fanout.clone(),
    );

    Arc::new(AppState {
        lifecycle: Lifecycle::new(pool.clone(), ledger.clone(), requests, dispatcher),
        reconciler: Reconciler::new(pool.clone(), ledger.clone()),
        ledger,
        db: pool,
        config,
    })
}

/// Spawn background workers:
/// - periodic ledger reconciliation with repair
///
/// Each worker listens for shutdown on the broadcast channel; the returned
/// handles let the caller wait for them to exit.
pub fn spawn_background_workers(
    state: Arc<AppState>,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    if !state.config.reconciliation.enabled {
        tracing::info!("Ledger reconciliation worker disabled");
        return handles;
    }

    let mut shutdown_rx = shutdown.subscribe();
    let interval = Duration::from_secs(state.config.reconciliation.interval_seconds.max(1));
    handles.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Reconciliation worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            tracing::info!("Starting periodic ledger reconciliation");
            match state.reconciler.reconcile_all(true).await {
                Ok(reports) => {
                    let repaired: usize = reports.iter().map(|r| r.repaired).sum();
                    if repaired > 0 {
                        tracing::warn!("Reconciliation repaired {} ledger entries", repaired);
                    }
                }
                Err(e) => tracing::warn!("Ledger reconciliation failed: {:?}", e),
            }
        }
    }));

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_config, test_pool};

    #[test]
    fn redacts_credentials() {
        assert_eq!(
            redact_db_url("postgres://user:secret@db:5432/app"),
            "postgres://db:5432/app"
        );
        assert_eq!(
            redact_db_url("sqlite://data/donations.db"),
            "sqlite://data/donations.db"
        );
        assert_eq!(redact_db_url("donations.db"), "(redacted)");
    }

    #[tokio::test]
    async fn disabled_worker_is_not_spawned() {
        let state = build_state(test_pool().await, (*test_config()).clone());
        let (tx, _rx) = tokio::sync::broadcast::channel(1);
        assert!(spawn_background_workers(state, tx).is_empty());
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown() {
        let mut config = (*test_config()).clone();
        config.reconciliation.enabled = true;
        config.reconciliation.interval_seconds = 3600;
        let state = build_state(test_pool().await, config);
        let (tx, _rx) = tokio::sync::broadcast::channel(1);

        let handles = spawn_background_workers(state, tx.clone());
        assert_eq!(handles.len(), 1);
        tokio_test::assert_ok!(tx.send(()));
        for h in handles {
            tokio::time::timeout(Duration::from_secs(5), h)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
