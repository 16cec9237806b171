use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::types::{Conf, DatabaseError};

// ============================================================================
// Database
// ============================================================================

/// Handle to the local cache: feeds, entries and the conf singleton.
///
/// Cloneable; all clones share one pool and one set of change channels.
/// Reactivity is a revision counter bumped on every write — subscribers
/// re-query on change rather than receiving row deltas.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    pub(crate) conf_tx: Arc<watch::Sender<Conf>>,
    // Serializes read-modify-write conf updates across clones
    pub(crate) conf_lock: Arc<tokio::sync::Mutex<()>>,
    pub(crate) revision_tx: Arc<watch::Sender<u64>>,
}

impl Database {
    /// Open a database connection, run migrations and load the conf row.
    ///
    /// `synced_on_startup` is reset to false here: it guards the once-per-session
    /// startup sync and must not survive across sessions.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another instance of tidings
    /// has the database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Migration` if the schema could not be created.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // Restrict the database file to the owning user before the pool
        // touches it, so it never exists with default umask permissions.
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            if std::path::Path::new(path).exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            }
        }

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to release
        // before returning SQLITE_BUSY. Handles transient contention between
        // sync writes and view queries. pragma() applies to every pooled connection.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000")
            .pragma("foreign_keys", "ON");
        // SQLite is single-writer; 5 connections covers peak concurrent readers
        // (entry fetch phases + view recomputations).
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        migrate(&pool).await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
                || error_string.contains("sqlite_busy")
                || error_string.contains("sqlite_locked")
            {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;

        let conf = super::conf::bootstrap_conf(&pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        let (conf_tx, _) = watch::channel(conf);
        let (revision_tx, _) = watch::channel(0u64);
        Ok(Self {
            pool,
            conf_tx: Arc::new(conf_tx),
            conf_lock: Arc::new(tokio::sync::Mutex::new(())),
            revision_tx: Arc::new(revision_tx),
        })
    }

    /// Subscribe to the store change signal.
    ///
    /// The value is a monotonic revision counter; any bump means feed or entry
    /// rows may have changed and dependent queries should be re-issued.
    pub fn revisions(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    pub(crate) fn bump_revision(&self) {
        self.revision_tx.send_modify(|r| *r = r.wrapping_add(1));
    }
}

/// Run database migrations atomically within a transaction.
///
/// All schema changes are wrapped in a single transaction: if any step fails,
/// the database is left in its previous consistent state. All statements use
/// `IF NOT EXISTS`, so re-running on an existing database is a no-op.
async fn migrate(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feeds (
            id TEXT PRIMARY KEY,
            url TEXT UNIQUE NOT NULL,
            title TEXT NOT NULL,
            subscribed_at INTEGER NOT NULL,
            show_preview_images INTEGER,
            open_entries_in_browser INTEGER
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            id TEXT PRIMARY KEY,
            feed_id TEXT NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            summary TEXT,
            published INTEGER NOT NULL,
            links TEXT NOT NULL DEFAULT '[]',
            og_image_url TEXT,
            og_image_width INTEGER,
            og_image_height INTEGER,
            read INTEGER NOT NULL DEFAULT 0,
            read_synced INTEGER NOT NULL DEFAULT 1,
            bookmarked INTEGER NOT NULL DEFAULT 0,
            bookmarked_synced INTEGER NOT NULL DEFAULT 1,
            fetched_at INTEGER NOT NULL
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    // Composite index for the per-feed view: filters by feed_id, sorts by published
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_feed_published ON entries(feed_id, published)",
    )
    .execute(&mut *tx)
    .await?;

    // Covers the combined read/bookmarked selection used by every list view
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_read_bookmarked ON entries(read, bookmarked, published)",
    )
    .execute(&mut *tx)
    .await?;

    // Partial indexes for the flag push phase: only unsynced rows are scanned
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_read_pending ON entries(id) WHERE read_synced = 0",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_bookmarked_pending ON entries(id) WHERE bookmarked_synced = 0",
    )
    .execute(&mut *tx)
    .await?;

    // Singleton configuration row (id constrained to 1)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conf (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            sort_order TEXT NOT NULL,
            show_read_entries INTEGER NOT NULL,
            show_preview_images INTEGER NOT NULL,
            crop_preview_images INTEGER NOT NULL,
            use_built_in_browser INTEGER NOT NULL,
            sync_on_startup INTEGER NOT NULL,
            synced_on_startup INTEGER NOT NULL,
            initial_sync_completed INTEGER NOT NULL
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(())
}
