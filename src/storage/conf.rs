use anyhow::Result;
use sqlx::SqlitePool;
use tokio::sync::watch;

use super::schema::Database;
use super::types::{Conf, SortOrder};

/// Raw conf row as stored (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
struct ConfRow {
    sort_order: String,
    show_read_entries: bool,
    show_preview_images: bool,
    crop_preview_images: bool,
    use_built_in_browser: bool,
    sync_on_startup: bool,
    synced_on_startup: bool,
    initial_sync_completed: bool,
}

impl ConfRow {
    fn into_conf(self) -> Conf {
        Conf {
            sort_order: SortOrder::from_db(&self.sort_order),
            show_read_entries: self.show_read_entries,
            show_preview_images: self.show_preview_images,
            crop_preview_images: self.crop_preview_images,
            use_built_in_browser: self.use_built_in_browser,
            sync_on_startup: self.sync_on_startup,
            synced_on_startup: self.synced_on_startup,
            initial_sync_completed: self.initial_sync_completed,
        }
    }
}

/// Load the conf row at open time, inserting defaults on first run.
///
/// Also clears `synced_on_startup`: the flag is a per-session guard for the
/// startup sync and must start each session false.
pub(crate) async fn bootstrap_conf(pool: &SqlitePool) -> Result<Conf> {
    let row: Option<ConfRow> = sqlx::query_as(
        r#"
        SELECT sort_order, show_read_entries, show_preview_images, crop_preview_images,
               use_built_in_browser, sync_on_startup, synced_on_startup, initial_sync_completed
        FROM conf WHERE id = 1
    "#,
    )
    .fetch_optional(pool)
    .await?;

    let conf = match row {
        Some(row) => {
            let mut conf = row.into_conf();
            if conf.synced_on_startup {
                sqlx::query("UPDATE conf SET synced_on_startup = 0 WHERE id = 1")
                    .execute(pool)
                    .await?;
                conf.synced_on_startup = false;
            }
            conf
        }
        None => {
            let conf = Conf::default();
            persist_conf(pool, &conf).await?;
            conf
        }
    };

    Ok(conf)
}

async fn persist_conf(pool: &SqlitePool, conf: &Conf) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO conf (id, sort_order, show_read_entries, show_preview_images,
                          crop_preview_images, use_built_in_browser, sync_on_startup,
                          synced_on_startup, initial_sync_completed)
        VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            sort_order = excluded.sort_order,
            show_read_entries = excluded.show_read_entries,
            show_preview_images = excluded.show_preview_images,
            crop_preview_images = excluded.crop_preview_images,
            use_built_in_browser = excluded.use_built_in_browser,
            sync_on_startup = excluded.sync_on_startup,
            synced_on_startup = excluded.synced_on_startup,
            initial_sync_completed = excluded.initial_sync_completed
    "#,
    )
    .bind(conf.sort_order.as_str())
    .bind(conf.show_read_entries)
    .bind(conf.show_preview_images)
    .bind(conf.crop_preview_images)
    .bind(conf.use_built_in_browser)
    .bind(conf.sync_on_startup)
    .bind(conf.synced_on_startup)
    .bind(conf.initial_sync_completed)
    .execute(pool)
    .await?;

    Ok(())
}

impl Database {
    // ========================================================================
    // Configuration Operations
    // ========================================================================

    /// Current configuration snapshot
    pub fn conf(&self) -> Conf {
        self.conf_tx.borrow().clone()
    }

    /// Subscribe to configuration changes
    pub fn conf_watch(&self) -> watch::Receiver<Conf> {
        self.conf_tx.subscribe()
    }

    /// Apply a copy-on-write transform to the configuration.
    ///
    /// The new value is persisted before it is broadcast, so subscribers never
    /// observe a conf that could be lost on crash. Concurrent updates are
    /// serialized; each transform sees the result of the previous one.
    pub async fn update_conf<F>(&self, transform: F) -> Result<Conf>
    where
        F: FnOnce(Conf) -> Conf,
    {
        let _guard = self.conf_lock.lock().await;
        let new = transform(self.conf());
        persist_conf(&self.pool, &new).await?;
        self.conf_tx.send_replace(new.clone());
        Ok(new)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Conf, Database, SortOrder};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_defaults_on_first_open() {
        let db = test_db().await;
        assert_eq!(db.conf(), Conf::default());
    }

    #[tokio::test]
    async fn test_update_conf_persists_and_broadcasts() {
        let db = test_db().await;
        let mut watch = db.conf_watch();

        let updated = db
            .update_conf(|c| Conf {
                sort_order: SortOrder::Ascending,
                show_read_entries: true,
                ..c
            })
            .await
            .unwrap();

        assert_eq!(updated.sort_order, SortOrder::Ascending);
        assert!(updated.show_read_entries);

        watch.changed().await.unwrap();
        assert_eq!(*watch.borrow(), updated);
        assert_eq!(db.conf(), updated);
    }

    #[tokio::test]
    async fn test_transforms_compose() {
        let db = test_db().await;
        db.update_conf(|c| Conf {
            initial_sync_completed: true,
            ..c
        })
        .await
        .unwrap();
        db.update_conf(|c| Conf {
            synced_on_startup: true,
            ..c
        })
        .await
        .unwrap();

        let conf = db.conf();
        assert!(conf.initial_sync_completed);
        assert!(conf.synced_on_startup);
    }

    #[tokio::test]
    async fn test_sort_order_round_trip() {
        assert_eq!(SortOrder::from_db("ascending"), SortOrder::Ascending);
        assert_eq!(SortOrder::from_db("descending"), SortOrder::Descending);
        assert_eq!(SortOrder::Ascending.flipped(), SortOrder::Descending);
    }

    #[test]
    #[should_panic(expected = "invalid sort order")]
    fn test_unknown_sort_order_is_fatal() {
        SortOrder::from_db("sideways");
    }
}
