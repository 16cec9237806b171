use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Entry, EntryDbRow, EntryFlags, FetchedEntry, SortOrder};

/// Maximum number of entries to return from any single list query (OOM protection)
const MAX_ENTRIES: i64 = 2000;

const ENTRY_COLUMNS: &str = "id, feed_id, title, summary, published, links, \
     og_image_url, og_image_width, og_image_height, \
     read, read_synced, bookmarked, bookmarked_synced, fetched_at";

impl Database {
    // ========================================================================
    // Entry Upsert
    // ========================================================================

    /// Upsert entries for a feed, returns the number of new entries inserted.
    ///
    /// Keyed by stable id. For existing rows only remote metadata is refreshed
    /// (title, summary, links, image); `published`, the flags and their synced
    /// bits are never touched, and `fetched_at` keeps the first-seen time.
    pub async fn upsert_entries(&self, feed_id: &str, entries: &[FetchedEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;

        for entry in entries {
            let links = serde_json::to_string(&entry.links)?;
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO entries
                    (id, feed_id, title, summary, published, links,
                     og_image_url, og_image_width, og_image_height, fetched_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            )
            .bind(&entry.id)
            .bind(feed_id)
            .bind(&entry.title)
            .bind(&entry.summary)
            .bind(entry.published)
            .bind(&links)
            .bind(&entry.og_image_url)
            .bind(entry.og_image_width)
            .bind(entry.og_image_height)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                inserted += 1;
            } else {
                // Existing entry: refresh remote metadata only
                sqlx::query(
                    r#"
                    UPDATE entries
                    SET title = ?, summary = ?, links = ?,
                        og_image_url = ?, og_image_width = ?, og_image_height = ?
                    WHERE id = ?
                "#,
                )
                .bind(&entry.title)
                .bind(&entry.summary)
                .bind(&links)
                .bind(&entry.og_image_url)
                .bind(entry.og_image_width)
                .bind(entry.og_image_height)
                .bind(&entry.id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        self.bump_revision();
        Ok(inserted)
    }

    // ========================================================================
    // Entry Queries
    // ========================================================================

    /// Entries of one feed matching the read set and bookmarked value,
    /// sorted by published timestamp. Ties keep rowid order.
    pub async fn select_by_feed_id_read_bookmarked(
        &self,
        feed_id: &str,
        read: &[bool],
        bookmarked: bool,
        order: SortOrder,
    ) -> Result<Vec<Entry>> {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM entries WHERE feed_id = ", ENTRY_COLUMNS));
        builder.push_bind(feed_id);
        push_read_and_bookmarked(&mut builder, read, bookmarked);
        push_order_and_limit(&mut builder, order);

        let rows: Vec<EntryDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(EntryDbRow::into_entry).collect())
    }

    /// Entries across all feeds matching the read set and bookmarked value
    pub async fn select_by_read_bookmarked(
        &self,
        read: &[bool],
        bookmarked: bool,
        order: SortOrder,
    ) -> Result<Vec<Entry>> {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM entries WHERE 1 = 1", ENTRY_COLUMNS));
        push_read_and_bookmarked(&mut builder, read, bookmarked);
        push_order_and_limit(&mut builder, order);

        let rows: Vec<EntryDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(EntryDbRow::into_entry).collect())
    }

    /// Get a single entry by id
    pub async fn select_entry(&self, id: &str) -> Result<Option<Entry>> {
        let row: Option<EntryDbRow> =
            sqlx::query_as(&format!("SELECT {} FROM entries WHERE id = ?", ENTRY_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(EntryDbRow::into_entry))
    }

    /// Total entry count (change-signal proxy and sanity checks)
    pub async fn select_entry_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Latest published timestamp for a feed, used as the incremental
    /// fetch cursor. None when the feed has no entries yet.
    pub async fn select_max_published(&self, feed_id: &str) -> Result<Option<i64>> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(published) FROM entries WHERE feed_id = ?")
                .bind(feed_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    // ========================================================================
    // Flag Updates
    // ========================================================================

    /// Set the read flag and its synced bit for a set of entries in one
    /// statement (value and bit are never visible in a torn state).
    pub async fn update_read_and_read_synced(
        &self,
        ids: &[String],
        read: bool,
        read_synced: bool,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("UPDATE entries SET read = ");
        builder.push_bind(read);
        builder.push(", read_synced = ");
        builder.push_bind(read_synced);
        builder.push(" WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");
        builder.build().execute(&self.pool).await?;

        self.bump_revision();
        Ok(())
    }

    /// Set the bookmarked flag and its synced bit for one entry
    pub async fn update_bookmarked_and_bookmarked_synced(
        &self,
        id: &str,
        bookmarked: bool,
        bookmarked_synced: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE entries SET bookmarked = ?, bookmarked_synced = ? WHERE id = ?")
            .bind(bookmarked)
            .bind(bookmarked_synced)
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.bump_revision();
        Ok(())
    }

    /// Set read for all entries with the given bookmarked value, clearing the
    /// synced bit. Entries already in the target state are skipped so they do
    /// not become pending again.
    pub async fn update_read_by_bookmarked(&self, read: bool, bookmarked: bool) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE entries SET read = ?, read_synced = 0 WHERE bookmarked = ? AND read <> ?",
        )
        .bind(read)
        .bind(bookmarked)
        .bind(read)
        .execute(&self.pool)
        .await?;

        self.bump_revision();
        Ok(result.rows_affected())
    }

    /// Set read for all entries of one feed, clearing the synced bit
    pub async fn update_read_by_feed_id(&self, read: bool, feed_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE entries SET read = ?, read_synced = 0 WHERE feed_id = ? AND read <> ?",
        )
        .bind(read)
        .bind(feed_id)
        .bind(read)
        .execute(&self.pool)
        .await?;

        self.bump_revision();
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Flag Sync Bookkeeping
    // ========================================================================

    /// Entries with at least one locally mutated, not yet pushed flag
    pub async fn select_pending_flags(&self) -> Result<Vec<EntryFlags>> {
        let rows = sqlx::query_as::<_, EntryFlags>(
            r#"
            SELECT id, read, read_synced, bookmarked, bookmarked_synced
            FROM entries
            WHERE read_synced = 0 OR bookmarked_synced = 0
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Flag columns of one entry
    pub async fn select_entry_flags(&self, id: &str) -> Result<Option<EntryFlags>> {
        let row = sqlx::query_as::<_, EntryFlags>(
            r#"
            SELECT id, read, read_synced, bookmarked, bookmarked_synced
            FROM entries
            WHERE id = ?
        "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Mark pushed flags as synced.
    ///
    /// The synced bit is set only where the stored value still equals the
    /// value that was pushed: a local mutation that landed during the push
    /// round-trip keeps its unsynced bit and is retried on the next sync.
    pub async fn confirm_pushed_flags(&self, pushed: &[EntryFlags]) -> Result<()> {
        if pushed.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for flags in pushed {
            if !flags.read_synced {
                sqlx::query(
                    "UPDATE entries SET read_synced = 1 WHERE id = ? AND read = ? AND read_synced = 0",
                )
                .bind(&flags.id)
                .bind(flags.read)
                .execute(&mut *tx)
                .await?;
            }
            if !flags.bookmarked_synced {
                sqlx::query(
                    "UPDATE entries SET bookmarked_synced = 1 WHERE id = ? AND bookmarked = ? AND bookmarked_synced = 0",
                )
                .bind(&flags.id)
                .bind(flags.bookmarked)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        self.bump_revision();
        Ok(())
    }

    /// Merge remote flag values into one entry in a single statement.
    ///
    /// Each flag adopts the remote value only while its synced bit is set;
    /// a flag with a pending local mutation is left untouched, as are both
    /// synced bits. The merge condition is evaluated inside the UPDATE, so a
    /// local mutation can never be clobbered between a read and a write.
    /// Returns true if a row actually changed.
    pub async fn merge_remote_flags(&self, id: &str, read: bool, bookmarked: bool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE entries SET
                read = CASE WHEN read_synced THEN ? ELSE read END,
                bookmarked = CASE WHEN bookmarked_synced THEN ? ELSE bookmarked END
            WHERE id = ?
              AND ((read_synced AND read <> ?) OR (bookmarked_synced AND bookmarked <> ?))
        "#,
        )
        .bind(read)
        .bind(bookmarked)
        .bind(id)
        .bind(read)
        .bind(bookmarked)
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            self.bump_revision();
        }
        Ok(changed)
    }
}

fn push_read_and_bookmarked(
    builder: &mut QueryBuilder<'_, sqlx::Sqlite>,
    read: &[bool],
    bookmarked: bool,
) {
    // A read set covering both values needs no predicate
    if read.len() == 1 {
        builder.push(" AND read = ");
        builder.push_bind(read[0]);
    }
    builder.push(" AND bookmarked = ");
    builder.push_bind(bookmarked);
}

fn push_order_and_limit(builder: &mut QueryBuilder<'_, sqlx::Sqlite>, order: SortOrder) {
    match order {
        SortOrder::Ascending => builder.push(" ORDER BY published ASC"),
        SortOrder::Descending => builder.push(" ORDER BY published DESC"),
    };
    builder.push(" LIMIT ");
    builder.push_bind(MAX_ENTRIES);
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, FetchedEntry, FetchedFeed, Link, SortOrder};

    async fn test_db() -> Database {
        let db = Database::open(":memory:").await.unwrap();
        db.insert_feed(&FetchedFeed {
            id: "f1".to_string(),
            url: "https://example.com/feed.xml".to_string(),
            title: "Feed".to_string(),
        })
        .await
        .unwrap();
        db
    }

    fn fetched(id: &str, published: i64) -> FetchedEntry {
        FetchedEntry {
            id: id.to_string(),
            title: format!("Entry {}", id),
            summary: Some("Summary".to_string()),
            published,
            links: vec![Link {
                href: format!("https://example.com/{}", id),
                rel: Some("alternate".to_string()),
            }],
            og_image_url: None,
            og_image_width: None,
            og_image_height: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_counts_new_entries_only() {
        let db = test_db().await;

        let inserted = db
            .upsert_entries("f1", &[fetched("e1", 100), fetched("e2", 200)])
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let inserted = db
            .upsert_entries("f1", &[fetched("e1", 100), fetched("e3", 300)])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(db.select_entry_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_upsert_preserves_flags_and_published() {
        let db = test_db().await;
        db.upsert_entries("f1", &[fetched("e1", 100)]).await.unwrap();
        db.update_read_and_read_synced(&["e1".to_string()], true, false)
            .await
            .unwrap();

        let mut refreshed = fetched("e1", 999);
        refreshed.title = "Updated Title".to_string();
        db.upsert_entries("f1", &[refreshed]).await.unwrap();

        let entry = db.select_entry("e1").await.unwrap().unwrap();
        assert_eq!(entry.title, "Updated Title");
        assert_eq!(entry.published, 100, "published is stable across refresh");
        assert!(entry.read);
        assert!(!entry.read_synced);
    }

    #[tokio::test]
    async fn test_links_round_trip() {
        let db = test_db().await;
        db.upsert_entries("f1", &[fetched("e1", 100)]).await.unwrap();

        let entry = db.select_entry("e1").await.unwrap().unwrap();
        assert_eq!(entry.links.len(), 1);
        assert_eq!(entry.links[0].href, "https://example.com/e1");
        assert_eq!(entry.links[0].rel.as_deref(), Some("alternate"));
    }

    #[tokio::test]
    async fn test_select_sorted_ascending_and_descending() {
        let db = test_db().await;
        db.upsert_entries("f1", &[fetched("e1", 300), fetched("e2", 100), fetched("e3", 200)])
            .await
            .unwrap();

        let asc = db
            .select_by_read_bookmarked(&[false, true], false, SortOrder::Ascending)
            .await
            .unwrap();
        let published: Vec<i64> = asc.iter().map(|e| e.published).collect();
        assert_eq!(published, vec![100, 200, 300]);

        let desc = db
            .select_by_read_bookmarked(&[false, true], false, SortOrder::Descending)
            .await
            .unwrap();
        let published: Vec<i64> = desc.iter().map(|e| e.published).collect();
        assert_eq!(published, vec![300, 200, 100]);
    }

    #[tokio::test]
    async fn test_read_set_filters() {
        let db = test_db().await;
        db.upsert_entries("f1", &[fetched("e1", 100), fetched("e2", 200)])
            .await
            .unwrap();
        db.update_read_and_read_synced(&["e1".to_string()], true, false)
            .await
            .unwrap();

        let unread_only = db
            .select_by_read_bookmarked(&[false], false, SortOrder::Descending)
            .await
            .unwrap();
        assert_eq!(unread_only.len(), 1);
        assert_eq!(unread_only[0].id, "e2");

        let all = db
            .select_by_read_bookmarked(&[false, true], false, SortOrder::Descending)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_bookmarked_filter() {
        let db = test_db().await;
        db.upsert_entries("f1", &[fetched("e1", 100), fetched("e2", 200)])
            .await
            .unwrap();
        db.update_bookmarked_and_bookmarked_synced("e1", true, false)
            .await
            .unwrap();

        let bookmarked = db
            .select_by_read_bookmarked(&[false, true], true, SortOrder::Descending)
            .await
            .unwrap();
        assert_eq!(bookmarked.len(), 1);
        assert_eq!(bookmarked[0].id, "e1");
        assert!(!bookmarked[0].bookmarked_synced);
    }

    #[tokio::test]
    async fn test_mark_all_read_skips_already_read() {
        let db = test_db().await;
        db.upsert_entries("f1", &[fetched("e1", 100), fetched("e2", 200)])
            .await
            .unwrap();
        // e1 was read and already confirmed synced
        db.update_read_and_read_synced(&["e1".to_string()], true, true)
            .await
            .unwrap();

        let changed = db.update_read_by_bookmarked(true, false).await.unwrap();
        assert_eq!(changed, 1, "only e2 should change");

        let e1 = db.select_entry_flags("e1").await.unwrap().unwrap();
        assert!(e1.read_synced, "already-synced read flag must stay synced");
        let e2 = db.select_entry_flags("e2").await.unwrap().unwrap();
        assert!(e2.read && !e2.read_synced);
    }

    #[tokio::test]
    async fn test_pending_flags_and_confirm() {
        let db = test_db().await;
        db.upsert_entries("f1", &[fetched("e1", 100), fetched("e2", 200)])
            .await
            .unwrap();
        db.update_read_and_read_synced(&["e1".to_string()], true, false)
            .await
            .unwrap();
        db.update_bookmarked_and_bookmarked_synced("e2", true, false)
            .await
            .unwrap();

        let pending = db.select_pending_flags().await.unwrap();
        assert_eq!(pending.len(), 2);

        db.confirm_pushed_flags(&pending).await.unwrap();
        assert!(db.select_pending_flags().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_confirm_skips_flags_mutated_during_push() {
        let db = test_db().await;
        db.upsert_entries("f1", &[fetched("e1", 100)]).await.unwrap();
        db.update_read_and_read_synced(&["e1".to_string()], true, false)
            .await
            .unwrap();

        let pushed = db.select_pending_flags().await.unwrap();

        // User flips the flag back while the push is in flight
        db.update_read_and_read_synced(&["e1".to_string()], false, false)
            .await
            .unwrap();

        db.confirm_pushed_flags(&pushed).await.unwrap();

        let flags = db.select_entry_flags("e1").await.unwrap().unwrap();
        assert!(!flags.read);
        assert!(!flags.read_synced, "newer local value must stay pending");
    }

    #[tokio::test]
    async fn test_merge_remote_flags_reports_change() {
        let db = test_db().await;
        db.upsert_entries("f1", &[fetched("e1", 100)]).await.unwrap();

        assert!(db.merge_remote_flags("e1", true, false).await.unwrap());
        assert!(!db.merge_remote_flags("e1", true, false).await.unwrap());

        let flags = db.select_entry_flags("e1").await.unwrap().unwrap();
        assert!(flags.read);
        assert!(flags.read_synced, "merge must not clear synced bits");
    }

    #[tokio::test]
    async fn test_merge_remote_flags_spares_pending_local_edit() {
        let db = test_db().await;
        db.upsert_entries("f1", &[fetched("e1", 100)]).await.unwrap();
        db.update_read_and_read_synced(&["e1".to_string()], true, false)
            .await
            .unwrap();
        db.update_bookmarked_and_bookmarked_synced("e1", false, true)
            .await
            .unwrap();

        // Remote disagrees on both flags; only the synced one may move
        assert!(db.merge_remote_flags("e1", false, true).await.unwrap());

        let flags = db.select_entry_flags("e1").await.unwrap().unwrap();
        assert!(flags.read, "pending local read edit survives the merge");
        assert!(!flags.read_synced, "still pending until pushed");
        assert!(flags.bookmarked, "synced flag adopts the remote value");
        assert!(flags.bookmarked_synced);
    }

    #[tokio::test]
    async fn test_merge_remote_flags_unknown_entry_is_noop() {
        let db = test_db().await;
        assert!(!db.merge_remote_flags("ghost", true, true).await.unwrap());
    }
}
