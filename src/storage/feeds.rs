use anyhow::Result;

use super::schema::Database;
use super::types::{Feed, FetchedFeed};

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Upsert feed metadata from a remote refresh.
    ///
    /// Keyed by stable id; title and url are refreshed, subscription time and
    /// per-feed display overrides are preserved. Feeds absent from `feeds`
    /// are left untouched (no implicit unsubscribe from a partial listing).
    pub async fn upsert_feeds(&self, feeds: &[FetchedFeed]) -> Result<()> {
        if feeds.is_empty() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for feed in feeds {
            sqlx::query(
                r#"
                INSERT INTO feeds (id, url, title, subscribed_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    url = excluded.url,
                    title = excluded.title
            "#,
            )
            .bind(&feed.id)
            .bind(&feed.url)
            .bind(&feed.title)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.bump_revision();
        Ok(())
    }

    /// Insert a newly subscribed feed
    pub async fn insert_feed(&self, feed: &FetchedFeed) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO feeds (id, url, title, subscribed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                title = excluded.title
        "#,
        )
        .bind(&feed.id)
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.bump_revision();
        Ok(())
    }

    /// Get all subscribed feeds, ordered by title
    pub async fn select_feeds(&self) -> Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>(
            r#"
            SELECT id, url, title, subscribed_at, show_preview_images, open_entries_in_browser
            FROM feeds
            ORDER BY title
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(feeds)
    }

    /// Get a single feed by id
    pub async fn select_feed(&self, feed_id: &str) -> Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>(
            r#"
            SELECT id, url, title, subscribed_at, show_preview_images, open_entries_in_browser
            FROM feeds
            WHERE id = ?
        "#,
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(feed)
    }

    /// Delete a feed; entries cascade. Returns the number of entries removed.
    ///
    /// Count and delete run in one transaction so the count matches what the
    /// cascade actually removed, even under concurrent entry writes.
    pub async fn delete_feed(&self, feed_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let entries: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entries WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if result.rows_affected() > 0 {
            self.bump_revision();
            Ok(entries.0 as u64)
        } else {
            Ok(0)
        }
    }

    /// Rename a feed locally
    pub async fn update_feed_title(&self, feed_id: &str, title: &str) -> Result<()> {
        sqlx::query("UPDATE feeds SET title = ? WHERE id = ?")
            .bind(title)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        self.bump_revision();
        Ok(())
    }

    /// Set or clear the per-feed preview image override
    pub async fn set_feed_show_preview_images(
        &self,
        feed_id: &str,
        value: Option<bool>,
    ) -> Result<()> {
        sqlx::query("UPDATE feeds SET show_preview_images = ? WHERE id = ?")
            .bind(value)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        self.bump_revision();
        Ok(())
    }

    /// Set or clear the per-feed open-in-browser override
    pub async fn set_feed_open_entries_in_browser(
        &self,
        feed_id: &str,
        value: Option<bool>,
    ) -> Result<()> {
        sqlx::query("UPDATE feeds SET open_entries_in_browser = ? WHERE id = ?")
            .bind(value)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        self.bump_revision();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, FetchedEntry, FetchedFeed};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn fetched(id: &str, title: &str) -> FetchedFeed {
        FetchedFeed {
            id: id.to_string(),
            url: format!("https://example.com/{}.xml", id),
            title: title.to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_feed_appears_in_list() {
        let db = test_db().await;
        db.insert_feed(&fetched("f1", "Example Feed")).await.unwrap();

        let feeds = db.select_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].id, "f1");
        assert_eq!(feeds[0].title, "Example Feed");
        assert!(feeds[0].show_preview_images.is_none());
    }

    #[tokio::test]
    async fn test_upsert_refreshes_title_keeps_overrides() {
        let db = test_db().await;
        db.insert_feed(&fetched("f1", "Old Title")).await.unwrap();
        db.set_feed_show_preview_images("f1", Some(false))
            .await
            .unwrap();

        db.upsert_feeds(&[fetched("f1", "New Title")]).await.unwrap();

        let feed = db.select_feed("f1").await.unwrap().unwrap();
        assert_eq!(feed.title, "New Title");
        assert_eq!(feed.show_preview_images, Some(false));
    }

    #[tokio::test]
    async fn test_upsert_does_not_delete_absent_feeds() {
        let db = test_db().await;
        db.insert_feed(&fetched("f1", "Keep Me")).await.unwrap();

        db.upsert_feeds(&[fetched("f2", "New Feed")]).await.unwrap();

        let feeds = db.select_feeds().await.unwrap();
        assert_eq!(feeds.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_feed_is_idempotent() {
        let db = test_db().await;
        assert_eq!(db.delete_feed("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_feed_counts_cascaded_entries() {
        let db = test_db().await;
        db.insert_feed(&fetched("f1", "Feed")).await.unwrap();
        let entries: Vec<FetchedEntry> = (1..=3)
            .map(|n| FetchedEntry {
                id: format!("e{}", n),
                title: format!("Entry {}", n),
                summary: None,
                published: 1_700_000_000 + n,
                links: Vec::new(),
                og_image_url: None,
                og_image_width: None,
                og_image_height: None,
            })
            .collect();
        db.upsert_entries("f1", &entries).await.unwrap();

        assert_eq!(db.delete_feed("f1").await.unwrap(), 3);
        assert_eq!(db.select_entry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rename_feed() {
        let db = test_db().await;
        db.insert_feed(&fetched("f1", "Old Name")).await.unwrap();
        db.update_feed_title("f1", "New Name").await.unwrap();

        let feed = db.select_feed("f1").await.unwrap().unwrap();
        assert_eq!(feed.title, "New Name");
    }

    #[tokio::test]
    async fn test_writes_bump_revision() {
        let db = test_db().await;
        let watch = db.revisions();
        let before = *watch.borrow();

        db.insert_feed(&fetched("f1", "Feed")).await.unwrap();

        assert!(*watch.borrow() > before);
    }
}
