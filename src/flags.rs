//! Optimistic local flag mutations.
//!
//! Each mutation writes the new value and clears the matching `*_synced` bit
//! in one statement, then requests a flags-only sync. The request is
//! best-effort: if it is dropped or fails, the cleared bit keeps the entry
//! pending and the next sync trigger picks it up.

use anyhow::Result;
use tokio::sync::mpsc;

use crate::storage::{Database, EntriesFilter};
use crate::sync::SyncArgs;

pub struct FlagMutator {
    db: Database,
    sync_requests: mpsc::Sender<SyncArgs>,
}

impl FlagMutator {
    pub fn new(db: Database, sync_requests: mpsc::Sender<SyncArgs>) -> Self {
        Self { db, sync_requests }
    }

    /// Set the read flag for a set of entries
    pub async fn set_read(&self, ids: &[String], read: bool) -> Result<()> {
        self.db.update_read_and_read_synced(ids, read, false).await?;
        self.request_flags_sync();
        Ok(())
    }

    /// Set the bookmarked flag for one entry
    pub async fn set_bookmarked(&self, id: &str, bookmarked: bool) -> Result<()> {
        self.db
            .update_bookmarked_and_bookmarked_synced(id, bookmarked, false)
            .await?;
        self.request_flags_sync();
        Ok(())
    }

    /// Mark every entry in the filter's scope as read
    pub async fn mark_all_read(&self, filter: &EntriesFilter) -> Result<()> {
        let changed = match filter {
            EntriesFilter::NotBookmarked => self.db.update_read_by_bookmarked(true, false).await?,
            EntriesFilter::Bookmarked => self.db.update_read_by_bookmarked(true, true).await?,
            EntriesFilter::BelongToFeed { feed_id } => {
                self.db.update_read_by_feed_id(true, feed_id).await?
            }
        };

        if changed > 0 {
            self.request_flags_sync();
        }
        Ok(())
    }

    /// Fire-and-forget flags-only sync request. Never blocks the caller and
    /// never surfaces a failure synchronously.
    fn request_flags_sync(&self) {
        if let Err(e) = self.sync_requests.try_send(SyncArgs::flags_only()) {
            tracing::debug!(error = %e, "Flags sync request dropped; next sync covers it");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Database, EntriesFilter, FetchedEntry, FetchedFeed};

    async fn test_db() -> Database {
        let db = Database::open(":memory:").await.unwrap();
        db.insert_feed(&FetchedFeed {
            id: "f1".to_string(),
            url: "https://example.com/feed.xml".to_string(),
            title: "Feed".to_string(),
        })
        .await
        .unwrap();
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
        db
    }

    fn mutator(db: &Database) -> (FlagMutator, mpsc::Receiver<SyncArgs>) {
        let (tx, rx) = mpsc::channel(4);
        (FlagMutator::new(db.clone(), tx), rx)
    }

    #[tokio::test]
    async fn test_set_read_clears_synced_and_requests_sync() {
        let db = test_db().await;
        let (mutator, mut rx) = mutator(&db);

        mutator
            .set_read(&["e1".to_string(), "e2".to_string()], true)
            .await
            .unwrap();

        for id in ["e1", "e2"] {
            let flags = db.select_entry_flags(id).await.unwrap().unwrap();
            assert!(flags.read);
            assert!(!flags.read_synced);
        }

        let requested = rx.try_recv().unwrap();
        assert_eq!(requested, SyncArgs::flags_only());
    }

    #[tokio::test]
    async fn test_set_bookmarked_clears_synced() {
        let db = test_db().await;
        let (mutator, _rx) = mutator(&db);

        mutator.set_bookmarked("e3", true).await.unwrap();

        let flags = db.select_entry_flags("e3").await.unwrap().unwrap();
        assert!(flags.bookmarked);
        assert!(!flags.bookmarked_synced);
        assert!(flags.read_synced, "read flag untouched");
    }

    #[tokio::test]
    async fn test_mark_all_read_respects_filter_scope() {
        let db = test_db().await;
        let (mutator, _rx) = mutator(&db);
        mutator.set_bookmarked("e1", true).await.unwrap();

        mutator
            .mark_all_read(&EntriesFilter::NotBookmarked)
            .await
            .unwrap();

        let e1 = db.select_entry_flags("e1").await.unwrap().unwrap();
        assert!(!e1.read, "bookmarked entry is outside NotBookmarked scope");
        let e2 = db.select_entry_flags("e2").await.unwrap().unwrap();
        assert!(e2.read && !e2.read_synced);
    }

    #[tokio::test]
    async fn test_mark_all_read_by_feed() {
        let db = test_db().await;
        let (mutator, _rx) = mutator(&db);

        mutator
            .mark_all_read(&EntriesFilter::BelongToFeed {
                feed_id: "f1".to_string(),
            })
            .await
            .unwrap();

        for id in ["e1", "e2", "e3"] {
            let flags = db.select_entry_flags(id).await.unwrap().unwrap();
            assert!(flags.read && !flags.read_synced);
        }
    }

    #[tokio::test]
    async fn test_dropped_request_does_not_fail_mutation() {
        let db = test_db().await;
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mutator = FlagMutator::new(db.clone(), tx);

        mutator.set_read(&["e1".to_string()], true).await.unwrap();

        let flags = db.select_entry_flags("e1").await.unwrap().unwrap();
        assert!(flags.read && !flags.read_synced);
    }
}
