//! Deterministic merge of remote data and pending local mutations.
//!
//! Everything here is expressed as field-level upserts and updates: feed and
//! entry application never touches flags, flag reconciliation never touches
//! metadata. Absence from a remote page never deletes local rows.

use crate::remote::{EntryDescriptor, FeedDescriptor, FlagState};
use crate::storage::{Database, FetchedEntry, FetchedFeed};
use crate::sync::SyncError;

pub struct Reconciler {
    db: Database,
}

impl Reconciler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert remote feed metadata by stable id
    pub async fn apply_remote_feeds(&self, feeds: &[FeedDescriptor]) -> Result<(), SyncError> {
        let fetched: Vec<FetchedFeed> = feeds
            .iter()
            .map(|f| FetchedFeed {
                id: f.id.clone(),
                url: f.url.clone(),
                title: f.title.clone(),
            })
            .collect();

        self.db
            .upsert_feeds(&fetched)
            .await
            .map_err(SyncError::Storage)?;

        tracing::debug!(feeds = fetched.len(), "Applied remote feed metadata");
        Ok(())
    }

    /// Upsert remote entries for one feed by stable id.
    ///
    /// Returns the number of new entries. Local flags and the published
    /// timestamp of existing entries are left untouched.
    pub async fn apply_remote_entries(
        &self,
        feed_id: &str,
        entries: &[EntryDescriptor],
    ) -> Result<usize, SyncError> {
        let fetched: Vec<FetchedEntry> = entries
            .iter()
            .map(|e| FetchedEntry {
                id: e.id.clone(),
                title: e.title.clone(),
                summary: e.summary.clone(),
                published: e.published,
                links: e.links.clone(),
                og_image_url: e.og_image_url.clone(),
                og_image_width: e.og_image_width,
                og_image_height: e.og_image_height,
            })
            .collect();

        let inserted = self
            .db
            .upsert_entries(feed_id, &fetched)
            .await
            .map_err(SyncError::Storage)?;

        if inserted > 0 {
            tracing::debug!(feed_id = %feed_id, new = inserted, "Applied remote entries");
        }
        Ok(inserted)
    }

    /// Merge remote flag state into the store.
    ///
    /// Per flag: local wins while its synced bit is false (an un-pushed local
    /// edit is never clobbered by a slower round-trip); once synced, remote
    /// truth overwrites freely. Each entry's merge runs as a single
    /// conditional UPDATE, so a local mutation landing mid-reconciliation is
    /// never overwritten. Entries the remote knows but the store does not are
    /// skipped. Returns the number of entries changed.
    pub async fn reconcile_flags(&self, remote: &[FlagState]) -> Result<usize, SyncError> {
        let mut changed = 0usize;

        for state in remote {
            if self
                .db
                .merge_remote_flags(&state.entry_id, state.read, state.bookmarked)
                .await
                .map_err(SyncError::Storage)?
            {
                changed += 1;
            }
        }

        if changed > 0 {
            tracing::debug!(changed = changed, "Reconciled remote flags");
        }
        Ok(changed)
    }
}
