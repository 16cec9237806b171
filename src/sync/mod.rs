//! Sync coordinator: decides when and what to synchronize, serializes
//! concurrent sync requests, and drives remote fetch plus local
//! reconciliation.

mod reconcile;

pub use reconcile::Reconciler;

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

use crate::remote::{EntryDescriptor, FeedSource, FlagPush, RemoteError};
use crate::storage::{Conf, Database, Feed, FetchedFeed};

/// Max entry fetches in flight during the entries phase
const MAX_CONCURRENT_FETCHES: usize = 10;

/// Capacity of the background sync request channel
const REQUEST_QUEUE_CAPACITY: usize = 16;

// ============================================================================
// Session Descriptor
// ============================================================================

/// What a sync session should cover. Each phase toggles independently;
/// the default is a full sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncArgs {
    pub sync_feeds: bool,
    pub sync_entries: bool,
    pub sync_flags: bool,
}

impl Default for SyncArgs {
    fn default() -> Self {
        Self {
            sync_feeds: true,
            sync_entries: true,
            sync_flags: true,
        }
    }
}

impl SyncArgs {
    /// Push/pull flags only (requested after local flag mutations)
    pub fn flags_only() -> Self {
        Self {
            sync_feeds: false,
            sync_entries: false,
            sync_flags: true,
        }
    }

    /// Union of two requested scopes
    pub fn merge(self, other: Self) -> Self {
        Self {
            sync_feeds: self.sync_feeds || other.sync_feeds,
            sync_entries: self.sync_entries || other.sync_entries,
            sync_flags: self.sync_flags || other.sync_flags,
        }
    }

    /// True if every phase requested by `other` is also requested by `self`
    pub fn covers(self, other: Self) -> bool {
        (self.sync_feeds || !other.sync_feeds)
            && (self.sync_entries || !other.sync_entries)
            && (self.sync_flags || !other.sync_flags)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// A sync session failure. Completed phases keep their writes; the cause is
/// also published through the coordinator state.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    Remote(#[from] RemoteError),
    #[error("Storage failure during sync: {0}")]
    Storage(#[from] anyhow::Error),
}

// ============================================================================
// Coordinator State
// ============================================================================

/// Observable coordinator state. Cycles back to `Idle` after each successful
/// session; `Failed` carries the previous session's cause until the next run.
#[derive(Debug, Clone)]
pub enum SyncState {
    Idle,
    /// First-ever sync; the presentation layer has nothing cached to show
    InitialSync { message: String },
    /// Sync with cached data already on screen
    FollowUpSync { args: SyncArgs, message: String },
    /// Last session failed
    Failed { cause: Arc<SyncError> },
}

#[derive(Default)]
struct SessionQueue {
    active: Option<SyncArgs>,
    pending: Option<SyncArgs>,
}

// ============================================================================
// Sync Coordinator
// ============================================================================

/// Owns the sync lifecycle.
///
/// At most one session is ever active: an overlapping `run` whose scope is
/// covered by the in-flight session is coalesced into it, anything beyond
/// that scope is queued and drained immediately after. Two network fetch
/// phases never overlap.
pub struct SyncCoordinator {
    db: Database,
    source: Arc<dyn FeedSource>,
    state_tx: watch::Sender<SyncState>,
    queue: Mutex<SessionQueue>,
}

impl SyncCoordinator {
    pub fn new(db: Database, source: Arc<dyn FeedSource>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SyncState::Idle);
        Arc::new(Self {
            db,
            source,
            state_tx,
            queue: Mutex::new(SessionQueue::default()),
        })
    }

    /// Subscribe to coordinator state changes
    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    /// Spawn the background request worker and return its submission handle.
    ///
    /// Submissions are best-effort and non-blocking: a full queue drops the
    /// request (covered by the next sync trigger) and a worker failure is
    /// logged, never surfaced to the submitter.
    pub fn spawn_request_worker(self: &Arc<Self>) -> mpsc::Sender<SyncArgs> {
        let (tx, mut rx) = mpsc::channel::<SyncArgs>(REQUEST_QUEUE_CAPACITY);
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(args) = rx.recv().await {
                if let Err(e) = coordinator.run(args).await {
                    tracing::warn!(error = %e, "Background sync failed");
                }
            }
        });
        tx
    }

    /// Run a sync session covering `args`.
    ///
    /// Re-entrant and idempotent: a call while a session is in flight never
    /// starts an overlapping fetch phase. If the active session already
    /// covers the requested scope the call coalesces into it and returns
    /// immediately; otherwise the missing scope is queued and runs right
    /// after. Running the same args twice with no intervening remote change
    /// produces no observable store delta the second time.
    pub async fn run(&self, args: SyncArgs) -> Result<(), Arc<SyncError>> {
        {
            let mut queue = self.queue.lock().await;
            if let Some(active) = queue.active {
                if !active.covers(args) {
                    queue.pending = Some(match queue.pending {
                        Some(p) => p.merge(args),
                        None => args,
                    });
                }
                // The in-flight session (plus any queued follow-up) covers
                // this scope.
                return Ok(());
            }
            queue.active = Some(args);
        }

        let first = self.run_session(args).await;

        // Drain scope queued while we were running
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                queue.active = queue.pending.take();
                queue.active
            };
            let Some(args) = next else { break };
            if let Err(e) = self.run_session(args).await {
                tracing::warn!(error = %e, "Queued follow-up sync failed");
            }
        }

        first
    }

    async fn run_session(&self, args: SyncArgs) -> Result<(), Arc<SyncError>> {
        let initial = !self.db.conf().initial_sync_completed;
        tracing::info!(?args, initial = initial, "Starting sync session");

        let result = self.run_phases(args, initial).await;
        match result {
            Ok(()) => {
                if initial {
                    self.db
                        .update_conf(|c| Conf {
                            initial_sync_completed: true,
                            ..c
                        })
                        .await
                        .map_err(|e| Arc::new(SyncError::Storage(e)))?;
                }
                self.state_tx.send_replace(SyncState::Idle);
                tracing::info!("Sync session completed");
                Ok(())
            }
            Err(e) => {
                // Completed phases keep their writes; sync is resumable,
                // not transactional across phases.
                let cause = Arc::new(e);
                tracing::warn!(error = %cause, "Sync session failed");
                self.state_tx.send_replace(SyncState::Failed {
                    cause: Arc::clone(&cause),
                });
                Err(cause)
            }
        }
    }

    fn set_phase(&self, args: SyncArgs, initial: bool, message: &str) {
        let state = if initial {
            SyncState::InitialSync {
                message: message.to_string(),
            }
        } else {
            SyncState::FollowUpSync {
                args,
                message: message.to_string(),
            }
        };
        self.state_tx.send_replace(state);
    }

    async fn run_phases(&self, args: SyncArgs, initial: bool) -> Result<(), SyncError> {
        let reconciler = Reconciler::new(self.db.clone());

        if args.sync_feeds {
            self.set_phase(args, initial, "Syncing feed list");
            let feeds = self.source.fetch_feeds().await?;
            reconciler.apply_remote_feeds(&feeds).await?;
        }

        if args.sync_entries {
            self.set_phase(args, initial, "Syncing entries");
            let feeds = self.db.select_feeds().await.map_err(SyncError::Storage)?;
            self.sync_entries(&reconciler, feeds).await?;
        }

        if args.sync_flags {
            self.set_phase(args, initial, "Syncing read and bookmark flags");
            self.sync_flags(&reconciler).await?;
        }

        Ok(())
    }

    /// Entries phase: bounded fan-out over feeds, incremental per feed.
    ///
    /// Successful feeds are applied even when others fail; the first failure
    /// is reported after all fetches settle.
    async fn sync_entries(&self, reconciler: &Reconciler, feeds: Vec<Feed>) -> Result<(), SyncError> {
        type FeedFetch = (String, Result<Vec<EntryDescriptor>, SyncError>);

        let results: Vec<FeedFetch> = stream::iter(feeds)
            .map(|feed| {
                let db = self.db.clone();
                let source = Arc::clone(&self.source);
                async move {
                    let result = async {
                        let since = db
                            .select_max_published(&feed.id)
                            .await
                            .map_err(SyncError::Storage)?;
                        Ok(source.fetch_entries(&feed.id, since).await?)
                    }
                    .await;
                    (feed.id, result)
                }
            })
            .buffer_unordered(MAX_CONCURRENT_FETCHES)
            .collect()
            .await;

        let mut first_failure = None;
        for (feed_id, result) in results {
            match result {
                Ok(entries) => {
                    reconciler.apply_remote_entries(&feed_id, &entries).await?;
                }
                Err(e) => {
                    tracing::warn!(feed_id = %feed_id, error = %e, "Entry fetch failed");
                    first_failure.get_or_insert(e);
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flags phase: push pending local mutations, confirm them, then pull
    /// and reconcile remote flag state.
    async fn sync_flags(&self, reconciler: &Reconciler) -> Result<(), SyncError> {
        let pending = self
            .db
            .select_pending_flags()
            .await
            .map_err(SyncError::Storage)?;

        if !pending.is_empty() {
            let pushes: Vec<FlagPush> = pending
                .iter()
                .map(|f| FlagPush {
                    entry_id: f.id.clone(),
                    read: (!f.read_synced).then_some(f.read),
                    bookmarked: (!f.bookmarked_synced).then_some(f.bookmarked),
                })
                .collect();

            self.source.push_flags(&pushes).await?;
            self.db
                .confirm_pushed_flags(&pending)
                .await
                .map_err(SyncError::Storage)?;
            tracing::debug!(pushed = pushes.len(), "Pushed pending flags");
        }

        let remote = self.source.pull_flags().await?;
        reconciler.reconcile_flags(&remote).await?;
        Ok(())
    }

    // ========================================================================
    // Feed Lifecycle
    // ========================================================================

    /// Subscribe to a feed by URL.
    ///
    /// The remote handshake happens first: on failure no local feed row is
    /// created. On success the feed's entries are fetched right away.
    pub async fn subscribe(&self, url: &str) -> Result<Feed, SyncError> {
        let descriptor = self.source.fetch_feed(url).await?;
        self.db
            .insert_feed(&FetchedFeed {
                id: descriptor.id.clone(),
                url: descriptor.url.clone(),
                title: descriptor.title.clone(),
            })
            .await
            .map_err(SyncError::Storage)?;

        let entries = self.source.fetch_entries(&descriptor.id, None).await?;
        Reconciler::new(self.db.clone())
            .apply_remote_entries(&descriptor.id, &entries)
            .await?;

        let feed = self
            .db
            .select_feed(&descriptor.id)
            .await
            .map_err(SyncError::Storage)?
            .ok_or_else(|| SyncError::Storage(anyhow::anyhow!("subscribed feed vanished")))?;

        tracing::info!(feed_id = %feed.id, url = %url, "Subscribed");
        Ok(feed)
    }

    /// Unsubscribe from a feed, remotely first, then locally (cascades to
    /// its entries).
    pub async fn unsubscribe(&self, feed_id: &str) -> Result<(), SyncError> {
        self.source.delete_feed(feed_id).await?;
        let removed = self
            .db
            .delete_feed(feed_id)
            .await
            .map_err(SyncError::Storage)?;
        tracing::info!(feed_id = %feed_id, entries_removed = removed, "Unsubscribed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{SyncArgs, SyncError};

    #[test]
    fn test_default_is_full_sync() {
        let args = SyncArgs::default();
        assert!(args.sync_feeds && args.sync_entries && args.sync_flags);
    }

    #[test]
    fn test_merge_is_union() {
        let merged = SyncArgs::flags_only().merge(SyncArgs {
            sync_feeds: true,
            sync_entries: false,
            sync_flags: false,
        });
        assert!(merged.sync_feeds);
        assert!(!merged.sync_entries);
        assert!(merged.sync_flags);
    }

    #[test]
    fn test_storage_error_keeps_source_chain() {
        let cause = anyhow::anyhow!("disk full").context("persisting entries");
        let err = SyncError::Storage(cause);

        let source = std::error::Error::source(&err).expect("source chain preserved");
        assert!(source.to_string().contains("persisting entries"));
    }

    #[test]
    fn test_covers() {
        assert!(SyncArgs::default().covers(SyncArgs::flags_only()));
        assert!(!SyncArgs::flags_only().covers(SyncArgs::default()));
        assert!(SyncArgs::flags_only().covers(SyncArgs::flags_only()));
    }
}
