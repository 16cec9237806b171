//! View projector: turns the store, the conf and the coordinator state into
//! a display-ready entry list.
//!
//! Recomputation is a combined-latest subscription over immutable snapshots
//! of every input, with latest-wins semantics: when an input changes while a
//! recomputation is still running, the in-flight task is aborted and a new
//! one starts from the fresh snapshot. A stale partial result is never
//! delivered.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::flags::FlagMutator;
use crate::storage::{Conf, Database, EntriesFilter, Entry, Feed};
use crate::sync::{SyncArgs, SyncCoordinator, SyncState};

// ============================================================================
// View State
// ============================================================================

/// One entry resolved for display. Overrides are applied at projection time,
/// never stored denormalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRow {
    pub entry: Entry,
    pub show_image: bool,
    pub crop_image: bool,
    pub open_in_browser: bool,
}

/// What the presentation layer renders. Exhaustive by construction; the
/// compiler keeps every consumer honest about all four situations.
#[derive(Debug, Clone)]
pub enum ViewState {
    /// First projection has not completed yet
    LoadingCachedEntries,
    /// First-ever sync with nothing cached to show
    InitialSync { message: String },
    ShowingCachedEntries {
        /// Present only for the single-feed view
        feed: Option<Feed>,
        entries: Vec<EntryRow>,
        /// Entries are being refreshed behind the cached list
        show_background_progress: bool,
        /// Set for exactly one projection after a sort order change
        scroll_to_top: bool,
        conf: Conf,
    },
    FailedToSync { cause: String },
}

#[derive(Clone)]
struct Snapshot {
    filter: EntriesFilter,
    conf: Conf,
    sync: SyncState,
}

// ============================================================================
// Entries View
// ============================================================================

/// The reactive facade exposed to the presentation layer.
///
/// Owns the active filter, drives recomputation, and forwards user actions
/// to the flag mutator and the sync coordinator.
pub struct EntriesView {
    db: Database,
    mutator: FlagMutator,
    sync_requests: mpsc::Sender<SyncArgs>,
    filter_tx: watch::Sender<EntriesFilter>,
    state_tx: Arc<watch::Sender<ViewState>>,
    scroll_to_top: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

impl EntriesView {
    /// Activate the view with an initial filter.
    ///
    /// Spawns the coordinator's request worker and the recomputation driver.
    /// On activation, if the initial sync has never completed or
    /// `sync_on_startup` has not run this session, a full sync is requested
    /// exactly once; `synced_on_startup` is flipped before the request so
    /// repeated recomputation can never trigger it twice.
    pub fn new(db: Database, coordinator: Arc<SyncCoordinator>, filter: EntriesFilter) -> Self {
        let sync_requests = coordinator.spawn_request_worker();
        let mutator = FlagMutator::new(db.clone(), sync_requests.clone());

        let (filter_tx, filter_rx) = watch::channel(filter);
        let state_tx = Arc::new(watch::channel(ViewState::LoadingCachedEntries).0);
        let scroll_to_top = Arc::new(AtomicBool::new(false));

        let driver = tokio::spawn(drive(
            db.clone(),
            coordinator.state(),
            filter_rx,
            Arc::clone(&state_tx),
            Arc::clone(&scroll_to_top),
            sync_requests.clone(),
        ));

        Self {
            db,
            mutator,
            sync_requests,
            filter_tx,
            state_tx,
            scroll_to_top,
            driver,
        }
    }

    /// Subscribe to projected view states
    pub fn state(&self) -> watch::Receiver<ViewState> {
        self.state_tx.subscribe()
    }

    /// Currently active filter
    pub fn filter(&self) -> EntriesFilter {
        self.filter_tx.borrow().clone()
    }

    /// Switch the active filter; triggers a recomputation
    pub fn set_filter(&self, filter: EntriesFilter) {
        self.filter_tx.send_replace(filter);
    }

    /// Request a full sync after a failure. Best-effort; the outcome arrives
    /// through the view state.
    pub fn retry(&self) {
        self.request_full_sync();
    }

    /// Request a full sync from a pull-to-refresh gesture
    pub fn pull_refresh(&self) {
        self.request_full_sync();
    }

    fn request_full_sync(&self) {
        if let Err(e) = self.sync_requests.try_send(SyncArgs::default()) {
            tracing::debug!(error = %e, "Sync request dropped; a session is already queued");
        }
    }

    /// Apply a copy-on-write transform to the configuration
    pub async fn save_conf<F>(&self, transform: F) -> Result<Conf>
    where
        F: FnOnce(Conf) -> Conf,
    {
        self.db.update_conf(transform).await
    }

    /// Flip the sort order. The next projection (and only that one) carries
    /// `scroll_to_top`.
    pub async fn change_sort_order(&self) -> Result<Conf> {
        self.scroll_to_top.store(true, Ordering::SeqCst);
        self.db
            .update_conf(|c| Conf {
                sort_order: c.sort_order.flipped(),
                ..c
            })
            .await
    }

    /// Set the read flag for a set of entries
    pub async fn set_read(&self, ids: &[String], read: bool) -> Result<()> {
        self.mutator.set_read(ids, read).await
    }

    /// Set the bookmarked flag for one entry
    pub async fn set_bookmarked(&self, id: &str, bookmarked: bool) -> Result<()> {
        self.mutator.set_bookmarked(id, bookmarked).await
    }

    /// Mark everything in the active filter's scope as read
    pub async fn mark_all_as_read(&self) -> Result<()> {
        let filter = self.filter();
        self.mutator.mark_all_read(&filter).await
    }
}

impl Drop for EntriesView {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

// ============================================================================
// Recomputation Driver
// ============================================================================

async fn drive(
    db: Database,
    mut sync_rx: watch::Receiver<SyncState>,
    mut filter_rx: watch::Receiver<EntriesFilter>,
    state_tx: Arc<watch::Sender<ViewState>>,
    scroll_to_top: Arc<AtomicBool>,
    sync_requests: mpsc::Sender<SyncArgs>,
) {
    trigger_startup_sync(&db, &sync_requests).await;

    let mut conf_rx = db.conf_watch();
    let mut revision_rx = db.revisions();
    let mut recompute: Option<JoinHandle<()>> = None;

    loop {
        // Supersede any in-flight recomputation with the latest snapshot
        if let Some(handle) = recompute.take() {
            handle.abort();
        }
        revision_rx.mark_unchanged();
        let snapshot = Snapshot {
            filter: filter_rx.borrow_and_update().clone(),
            conf: conf_rx.borrow_and_update().clone(),
            sync: sync_rx.borrow_and_update().clone(),
        };
        recompute = Some(tokio::spawn(recompute_view(
            db.clone(),
            snapshot,
            Arc::clone(&state_tx),
            Arc::clone(&scroll_to_top),
        )));

        // Wait for the next change on any input
        let closed = tokio::select! {
            r = conf_rx.changed() => r.is_err(),
            r = sync_rx.changed() => r.is_err(),
            r = revision_rx.changed() => r.is_err(),
            r = filter_rx.changed() => r.is_err(),
        };
        if closed {
            break;
        }
    }

    if let Some(handle) = recompute.take() {
        handle.abort();
    }
}

/// Once-per-session startup sync, guarded by `synced_on_startup`.
/// The guard is flipped before the request is submitted.
async fn trigger_startup_sync(db: &Database, sync_requests: &mpsc::Sender<SyncArgs>) {
    let conf = db.conf();
    let wants_sync = !conf.initial_sync_completed || (conf.sync_on_startup && !conf.synced_on_startup);
    if !wants_sync {
        return;
    }

    match db
        .update_conf(|c| Conf {
            synced_on_startup: true,
            ..c
        })
        .await
    {
        Ok(_) => {
            if let Err(e) = sync_requests.try_send(SyncArgs::default()) {
                tracing::warn!(error = %e, "Startup sync request dropped");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to record startup sync guard"),
    }
}

async fn recompute_view(
    db: Database,
    snapshot: Snapshot,
    state_tx: Arc<watch::Sender<ViewState>>,
    scroll_to_top: Arc<AtomicBool>,
) {
    let mut state = match project(&db, &snapshot).await {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(error = %e, "View projection failed");
            ViewState::FailedToSync {
                cause: e.to_string(),
            }
        }
    };

    // Consume the scroll flag only when a list is actually delivered.
    // No await below this point, so an abort cannot lose the flag.
    if let ViewState::ShowingCachedEntries {
        scroll_to_top: flag,
        ..
    } = &mut state
    {
        *flag = scroll_to_top.swap(false, Ordering::SeqCst);
    }
    state_tx.send_replace(state);
}

async fn project(db: &Database, snapshot: &Snapshot) -> Result<ViewState> {
    match &snapshot.sync {
        SyncState::InitialSync { message } => {
            return Ok(ViewState::InitialSync {
                message: message.clone(),
            });
        }
        SyncState::Failed { cause } => {
            return Ok(ViewState::FailedToSync {
                cause: cause.to_string(),
            });
        }
        SyncState::Idle | SyncState::FollowUpSync { .. } => {}
    }

    let conf = &snapshot.conf;
    let show_background_progress =
        matches!(&snapshot.sync, SyncState::FollowUpSync { args, .. } if args.sync_entries);

    const ALL: &[bool] = &[false, true];
    const UNREAD: &[bool] = &[false];

    let (feed, entries) = match &snapshot.filter {
        EntriesFilter::BelongToFeed { feed_id } => {
            // The single-feed view is never the bookmarked view
            let feed = db.select_feed(feed_id).await?;
            let read = if conf.show_read_entries { ALL } else { UNREAD };
            let entries = db
                .select_by_feed_id_read_bookmarked(feed_id, read, false, conf.sort_order)
                .await?;
            (feed, entries)
        }
        filter => {
            let bookmarked = *filter == EntriesFilter::Bookmarked;
            let read = if conf.show_read_entries || bookmarked {
                ALL
            } else {
                UNREAD
            };
            let entries = db
                .select_by_read_bookmarked(read, bookmarked, conf.sort_order)
                .await?;
            (None, entries)
        }
    };

    // Feed overrides are resolved per row at projection time
    let feeds = db.select_feeds().await?;
    let by_id: HashMap<&str, &Feed> = feeds.iter().map(|f| (f.id.as_str(), f)).collect();
    let rows = entries
        .into_iter()
        .map(|entry| {
            let feed = by_id.get(entry.feed_id.as_str()).copied();
            project_row(entry, feed, conf)
        })
        .collect();

    Ok(ViewState::ShowingCachedEntries {
        feed,
        entries: rows,
        show_background_progress,
        scroll_to_top: false,
        conf: conf.clone(),
    })
}

fn project_row(entry: Entry, feed: Option<&Feed>, conf: &Conf) -> EntryRow {
    let show_image = feed
        .and_then(|f| f.show_preview_images)
        .unwrap_or(conf.show_preview_images);
    let open_in_browser = feed
        .and_then(|f| f.open_entries_in_browser)
        .unwrap_or(false);
    EntryRow {
        entry,
        show_image,
        crop_image: conf.crop_preview_images,
        open_in_browser,
    }
}
