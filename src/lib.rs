//! Offline-first feed reader core.
//!
//! Keeps a local cache of subscribed feeds and entries, lets read/bookmarked
//! flags be mutated while offline, and reconciles that state with a remote
//! source opportunistically. The presentation layer consumes
//! [`view::EntriesView`]; everything else hangs off it.

pub mod config;
pub mod flags;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod view;

pub use flags::FlagMutator;
pub use remote::{FeedSource, HttpFeedSource, RemoteError};
pub use storage::{Conf, Database, DatabaseError, EntriesFilter, Entry, Feed, SortOrder};
pub use sync::{SyncArgs, SyncCoordinator, SyncError, SyncState};
pub use view::{EntriesView, EntryRow, ViewState};
