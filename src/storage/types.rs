use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance of tidings appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Sort Order
// ============================================================================

/// Entry list sort direction, persisted in the conf row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Ascending => "ascending",
            SortOrder::Descending => "descending",
        }
    }

    /// Parse a persisted sort order value.
    ///
    /// An unknown value means the conf row was written by defective code
    /// (we are the only writer), so this is a fatal invariant violation
    /// rather than a recoverable runtime condition.
    pub(crate) fn from_db(value: &str) -> Self {
        match value {
            "ascending" => SortOrder::Ascending,
            "descending" => SortOrder::Descending,
            other => panic!("invalid sort order in conf row: {:?}", other),
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            SortOrder::Ascending => SortOrder::Descending,
            SortOrder::Descending => SortOrder::Ascending,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Singleton configuration record.
///
/// Mutated only through `Database::update_conf` (copy-on-write transform),
/// which persists the new value and broadcasts it to watch subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conf {
    pub sort_order: SortOrder,
    pub show_read_entries: bool,
    pub show_preview_images: bool,
    pub crop_preview_images: bool,
    pub use_built_in_browser: bool,
    pub sync_on_startup: bool,
    /// Per-session guard: reset to false on every database open so the
    /// startup sync runs at most once per session.
    pub synced_on_startup: bool,
    pub initial_sync_completed: bool,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            sort_order: SortOrder::Descending,
            show_read_entries: false,
            show_preview_images: true,
            crop_preview_images: true,
            use_built_in_browser: false,
            sync_on_startup: true,
            synced_on_startup: false,
            initial_sync_completed: false,
        }
    }
}

// ============================================================================
// View Filter
// ============================================================================

/// Closed set of view selectors driving which entry query is issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntriesFilter {
    /// Default feed view: excludes entries shown only in the bookmarked view.
    NotBookmarked,
    /// Bookmarked-only view.
    Bookmarked,
    /// Entries of a single feed.
    BelongToFeed { feed_id: String },
}

// ============================================================================
// Helper Types
// ============================================================================

/// Feed metadata as returned by the remote source, ready for upsert
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub id: String,
    pub url: String,
    pub title: String,
}

/// Entry fields as returned by the remote source, ready for upsert.
///
/// Flags are deliberately absent: the store owns `read`/`bookmarked` state
/// and an upsert never touches it.
#[derive(Debug, Clone)]
pub struct FetchedEntry {
    pub id: String,
    pub title: String,
    pub summary: Option<String>,
    pub published: i64,
    pub links: Vec<Link>,
    pub og_image_url: Option<String>,
    pub og_image_width: Option<i64>,
    pub og_image_height: Option<i64>,
}

/// A link attached to an entry, stored as a JSON array column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel: Option<String>,
}

/// Flag columns of one entry, used for push bookkeeping and reconciliation
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntryFlags {
    pub id: String,
    pub read: bool,
    pub read_synced: bool,
    pub bookmarked: bool,
    pub bookmarked_synced: bool,
}

/// Internal row type for Entry queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryDbRow {
    pub id: String,
    pub feed_id: String,
    pub title: String,
    pub summary: Option<String>,
    pub published: i64,
    pub links: String,
    pub og_image_url: Option<String>,
    pub og_image_width: Option<i64>,
    pub og_image_height: Option<i64>,
    pub read: bool,
    pub read_synced: bool,
    pub bookmarked: bool,
    pub bookmarked_synced: bool,
    pub fetched_at: i64,
}

impl EntryDbRow {
    pub(crate) fn into_entry(self) -> Entry {
        let links = serde_json::from_str(&self.links).unwrap_or_else(|e| {
            // We are the only writer of this column, so a parse failure is a
            // defect; log it and degrade to an empty link list.
            tracing::warn!(entry_id = %self.id, error = %e, "Malformed links column");
            Vec::new()
        });
        Entry {
            id: self.id,
            feed_id: self.feed_id,
            title: self.title,
            summary: self.summary,
            published: self.published,
            links,
            og_image_url: self.og_image_url,
            og_image_width: self.og_image_width,
            og_image_height: self.og_image_height,
            read: self.read,
            read_synced: self.read_synced,
            bookmarked: self.bookmarked,
            bookmarked_synced: self.bookmarked_synced,
            fetched_at: self.fetched_at,
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed data from database
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Feed {
    pub id: String,
    pub url: String,
    pub title: String,
    pub subscribed_at: i64,
    /// Per-feed override for `Conf::show_preview_images` (None = no override)
    pub show_preview_images: Option<bool>,
    /// Per-feed override for opening entries in the built-in browser
    pub open_entries_in_browser: Option<bool>,
}

/// Entry data from database
///
/// Invariant: a flag's `*_synced` bit is false exactly while the local value
/// was set by a local mutation not yet confirmed remotely. It flips back to
/// true only after a successful sync round that pushed this entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: String,
    pub feed_id: String,
    pub title: String,
    pub summary: Option<String>,
    pub published: i64,
    pub links: Vec<Link>,
    pub og_image_url: Option<String>,
    pub og_image_width: Option<i64>,
    pub og_image_height: Option<i64>,
    pub read: bool,
    pub read_synced: bool,
    pub bookmarked: bool,
    pub bookmarked_synced: bool,
    pub fetched_at: i64,
}
