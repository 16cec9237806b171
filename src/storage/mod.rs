mod conf;
mod entries;
mod feeds;
mod schema;
mod types;

pub use schema::Database;
pub use types::{
    Conf, DatabaseError, EntriesFilter, Entry, EntryFlags, Feed, FetchedEntry, FetchedFeed, Link,
    SortOrder,
};
