use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use tidings::config::Config;
use tidings::storage::{Database, DatabaseError, EntriesFilter};
use tidings::sync::{SyncArgs, SyncCoordinator};
use tidings::{FlagMutator, HttpFeedSource};

/// Get the config directory path (~/.config/tidings/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("tidings"))
}

#[derive(Parser, Debug)]
#[command(name = "tidings", about = "Offline-first feed reader sync engine")]
struct Cli {
    /// Reset database (delete and recreate)
    #[arg(long)]
    reset_db: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed by URL
    Subscribe { url: String },
    /// Unsubscribe from a feed
    Unsubscribe { feed_id: String },
    /// Run a sync session (no flags = full sync)
    Sync {
        #[arg(long)]
        feeds: bool,
        #[arg(long)]
        entries: bool,
        #[arg(long)]
        flags: bool,
    },
    /// List subscribed feeds
    Feeds,
    /// List cached entries
    Entries {
        /// Restrict to one feed
        #[arg(long)]
        feed: Option<String>,
        /// Show the bookmarked view
        #[arg(long)]
        bookmarked: bool,
    },
    /// Mark entries as read (or unread with --unread)
    MarkRead {
        ids: Vec<String>,
        #[arg(long)]
        unread: bool,
    },
    /// Bookmark an entry (or remove the bookmark with --remove)
    Bookmark {
        id: String,
        #[arg(long)]
        remove: bool,
    },
    /// Mark every entry in a scope as read
    MarkAllRead {
        #[arg(long)]
        feed: Option<String>,
        #[arg(long)]
        bookmarked: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Set up config directory
    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        println!("Created config directory: {}", config_dir.display());
    }

    // User-only access on Unix: the directory holds a token and a database
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(&config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }

    let config = Config::load(&config_dir.join("config.toml")).context("Failed to load config")?;
    let db_path = config_dir.join("tidings.db");

    // Handle --reset-db flag
    if cli.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete database")?;
        println!("Database reset.");
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(e @ DatabaseError::InstanceLocked) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    let server_url = config
        .server_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!(
            "No server_url configured. Add it to {}/config.toml",
            config_dir.display()
        ))?;
    let base = Url::parse(server_url).context("Invalid server_url in config")?;
    let source = Arc::new(HttpFeedSource::new(base, config.token.clone())?);
    let coordinator = SyncCoordinator::new(db.clone(), source);

    match cli.command {
        Command::Subscribe { url } => {
            let feed = coordinator
                .subscribe(&url)
                .await
                .map_err(|e| anyhow::anyhow!("Subscribe failed: {}", e))?;
            println!("Subscribed: {} ({})", feed.title, feed.id);
        }
        Command::Unsubscribe { feed_id } => {
            coordinator
                .unsubscribe(&feed_id)
                .await
                .map_err(|e| anyhow::anyhow!("Unsubscribe failed: {}", e))?;
            println!("Unsubscribed {}", feed_id);
        }
        Command::Sync {
            feeds,
            entries,
            flags,
        } => {
            let args = if !feeds && !entries && !flags {
                SyncArgs::default()
            } else {
                SyncArgs {
                    sync_feeds: feeds,
                    sync_entries: entries,
                    sync_flags: flags,
                }
            };
            coordinator
                .run(args)
                .await
                .map_err(|e| anyhow::anyhow!("Sync failed: {}", e))?;
            println!("Sync completed.");
        }
        Command::Feeds => {
            for feed in db.select_feeds().await? {
                println!("{}  {}  {}", feed.id, feed.title, feed.url);
            }
        }
        Command::Entries { feed, bookmarked } => {
            let conf = db.conf();
            let all: &[bool] = &[false, true];
            let unread: &[bool] = &[false];
            let entries = match feed {
                Some(feed_id) => {
                    let read = if conf.show_read_entries { all } else { unread };
                    db.select_by_feed_id_read_bookmarked(&feed_id, read, false, conf.sort_order)
                        .await?
                }
                None => {
                    let read = if conf.show_read_entries || bookmarked {
                        all
                    } else {
                        unread
                    };
                    db.select_by_read_bookmarked(read, bookmarked, conf.sort_order)
                        .await?
                }
            };
            for entry in entries {
                let marker = match (entry.read, entry.bookmarked) {
                    (false, true) => "*",
                    (false, false) => " ",
                    (true, true) => "r*",
                    (true, false) => "r",
                };
                println!("{:2} {}  {}  {}", marker, entry.id, entry.published, entry.title);
            }
        }
        Command::MarkRead { ids, unread } => {
            let mutator = FlagMutator::new(db.clone(), coordinator.spawn_request_worker());
            mutator.set_read(&ids, !unread).await?;
            flags_sync_now(&coordinator).await;
        }
        Command::Bookmark { id, remove } => {
            let mutator = FlagMutator::new(db.clone(), coordinator.spawn_request_worker());
            mutator.set_bookmarked(&id, !remove).await?;
            flags_sync_now(&coordinator).await;
        }
        Command::MarkAllRead { feed, bookmarked } => {
            let filter = match (feed, bookmarked) {
                (Some(feed_id), _) => EntriesFilter::BelongToFeed { feed_id },
                (None, true) => EntriesFilter::Bookmarked,
                (None, false) => EntriesFilter::NotBookmarked,
            };
            let mutator = FlagMutator::new(db.clone(), coordinator.spawn_request_worker());
            mutator.mark_all_read(&filter).await?;
            flags_sync_now(&coordinator).await;
        }
    }

    Ok(())
}

/// The mutators queue a background flags sync, but a CLI process exits
/// before the worker gets to it: run one synchronously, best-effort.
async fn flags_sync_now(coordinator: &SyncCoordinator) {
    if let Err(e) = coordinator.run(SyncArgs::flags_only()).await {
        eprintln!("Warning: flags not pushed ({}); they stay pending locally.", e);
    }
}
