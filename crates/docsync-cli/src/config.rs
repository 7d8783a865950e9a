use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use docsync_engine::SyncConfig;

/// Configuration of the docsync command-line client.
#[derive(Parser, Debug, Clone)]
#[command(name = "docsync")]
#[command(about = "Buffered key/value documents synchronized with a shared remote store")]
pub struct Config {
    /// Base URL of the remote document store
    #[arg(
        long,
        global = true,
        default_value = "http://127.0.0.1:8080",
        env = "DOCSYNC_REMOTE_URL"
    )]
    pub remote_url: String,

    /// Bearer token sent to the remote store
    #[arg(long, global = true, env = "DOCSYNC_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Directory holding local buffers and lock files
    #[arg(long, global = true, env = "DOCSYNC_BUFFER_DIR")]
    pub buffer_dir: Option<PathBuf>,

    /// Replica rank, to run several buffers of one document on this host
    #[arg(long, global = true, default_value = "0", env = "DOCSYNC_RANK")]
    pub rank: u32,

    /// Timeout of a single remote store request, in milliseconds
    #[arg(long, global = true, default_value = "5000", env = "DOCSYNC_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// Bounded wait for the pull before a read, in milliseconds
    #[arg(long, global = true, default_value = "1000", env = "DOCSYNC_READ_TIMEOUT_MS")]
    pub read_timeout_ms: u64,

    /// Overall bound of closing a document, in milliseconds
    #[arg(long, global = true, default_value = "5000", env = "DOCSYNC_CLOSE_TIMEOUT_MS")]
    pub close_timeout_ms: u64,

    /// How long to wait for another process holding the document, in milliseconds
    #[arg(long, global = true, default_value = "10000", env = "DOCSYNC_LOCK_TIMEOUT_MS")]
    pub lock_timeout_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// Get the effective buffer directory.
    pub fn effective_buffer_dir(&self) -> PathBuf {
        self.buffer_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("docsync")
                .join("buffers")
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn sync_config(&self) -> SyncConfig {
        let close_timeout = Duration::from_millis(self.close_timeout_ms);
        let defaults = SyncConfig::default();
        let settle_timeout = defaults.settle_timeout.min(close_timeout);
        defaults
            .with_read_timeout(Duration::from_millis(self.read_timeout_ms))
            .with_settle_timeout(settle_timeout)
            .with_join_timeout(close_timeout)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the document id derived from a JSON object of parameters
    Id { params: String },
    /// Print the value stored under a key
    Get { doc: String, key: String },
    /// Store a JSON value under a key
    Set {
        doc: String,
        key: String,
        value: String,
    },
    /// Delete a key
    Del { doc: String, key: String },
    /// List the keys of a document
    Keys { doc: String },
    /// Clear the local buffer of a document; the remote copy is kept
    Clear { doc: String },
    /// Delete a document remotely and locally
    Remove { doc: String },
    /// Manage the milestones of a document
    #[command(subcommand)]
    Milestone(MilestoneCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum MilestoneCommand {
    /// Record a milestone as reached
    Mark { doc: String, name: String },
    /// Forget a milestone
    Remove { doc: String, name: String },
    /// Check whether a milestone was reached
    Reached { doc: String, name: String },
    /// List reached milestones
    List { doc: String },
    /// Forget every milestone
    Clear { doc: String },
}
