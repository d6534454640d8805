//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use offline_content::Priority;

/// Download books and audiobooks for offline use.
///
/// Requests are persisted: an interrupted `download` continues where it
/// stopped the next time any command opens the same data directory.
#[derive(Parser, Debug)]
#[command(name = "offline")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Storage root for the database and downloaded files
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Config file (default: $XDG_CONFIG_HOME/offline-content/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Only transfer over Wi-Fi
    #[arg(long, global = true)]
    pub wifi_only: bool,

    /// Maximum concurrent transfers (1-16)
    #[arg(short = 'c', long, global = true, value_parser = clap::value_parser!(u8).range(1..=16))]
    pub concurrency: Option<u8>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download every unit listed in a manifest
    Download {
        /// JSON manifest describing resources and their sources
        #[arg(short, long)]
        manifest: PathBuf,

        /// Only download this resource from the manifest
        #[arg(long)]
        resource: Option<String>,

        /// Scheduling priority
        #[arg(short, long, value_enum, default_value_t = PriorityArg::Normal)]
        priority: PriorityArg,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Show download state
    Status {
        /// Resource to show; all resources when omitted
        resource: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Pause a resource's unfinished units
    Pause { resource: String },

    /// Re-queue a resource's paused units
    Resume { resource: String },

    /// Cancel a resource's unfinished units, keeping completed ones
    Cancel { resource: String },

    /// Re-queue a resource's failed units
    Retry { resource: String },

    /// Delete a resource and all of its files
    Delete { resource: String },

    /// Show bytes stored per tier and free device space
    Summary {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Delete resources past their retention period and trim the cache
    Evict,

    /// Re-check the content index against the filesystem
    Reconcile,
}

/// Priority names accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
        }
    }
}
