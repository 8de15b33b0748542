//! Command-line interface definitions.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::todo::TodoStatus;

/// Markdown notes and todo indexer.
#[derive(Parser, Debug)]
#[command(name = "notedown", version, about, long_about = None)]
pub struct Cli {
    /// Notes root directory (defaults to NOTEDOWN_ROOT or the current
    /// directory)
    #[arg(long, global = true, env = "NOTEDOWN_ROOT")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output rendering for list commands.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Todo status as a CLI argument.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusArg {
    Pending,
    InProgress,
    Completed,
}

impl From<StatusArg> for TodoStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => Self::Pending,
            StatusArg::InProgress => Self::InProgress,
            StatusArg::Completed => Self::Completed,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Index changed notes (or everything with --force)
    Index {
        /// Re-index every file regardless of the change detector
        #[arg(short, long)]
        force: bool,

        /// Restrict the pass to one notebook
        #[arg(short, long)]
        notebook: Option<String>,

        /// Worker threads for large batches
        #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=64))]
        jobs: u8,

        /// Also drop notes whose files no longer exist
        #[arg(long)]
        prune: bool,
    },

    /// List todos in display order
    Todos {
        /// Filter by status
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        /// Only overdue todos (due before today, not completed)
        #[arg(long)]
        overdue: bool,

        /// Filter by priority (1 highest)
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=3))]
        priority: Option<u8>,

        /// Only these notebooks (repeatable)
        #[arg(long = "notebook")]
        notebooks: Vec<String>,

        /// Hide these notebooks (repeatable)
        #[arg(long = "exclude-notebook")]
        exclude_notebooks: Vec<String>,

        /// Require this tag (repeatable, all must match)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Hide todos carrying this tag (repeatable)
        #[arg(long = "exclude-tag")]
        exclude_tags: Vec<String>,

        /// Only todos from these source files (repeatable)
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Section label substring match
        #[arg(long)]
        section: Option<String>,

        /// Due before this date expression (e.g. "friday", "2025-02-01")
        #[arg(long)]
        due_before: Option<String>,

        /// Due after this date expression
        #[arg(long)]
        due_after: Option<String>,

        /// Top-level todos only, hiding subtasks
        #[arg(long)]
        parents_only: bool,

        /// Include todos from notes flagged notodo
        #[arg(long)]
        all: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Mark a todo completed (writes back to the source file)
    Done {
        /// Todo id (from `todos --format json`)
        id: String,
    },

    /// Mark a completed todo pending again
    Undone { id: String },

    /// Mark a todo in-progress
    Start { id: String },

    /// Manage linked external files and directories
    #[command(subcommand)]
    Link(LinkCommands),

    /// Manage the background watch daemon
    #[command(subcommand)]
    Daemon(DaemonCommands),

    /// Drop and recreate the database and search index
    Rebuild,

    /// Full-text search over note contents
    Search {
        /// Query text
        query: String,

        /// Maximum number of results
        #[arg(short = 'k', long, default_value_t = 20, value_parser = clap::value_parser!(u16).range(1..=500))]
        limit: u16,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Subcommand, Debug)]
pub enum LinkCommands {
    /// Register an external file or directory under an alias
    Add {
        /// Unique alias; surfaces as the virtual notebook @alias
        alias: String,

        /// Target file or directory
        path: PathBuf,

        /// Index subdirectories of a linked directory
        #[arg(long)]
        recursive: bool,

        /// Allow completing todos to write back into the target
        #[arg(long)]
        sync: bool,

        /// Exclude this target's todos from queries
        #[arg(long)]
        notodo: bool,
    },

    /// Remove a registration
    Remove { alias: String },

    /// List registrations
    List,
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommands {
    /// Start the watch daemon in the background
    Start {
        /// Stay attached to the terminal
        #[arg(long)]
        foreground: bool,

        /// Quiet seconds before a burst of changes is re-indexed
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..=3600))]
        debounce: u16,

        /// Skip maintaining the full-text search index
        #[arg(long)]
        no_search: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Show liveness and counters
    Status,

    /// Print the daemon log
    Log {
        /// Number of trailing lines to show
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}

/// Expand a leading `~` to the user's home directory.
#[must_use]
pub fn expand_tilde(path: &std::path::Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        return dirs::home_dir().unwrap_or_else(|| path.to_path_buf());
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
