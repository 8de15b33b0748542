//! notedown - markdown notes and todo indexer.
//!
//! This library provides the indexing pipeline behind the `notedown` CLI:
//! change detection over a notes tree, markdown note and todo parsing with
//! stable content-derived identifiers, reconciliation into a local `SQLite`
//! store, and a background watch daemon that keeps the index fresh.
//!
//! # Example
//!
//! ```rust
//! use notedown::db::Database;
//! use notedown::scanner::{Scanner, ScannerConfig};
//! use notedown::search::NullIndex;
//! use std::time::{SystemTime, UNIX_EPOCH};
//!
//! let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
//! let root = std::env::temp_dir().join(format!("notedown-doctest-{unique}"));
//! std::fs::create_dir_all(&root)?;
//! std::fs::write(root.join("inbox.md"), "# Inbox\n- [ ] try notedown\n")?;
//!
//! let db = Database::open_in_root(&root)?;
//! let mut search = NullIndex;
//! let scanner = Scanner::new(&root, ScannerConfig::default());
//! let count = scanner.index_all(&db, &mut search, false)?;
//! assert_eq!(count, 1);
//!
//! drop(db);
//! let _ = std::fs::remove_dir_all(&root);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Metadata directory created inside the notes root.
pub const META_DIR: &str = ".notedown";

/// Database filename inside the metadata directory.
pub const DB_NAME: &str = "index.db";

/// WAL mode shm file suffix.
pub const DB_SHM_SUFFIX: &str = "-shm";

/// WAL mode wal file suffix.
pub const DB_WAL_SUFFIX: &str = "-wal";

/// Daemon PID file inside the metadata directory.
pub const PID_NAME: &str = "daemon.pid";

/// Daemon liveness/statistics file inside the metadata directory.
pub const STATE_NAME: &str = "daemon.json";

/// Daemon append-only log file inside the metadata directory.
pub const LOG_NAME: &str = "daemon.log";

pub mod changes;
pub mod cli;
pub mod daemon;
pub mod dates;
pub mod db;
pub mod error;
pub mod ident;
pub mod note;
pub mod scanner;
pub mod search;
pub mod todo;
pub mod writeback;

pub use cli::OutputFormat;
pub use db::{Database, LinkedFile, PragmaConfig, TodoFilter};
pub use error::{ExitCode, NotedownError, Result};
pub use note::{Note, NoteLink};
pub use scanner::{IndexStats, Scanner, ScannerConfig};
pub use search::{FtsIndex, NullIndex, SearchHit, SearchIndex};
pub use todo::{Priority, Todo, TodoSource, TodoStatus};
