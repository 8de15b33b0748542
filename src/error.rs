use thiserror::Error;

/// Centralized error types for the notedown indexer.
///
/// All errors are explicit enum variants (no Box<dyn Error>) so callers
/// can match on failure modes and produce actionable messages.
#[derive(Error, Debug)]
pub enum NotedownError {
    /// `SQLite` database operation failed
    #[error("database error: {source}")]
    Database {
        #[from]
        source: rusqlite::Error,
    },

    /// File system I/O operation failed
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// File contains invalid UTF-8 encoding
    #[error("invalid UTF-8 in file: {path}")]
    InvalidUtf8 { path: String },

    /// Directory walk error
    #[error("walk error: {source}")]
    Walk {
        #[from]
        source: ignore::Error,
    },

    /// Invalid CLI or store configuration value
    #[error("invalid {field}: {value} ({reason})")]
    ConfigInvalid { field: String, value: String, reason: String },

    /// The database schema version is newer than this binary understands
    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    /// A linked-file registration with this alias already exists
    #[error("alias '{alias}' is already registered")]
    AliasExists { alias: String },

    /// Write-back refused because the linked source has sync disabled
    #[error("todo source '{alias}' has sync disabled")]
    SyncDisabled { alias: String },

    /// Todo not found in the store, or no longer present at its recorded
    /// location in the source file
    #[error("todo not found: {id}")]
    TodoNotFound { id: String },

    /// Daemon start refused because a live daemon already holds the PID file
    #[error("daemon already running with pid {pid}")]
    DaemonAlreadyRunning { pid: u32 },

    /// Filesystem watcher error
    #[error("watch error: {source}")]
    Watch {
        #[from]
        source: notify::Error,
    },

    /// JSON serialization error
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

/// Result type alias for indexer operations.
pub type Result<T> = std::result::Result<T, NotedownError>;

/// Exit codes for the CLI application.
///
/// Based on BSD sysexits.h conventions for meaningful exit statuses.
/// Use `ExitCode::into()` to convert to `std::process::ExitCode`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Ok = 0,
    /// General software error (internal error, unexpected state)
    Software = 1,
    /// Invalid input data (malformed filter, corrupted database)
    DataErr = 2,
    /// I/O error (file not found, permission denied on files)
    IoErr = 3,
    /// No input provided (missing required arguments)
    NoInput = 4,
    /// Permission denied (sync-disabled write-back, file access)
    NoPerm = 5,
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        Self::from(code as u8)
    }
}

impl NotedownError {
    /// Map an error to the exit code the CLI should report.
    #[must_use]
    pub const fn exit_code(&self) -> ExitCode {
        match self {
            Self::Io { .. } | Self::Walk { .. } => ExitCode::IoErr,
            Self::SyncDisabled { .. } => ExitCode::NoPerm,
            Self::ConfigInvalid { .. }
            | Self::SchemaTooNew { .. }
            | Self::TodoNotFound { .. }
            | Self::AliasExists { .. }
            | Self::InvalidUtf8 { .. } => ExitCode::DataErr,
            _ => ExitCode::Software,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_values() {
        // Verify exit codes match BSD sysexits.h conventions
        assert_eq!(ExitCode::Ok as u8, 0);
        assert_eq!(ExitCode::Software as u8, 1);
        assert_eq!(ExitCode::DataErr as u8, 2);
        assert_eq!(ExitCode::IoErr as u8, 3);
        assert_eq!(ExitCode::NoInput as u8, 4);
        assert_eq!(ExitCode::NoPerm as u8, 5);
    }

    #[test]
    fn test_sync_disabled_maps_to_noperm() {
        let err = NotedownError::SyncDisabled { alias: "work".to_string() };
        assert_eq!(err.exit_code(), ExitCode::NoPerm);
        assert!(err.to_string().contains("sync disabled"));
    }

    #[test]
    fn test_todo_not_found_distinct_from_sync_disabled() {
        let not_found = NotedownError::TodoNotFound { id: "abc123".to_string() };
        let refused = NotedownError::SyncDisabled { alias: "work".to_string() };
        assert_ne!(not_found.exit_code(), refused.exit_code());
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: NotedownError = io_error.into();
        match err {
            NotedownError::Io { .. } => {}
            _ => panic!("Expected Io variant"),
        }
        assert_eq!(err.exit_code(), ExitCode::IoErr);
    }

    #[test]
    fn test_schema_too_new_display() {
        let err = NotedownError::SchemaTooNew { found: 9, supported: 3 };
        let display = format!("{err}");
        assert!(display.contains('9'));
        assert!(display.contains('3'));
    }
}
