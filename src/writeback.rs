//! Write-back of todo status changes into source markdown files.
//!
//! A toggle locates the todo's line in the source file, verifies the line
//! still carries the expected content, rewrites the checkbox marker, and
//! re-indexes the file. Stored line numbers can go stale when the file is
//! edited externally; an expanding nearby-line search recovers the todo by
//! content match before giving up.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::db::Database;
use crate::error::{NotedownError, Result};
use crate::scanner::Scanner;
use crate::search::SearchIndex;
use crate::todo::{checkbox_cleaned, set_marker, Todo, TodoStatus};

/// How far the nearby-line search expands from the stored line number.
const RECOVERY_RADIUS: usize = 10;

/// Retry budget for transient permission errors (Windows file locking).
const IO_RETRIES: u32 = 3;
const IO_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Toggle a todo's status in its source file and re-index that file.
///
/// # Errors
/// - `TodoNotFound` when the id is unknown, or when the todo cannot be
///   located in the file even after the nearby-line search.
/// - `SyncDisabled` when the todo lives in a linked file whose
///   registration has sync off. Distinct from not-found so callers can
///   explain the refusal.
pub fn set_todo_status(
    db: &Database,
    scanner: &Scanner,
    search: &mut dyn SearchIndex,
    id: &str,
    status: TodoStatus,
) -> Result<()> {
    let todo = db.get_todo(id)?.ok_or_else(|| NotedownError::TodoNotFound { id: id.to_string() })?;

    if todo.source.external {
        if let Some(alias) = &todo.source.alias {
            if let Some(linked) = db.get_linked_file(alias)? {
                if !linked.sync {
                    return Err(NotedownError::SyncDisabled { alias: alias.clone() });
                }
            }
        }
    }

    let abs = source_abs_path(db, &todo);
    let content = read_with_retry(&abs)?;
    let mut lines: Vec<String> = content.lines().map(String::from).collect();

    let line_idx = locate_line(&lines, &todo)
        .ok_or_else(|| NotedownError::TodoNotFound { id: id.to_string() })?;

    let rewritten = set_marker(&lines[line_idx], status)
        .ok_or_else(|| NotedownError::TodoNotFound { id: id.to_string() })?;
    lines[line_idx] = rewritten;

    let mut output = lines.join("\n");
    if content.ends_with('\n') {
        output.push('\n');
    }
    write_with_retry(&abs, &output)?;

    tracing::info!(id = %id, status = status.as_str(), line = line_idx + 1, "Updated todo in source file");
    scanner.index_single(db, search, &abs)
}

/// Absolute path of a todo's source file.
fn source_abs_path(db: &Database, todo: &Todo) -> PathBuf {
    if todo.source.external {
        PathBuf::from(&todo.source.path)
    } else {
        db.root().join(&todo.source.path)
    }
}

/// Find the todo's line: stored line number first, then expanding outward
/// (±1, ±2, …) up to [`RECOVERY_RADIUS`], matching by cleaned content.
fn locate_line(lines: &[String], todo: &Todo) -> Option<usize> {
    let stored = todo.line.saturating_sub(1);

    let matches = |idx: usize| -> bool {
        lines
            .get(idx)
            .and_then(|line| checkbox_cleaned(line))
            .is_some_and(|(_, cleaned)| cleaned == todo.cleaned)
    };

    if matches(stored) {
        return Some(stored);
    }
    for offset in 1..=RECOVERY_RADIUS {
        if let Some(above) = stored.checked_sub(offset) {
            if matches(above) {
                tracing::debug!(id = %todo.id, offset, "Recovered todo above stored line");
                return Some(above);
            }
        }
        let below = stored + offset;
        if matches(below) {
            tracing::debug!(id = %todo.id, offset, "Recovered todo below stored line");
            return Some(below);
        }
    }
    None
}

fn read_with_retry(path: &Path) -> Result<String> {
    retry_permission(|| fs::read_to_string(path))
}

fn write_with_retry(path: &Path, content: &str) -> Result<()> {
    retry_permission(|| fs::write(path, content))
}

/// Retry transient permission errors a few times before surfacing.
fn retry_permission<T>(mut op: impl FnMut() -> io::Result<T>) -> Result<T> {
    let mut attempts = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && attempts < IO_RETRIES => {
                attempts += 1;
                tracing::debug!(attempts, "Retrying after permission error");
                thread::sleep(IO_RETRY_DELAY);
            }
            Err(e) => return Err(NotedownError::Io { source: e }),
        }
    }
}
