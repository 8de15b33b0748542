//! Two-tier staleness check for the incremental scanner.
//!
//! The mtime comparison avoids reading file contents for the common
//! untouched case; the content-hash fallback handles touched-but-unchanged
//! files and mtime-unreliable filesystems.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::db::Database;
use crate::error::{NotedownError, Result};
use crate::ident::content_hash;

/// Decide whether a file must be re-parsed.
///
/// 1. No stored row → true (new file).
/// 2. Stored mtime equals the filesystem mtime → false, no file read.
/// 3. Otherwise compare content hashes → true iff different.
///
/// # Errors
/// Returns `Io` if the file's metadata cannot be read.
pub fn needs_reindex(db: &Database, rel_path: &str, abs_path: &Path) -> Result<bool> {
    let Some((stored_mtime, stored_hash)) = db.note_meta(rel_path)? else {
        return Ok(true);
    };

    let metadata = fs::metadata(abs_path).map_err(|e| NotedownError::Io { source: e })?;
    let fs_mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64);

    if fs_mtime == stored_mtime {
        return Ok(false);
    }

    // mtime changed: fall back to the hash before declaring staleness.
    let bytes = fs::read(abs_path).map_err(|e| NotedownError::Io { source: e })?;
    let content = String::from_utf8_lossy(&bytes);
    Ok(content_hash(&content) != stored_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::note::parse_note;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::tempdir;

    fn index_file(db: &Database, rel: &str, abs: &Path) {
        let note = parse_note(rel, abs, false, None).unwrap().unwrap();
        db.upsert_note(&note).unwrap();
    }

    #[test]
    fn test_new_file_needs_reindex() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();
        let file = dir.path().join("new.md");
        std::fs::write(&file, "# New\n").unwrap();

        assert!(needs_reindex(&db, "new.md", &file).unwrap());
    }

    #[test]
    fn test_unchanged_file_skipped_via_mtime() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();
        let file = dir.path().join("a.md");
        std::fs::write(&file, "# A\n").unwrap();
        index_file(&db, "a.md", &file);

        assert!(!needs_reindex(&db, "a.md", &file).unwrap());
    }

    #[test]
    fn test_touch_without_edit_resolved_by_hash() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();
        let file = dir.path().join("a.md");
        std::fs::write(&file, "# A\n").unwrap();
        index_file(&db, "a.md", &file);

        // Bump mtime without touching content.
        set_file_mtime(&file, FileTime::from_unix_time(4_000_000_000, 0)).unwrap();
        assert!(!needs_reindex(&db, "a.md", &file).unwrap());
    }

    #[test]
    fn test_content_edit_detected() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();
        let file = dir.path().join("a.md");
        std::fs::write(&file, "# A\n").unwrap();
        index_file(&db, "a.md", &file);

        std::fs::write(&file, "# A edited\n").unwrap();
        set_file_mtime(&file, FileTime::from_unix_time(4_000_000_000, 0)).unwrap();
        assert!(needs_reindex(&db, "a.md", &file).unwrap());
    }
}
