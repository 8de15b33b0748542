//! Stable identifiers for notes, todos, and attachments.
//!
//! All identifiers derive from normalized paths and cleaned content so
//! they are platform-invariant and survive re-indexing. Todo ids are
//! content-derived, not line-derived: reordering a file keeps every id
//! stable, while editing a todo's text mints a new id.

use sha2::{Digest, Sha256};

/// Length of content hashes stored for change detection.
const CONTENT_HASH_LEN: usize = 8;

/// Length of note/todo/attachment identifiers.
const ID_LEN: usize = 12;

/// Normalize a path to forward-slash form.
///
/// A Windows path and a Unix path denoting the same relative location
/// produce the same string. Trailing slashes are stripped.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized.trim_end_matches('/').to_string()
}

fn sha256_hex(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(len);
    hash
}

/// Truncated content hash used by the change detector.
///
/// 8 hex chars of SHA-256. Collisions at this length are accepted for
/// staleness checks; this is not a security boundary.
#[inline]
#[must_use]
pub fn content_hash(text: &str) -> String {
    sha256_hex(text, CONTENT_HASH_LEN)
}

/// Deterministic todo identifier.
///
/// Hash of `normalize(source_path) + ":" + cleaned_content`. Stable under
/// line reordering within the file; changes when the todo text is edited
/// or the todo moves to another file.
#[must_use]
pub fn todo_id(source_path: &str, cleaned_content: &str) -> String {
    let key = format!("{}:{}", normalize_path(source_path), cleaned_content);
    sha256_hex(&key, ID_LEN)
}

/// Deterministic note identifier from the normalized path only.
///
/// Stable under content edits; changes on rename.
#[must_use]
pub fn note_id(path: &str) -> String {
    sha256_hex(&normalize_path(path), ID_LEN)
}

/// Deterministic attachment identifier scoped to its parent.
#[must_use]
pub fn attachment_id(parent_kind: &str, parent_id: &str, value: &str) -> String {
    let key = format!("{parent_kind}:{parent_id}:{value}");
    sha256_hex(&key, ID_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_backslashes() {
        assert_eq!(normalize_path("work\\projects\\plan.md"), "work/projects/plan.md");
        assert_eq!(normalize_path("work/projects/plan.md"), "work/projects/plan.md");
    }

    #[test]
    fn test_normalize_trailing_slash() {
        assert_eq!(normalize_path("work/"), "work");
        assert_eq!(normalize_path("work\\"), "work");
    }

    #[test]
    fn test_content_hash_length_and_charset() {
        let hash = content_hash("hello");
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_content_hash_differs_on_edit() {
        assert_ne!(content_hash("a"), content_hash("b"));
        assert_eq!(content_hash("same"), content_hash("same"));
    }

    #[test]
    fn test_todo_id_platform_invariant() {
        let unix = todo_id("work/tasks.md", "Ship release");
        let windows = todo_id("work\\tasks.md", "Ship release");
        assert_eq!(unix, windows);
    }

    #[test]
    fn test_todo_id_changes_on_content_edit() {
        let a = todo_id("work/tasks.md", "Ship release");
        let b = todo_id("work/tasks.md", "Ship release v2");
        assert_ne!(a, b);
    }

    #[test]
    fn test_todo_id_changes_on_move() {
        let a = todo_id("work/tasks.md", "Ship release");
        let b = todo_id("home/tasks.md", "Ship release");
        assert_ne!(a, b);
    }

    #[test]
    fn test_note_id_stable_under_content() {
        // Note ids depend on path only
        let a = note_id("work/tasks.md");
        let b = note_id("work/tasks.md");
        assert_eq!(a, b);
        assert_ne!(a, note_id("work/other.md"));
    }

    #[test]
    fn test_attachment_id_scoped_to_parent() {
        let a = attachment_id("todo", "abc", "file.pdf");
        let b = attachment_id("note", "abc", "file.pdf");
        assert_ne!(a, b);
    }
}
