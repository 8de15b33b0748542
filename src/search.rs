//! External search index boundary.
//!
//! The indexing pipeline only needs `upsert`/`delete`/`query`/`clear`;
//! everything behind that is swappable. [`FtsIndex`] keeps a full-text
//! index in an FTS5 table inside the same database file, on its own
//! connection. [`NullIndex`] is the disabled backend: indexing proceeds
//! normally and queries return nothing.
//!
//! Search failures are never allowed to fail a relational indexing pass;
//! the scanner catches and logs them per file.

use rusqlite::{params, Connection};
use std::path::Path;

use crate::error::Result;
use crate::{DB_NAME, META_DIR};

/// One ranked search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Document id the hit refers to (a note id).
    pub id: String,
    /// Caller-supplied metadata stored alongside the document (the note
    /// path, for display).
    pub meta: String,
    /// Highlighted excerpt around the match.
    pub excerpt: String,
    /// Relevance score; lower is better (bm25 rank).
    pub score: f64,
}

/// Write-through full-text index consumed by the scanner.
///
/// Not safe for concurrent writers; parallel indexing serializes access
/// through a mutex, so implementors must be `Send`.
pub trait SearchIndex: Send {
    fn upsert(&mut self, id: &str, text: &str, meta: &str) -> Result<()>;
    fn delete(&mut self, id: &str) -> Result<()>;
    fn query(&self, text: &str, k: usize) -> Result<Vec<SearchHit>>;
    /// Drop every document. Used by store rebuild so stale hits cannot
    /// reference deleted rows.
    fn clear(&mut self) -> Result<()>;
}

/// FTS5-backed search index stored in `note_search` inside the index
/// database, opened on a dedicated connection.
pub struct FtsIndex {
    conn: Connection,
}

impl FtsIndex {
    /// Open (or create) the search table under `root/.notedown/index.db`.
    ///
    /// # Errors
    /// Returns `Database` if the FTS5 table cannot be created (e.g. the
    /// `SQLite` build lacks FTS5 support).
    pub fn open_in_root(root: &Path) -> Result<Self> {
        let meta_dir = root.join(META_DIR);
        std::fs::create_dir_all(&meta_dir)
            .map_err(|e| crate::error::NotedownError::Io { source: e })?;
        let conn = Connection::open(meta_dir.join(DB_NAME))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS note_search
             USING fts5(doc_id UNINDEXED, meta UNINDEXED, body)",
        )?;
        Ok(Self { conn })
    }
}

impl SearchIndex for FtsIndex {
    fn upsert(&mut self, id: &str, text: &str, meta: &str) -> Result<()> {
        self.conn.execute("DELETE FROM note_search WHERE doc_id = ?1", params![id])?;
        self.conn.execute(
            "INSERT INTO note_search (doc_id, meta, body) VALUES (?1, ?2, ?3)",
            params![id, meta, text],
        )?;
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        self.conn.execute("DELETE FROM note_search WHERE doc_id = ?1", params![id])?;
        Ok(())
    }

    fn query(&self, text: &str, k: usize) -> Result<Vec<SearchHit>> {
        let sanitized = sanitize_query(text);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT doc_id, meta, snippet(note_search, 2, '[', ']', '...', 12), rank
             FROM note_search WHERE note_search MATCH ?1
             ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![sanitized, k as i64], |row| {
            Ok(SearchHit {
                id: row.get(0)?,
                meta: row.get(1)?,
                excerpt: row.get(2)?,
                score: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    fn clear(&mut self) -> Result<()> {
        self.conn.execute("DELETE FROM note_search", [])?;
        Ok(())
    }
}

/// Disabled search backend. All writes succeed; queries return nothing.
pub struct NullIndex;

impl SearchIndex for NullIndex {
    fn upsert(&mut self, _id: &str, _text: &str, _meta: &str) -> Result<()> {
        Ok(())
    }

    fn delete(&mut self, _id: &str) -> Result<()> {
        Ok(())
    }

    fn query(&self, _text: &str, _k: usize) -> Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }

    fn clear(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Quote each token so user input cannot hit FTS5 query syntax errors.
///
/// Embedded double quotes are doubled per `SQLite` quoting rules.
#[must_use]
pub fn sanitize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::tempdir;

    #[test]
    fn test_sanitize_query_quotes_tokens() {
        assert_eq!(sanitize_query("hello world"), "\"hello\" \"world\"");
        assert_eq!(sanitize_query("with\"quote"), "\"with\"\"quote\"");
        assert_eq!(sanitize_query("  "), "");
    }

    #[test]
    fn test_fts_round_trip() {
        let dir = tempdir().unwrap();
        // The store owns the database file; the index shares it.
        let _db = Database::open_in_root(dir.path()).unwrap();
        let mut index = FtsIndex::open_in_root(dir.path()).unwrap();

        index.upsert("n1", "the quarterly launch plan", "work/plan.md").unwrap();
        index.upsert("n2", "grocery list", "home/list.md").unwrap();

        let hits = index.query("launch", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "n1");
        assert_eq!(hits[0].meta, "work/plan.md");
        assert!(hits[0].excerpt.contains('['));
    }

    #[test]
    fn test_fts_upsert_replaces() {
        let dir = tempdir().unwrap();
        let _db = Database::open_in_root(dir.path()).unwrap();
        let mut index = FtsIndex::open_in_root(dir.path()).unwrap();

        index.upsert("n1", "old body text", "a.md").unwrap();
        index.upsert("n1", "new body text", "a.md").unwrap();

        assert!(index.query("old", 10).unwrap().is_empty());
        assert_eq!(index.query("new", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_fts_delete_and_clear() {
        let dir = tempdir().unwrap();
        let _db = Database::open_in_root(dir.path()).unwrap();
        let mut index = FtsIndex::open_in_root(dir.path()).unwrap();

        index.upsert("n1", "alpha", "a.md").unwrap();
        index.upsert("n2", "beta", "b.md").unwrap();

        index.delete("n1").unwrap();
        assert!(index.query("alpha", 10).unwrap().is_empty());

        index.clear().unwrap();
        assert!(index.query("beta", 10).unwrap().is_empty());
    }

    #[test]
    fn test_null_index_is_inert() {
        let mut index = NullIndex;
        index.upsert("x", "body", "meta").unwrap();
        assert!(index.query("body", 10).unwrap().is_empty());
        index.delete("x").unwrap();
        index.clear().unwrap();
    }

    #[test]
    fn test_malicious_query_does_not_error() {
        let dir = tempdir().unwrap();
        let _db = Database::open_in_root(dir.path()).unwrap();
        let mut index = FtsIndex::open_in_root(dir.path()).unwrap();
        index.upsert("n1", "content", "a.md").unwrap();

        // FTS5 operators and quotes must not produce syntax errors.
        assert!(index.query("NOT (\"", 10).is_ok());
        assert!(index.query("a* OR b", 10).is_ok());
    }
}
