//! `SQLite` store for notes, todos, tags, links, and linked-file
//! registrations.
//!
//! One database file lives under the metadata directory inside the notes
//! root. Schema evolution runs through an ordered, idempotent migration
//! list keyed by integer version; opening a file written by a newer binary
//! fails with `SchemaTooNew` instead of corrupting it.
//!
//! Connections are never shared across threads: parallel indexing opens
//! one connection per worker via [`Database::open_in_root`].

use chrono::{Datelike, Local, NaiveDate, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::dates::Due;
use crate::error::{NotedownError, Result};
use crate::ident::normalize_path;
use crate::note::{LinkKind, Note, NoteLink};
use crate::todo::{Priority, Todo, TodoSource, TodoStatus};
use crate::{DB_NAME, META_DIR};

/// Application ID stored in the `SQLite` header to mark our database files.
/// ASCII "NDWN" as a 32-bit integer.
const APPLICATION_ID: i64 = 0x4e44_574e;

/// Latest schema version this binary understands.
pub const SCHEMA_VERSION: i64 = 3;

/// SQLite PRAGMA tuning applied to every connection.
///
/// Defaults favor a local single-user store: WAL journaling for concurrent
/// readers, NORMAL synchronous, a modest page cache, and memory-mapped I/O.
#[derive(Debug, Clone)]
pub struct PragmaConfig {
    /// Page cache size in KiB (applied as a negative `cache_size`).
    pub cache_size_kb: u32,
    /// Memory-map window in bytes. Zero disables mmap.
    pub mmap_size: u64,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u32,
    /// `synchronous` level: OFF, NORMAL, or FULL.
    pub synchronous: String,
}

impl Default for PragmaConfig {
    fn default() -> Self {
        Self {
            cache_size_kb: 16 * 1024,
            mmap_size: 64 * 1024 * 1024,
            busy_timeout_ms: 5_000,
            synchronous: "NORMAL".to_string(),
        }
    }
}

impl PragmaConfig {
    /// Validate field ranges before use.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` for an unknown synchronous level or a zero
    /// busy timeout.
    pub fn validate(&self) -> Result<()> {
        match self.synchronous.as_str() {
            "OFF" | "NORMAL" | "FULL" => {}
            other => {
                return Err(NotedownError::ConfigInvalid {
                    field: "synchronous".to_string(),
                    value: other.to_string(),
                    reason: "expected OFF, NORMAL, or FULL".to_string(),
                })
            }
        }
        if self.busy_timeout_ms == 0 {
            return Err(NotedownError::ConfigInvalid {
                field: "busy_timeout_ms".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// A registered external file or directory, tracked like a notebook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedFile {
    /// Unique key; surfaces as the virtual notebook `@alias`.
    pub alias: String,
    pub path: String,
    pub recursive: bool,
    /// Whether completing a todo writes back to the external source.
    pub sync: bool,
    pub exclude_todos: bool,
}

/// Date history carried across delete-then-reinsert reconciliation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TodoHistory {
    pub created_date: Option<NaiveDate>,
    pub completed_date: Option<NaiveDate>,
    pub was_completed: bool,
}

/// Composable filter criteria for todo queries.
///
/// Every field is optional; any subset combines with AND semantics.
#[derive(Debug, Clone, Default)]
pub struct TodoFilter {
    pub status: Option<TodoStatus>,
    pub due_before: Option<NaiveDate>,
    pub due_after: Option<NaiveDate>,
    pub created_before: Option<NaiveDate>,
    pub created_after: Option<NaiveDate>,
    /// Due before today and not completed.
    pub overdue_only: bool,
    pub priority: Option<Priority>,
    /// Allow-list of notebooks; empty means all.
    pub notebooks: Vec<String>,
    pub exclude_notebooks: Vec<String>,
    /// Every listed tag must be present.
    pub tags: Vec<String>,
    /// No listed tag may be present.
    pub exclude_tags: Vec<String>,
    /// Allow-list of source paths; empty means all.
    pub source_paths: Vec<String>,
    /// Case-insensitive substring match against the section label.
    pub section_contains: Option<String>,
    /// Include todos from notes flagged `notodo: true`.
    pub include_excluded_notes: bool,
    /// Drop todos that have a parent.
    pub parents_only: bool,
}

/// Handle to the relational store.
///
/// Owns one connection. Not `Sync`; open one per thread.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
    /// Notes root this store belongs to, used for deleted-file cleanup.
    root: PathBuf,
}

impl Database {
    /// Open (or create) the store under `root/.notedown/index.db` with
    /// default pragmas and run pending migrations.
    ///
    /// # Errors
    /// Returns `SchemaTooNew` if the file was written by a newer binary,
    /// `Io` if the metadata directory cannot be created, or `Database`
    /// for `SQLite` failures.
    pub fn open_in_root(root: &Path) -> Result<Self> {
        Self::open_with_config(root, &PragmaConfig::default())
    }

    /// Open with explicit PRAGMA tuning.
    pub fn open_with_config(root: &Path, config: &PragmaConfig) -> Result<Self> {
        config.validate()?;

        let meta_dir = root.join(META_DIR);
        fs::create_dir_all(&meta_dir).map_err(|e| NotedownError::Io { source: e })?;

        let conn = Connection::open(meta_dir.join(DB_NAME))?;
        apply_pragmas(&conn, config)?;

        let mut db = Self { conn, root: root.to_path_buf() };
        db.migrate()?;
        Ok(db)
    }

    /// The notes root this store was opened under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Borrow the underlying connection. Used by the search boundary to
    /// share the database file without a second open.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn stored_version(&self) -> Result<i64> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
            [],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(0);
        }
        let version = self
            .conn
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        Ok(version.unwrap_or(0))
    }

    /// Apply pending migrations in order.
    fn migrate(&mut self) -> Result<()> {
        let stored = self.stored_version()?;
        if stored > SCHEMA_VERSION {
            return Err(NotedownError::SchemaTooNew { found: stored, supported: SCHEMA_VERSION });
        }
        if stored == SCHEMA_VERSION {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        for (version, migration) in MIGRATIONS {
            if *version > stored {
                tracing::debug!(version, "Applying schema migration");
                migration(&tx)?;
            }
        }
        tx.execute(
            "INSERT INTO schema_version (id, version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET version = ?1",
            params![SCHEMA_VERSION],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Drop every table and re-run all migrations from zero.
    ///
    /// Corruption recovery: callers must also clear the external search
    /// index so stale hits cannot reference deleted rows.
    pub fn rebuild(&mut self) -> Result<()> {
        tracing::warn!("Rebuilding database schema from scratch");
        let tables: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for table in tables {
            self.conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\""))?;
        }
        self.migrate()
    }

    // ------------------------------------------------------------------
    // Notes

    /// Insert-or-replace a note by path, atomically replacing its tag and
    /// link rows (delete-then-insert, not merge).
    pub fn upsert_note(&self, note: &Note) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO notes
               (path, id, title, date, notebook, content_hash, content, mtime,
                external, source_alias, exclude_todos)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(path) DO UPDATE SET
               id = ?2, title = ?3, date = ?4, notebook = ?5, content_hash = ?6,
               content = ?7, mtime = ?8, external = ?9, source_alias = ?10,
               exclude_todos = ?11",
            params![
                note.path,
                crate::ident::note_id(&note.path),
                note.title,
                note.date.map(|d| d.to_string()),
                note.notebook,
                note.content_hash,
                note.content,
                note.mtime,
                note.external,
                note.source_alias,
                note.exclude_todos,
            ],
        )?;

        tx.execute("DELETE FROM note_tags WHERE path = ?1", params![note.path])?;
        for tag in &note.tags {
            tx.execute(
                "INSERT OR IGNORE INTO note_tags (path, tag) VALUES (?1, ?2)",
                params![note.path, tag],
            )?;
        }

        tx.execute("DELETE FROM note_links WHERE path = ?1", params![note.path])?;
        for link in &note.links {
            let kind = match link.kind {
                LinkKind::Wiki => "wiki",
                LinkKind::Markdown => "markdown",
            };
            tx.execute(
                "INSERT INTO note_links (path, target, kind, external) VALUES (?1, ?2, ?3, ?4)",
                params![note.path, link.target, kind, link.external],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Stored (mtime, content_hash) for the change detector. No file read.
    pub fn note_meta(&self, path: &str) -> Result<Option<(i64, String)>> {
        let path = normalize_path(path);
        let row = self
            .conn
            .query_row(
                "SELECT mtime, content_hash FROM notes WHERE path = ?1",
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Full note row by normalized path.
    pub fn get_note(&self, path: &str) -> Result<Option<Note>> {
        let path = normalize_path(path);
        let note = self
            .conn
            .query_row(
                "SELECT path, title, date, notebook, content_hash, content, mtime,
                        external, source_alias, exclude_todos
                 FROM notes WHERE path = ?1",
                params![path],
                |row| {
                    Ok(Note {
                        path: row.get(0)?,
                        title: row.get(1)?,
                        date: row
                            .get::<_, Option<String>>(2)?
                            .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
                        notebook: row.get(3)?,
                        content_hash: row.get(4)?,
                        content: row.get(5)?,
                        mtime: row.get(6)?,
                        external: row.get(7)?,
                        source_alias: row.get(8)?,
                        exclude_todos: row.get(9)?,
                        tags: Vec::new(),
                        links: Vec::new(),
                    })
                },
            )
            .optional()?;

        let Some(mut note) = note else { return Ok(None) };

        let mut stmt =
            self.conn.prepare("SELECT tag FROM note_tags WHERE path = ?1 ORDER BY tag")?;
        note.tags = stmt
            .query_map(params![note.path], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut stmt = self
            .conn
            .prepare("SELECT target, kind, external FROM note_links WHERE path = ?1")?;
        note.links = stmt
            .query_map(params![note.path], |row| {
                let kind: String = row.get(1)?;
                Ok(NoteLink {
                    target: row.get(0)?,
                    kind: if kind == "wiki" { LinkKind::Wiki } else { LinkKind::Markdown },
                    external: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;

        Ok(Some(note))
    }

    /// All stored (path, content) pairs, for search-index rebuild.
    pub fn all_note_contents(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare("SELECT path, content FROM notes ORDER BY path")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Paths of all internal (non-linked) notes.
    pub fn internal_note_paths(&self) -> Result<Vec<String>> {
        let mut stmt =
            self.conn.prepare("SELECT path FROM notes WHERE external = 0 ORDER BY path")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Delete note rows whose internal file no longer exists on disk,
    /// cascading their todos. Returns the removed paths so the caller can
    /// evict them from the search index.
    pub fn remove_deleted_notes(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for path in self.internal_note_paths()? {
            if !self.root.join(&path).exists() {
                removed.push(path);
            }
        }

        let tx = self.conn.unchecked_transaction()?;
        for path in &removed {
            tracing::info!(path = %path, "Removing deleted note from index");
            delete_todos_for_source_tx(&tx, path)?;
            tx.execute("DELETE FROM note_tags WHERE path = ?1", params![path])?;
            tx.execute("DELETE FROM note_links WHERE path = ?1", params![path])?;
            tx.execute("DELETE FROM notes WHERE path = ?1", params![path])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Todos

    /// Insert-or-replace a todo by id, preserving history.
    ///
    /// `created_date` survives from any existing row with the same id.
    /// `completed_date` is set the first time a todo transitions into
    /// completed, kept while it stays completed, and cleared otherwise.
    pub fn upsert_todo(&self, todo: &Todo) -> Result<()> {
        upsert_todo_conn(&self.conn, todo, Local::now().date_naive())
    }

    #[cfg(test)]
    fn upsert_todo_at(&self, todo: &Todo, today: NaiveDate) -> Result<()> {
        upsert_todo_conn(&self.conn, todo, today)
    }

    /// Delete all todo rows for one source file, tolerating legacy
    /// backslash-form stored paths.
    pub fn delete_todos_for_source(&self, path: &str) -> Result<()> {
        delete_todos_for_source_conn(&self.conn, path)
    }

    /// History snapshot for one source file, keyed by todo id: the dates
    /// and status that delete-then-reinsert reconciliation must carry
    /// forward. Taken before the delete.
    pub fn todo_history_for_source(&self, path: &str) -> Result<HashMap<String, TodoHistory>> {
        let normalized = normalize_path(path);
        let legacy = normalized.replace('/', "\\");
        let mut stmt = self.conn.prepare(
            "SELECT id, created_date, completed_date, status
             FROM todos WHERE source_path IN (?1, ?2)",
        )?;
        let rows = stmt.query_map(params![normalized, legacy], |row| {
            let id: String = row.get(0)?;
            let status: String = row.get(3)?;
            Ok((
                id,
                TodoHistory {
                    created_date: row
                        .get::<_, Option<String>>(1)?
                        .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
                    completed_date: row
                        .get::<_, Option<String>>(2)?
                        .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
                    was_completed: status == TodoStatus::Completed.as_str(),
                },
            ))
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// One todo row by id.
    pub fn get_todo(&self, id: &str) -> Result<Option<Todo>> {
        let mut stmt = self.conn.prepare(&format!("{TODO_SELECT} WHERE id = ?1"))?;
        let todo = stmt.query_row(params![id], todo_from_row).optional()?;
        Ok(todo)
    }

    /// Query todos through a composable filter.
    ///
    /// Fetches candidate rows (joined with the owning note for the
    /// todo-exclusion flag) and applies the filter predicates.
    pub fn query_todos(&self, filter: &TodoFilter) -> Result<Vec<Todo>> {
        self.query_todos_at(filter, Local::now().date_naive())
    }

    /// Like [`Self::query_todos`] with an explicit "today" for the overdue
    /// predicate.
    pub fn query_todos_at(&self, filter: &TodoFilter, today: NaiveDate) -> Result<Vec<Todo>> {
        let sql = format!(
            "{TODO_SELECT} LEFT JOIN notes ON notes.path = todos.source_path
             WHERE (?1 OR IFNULL(notes.exclude_todos, 0) = 0)
             ORDER BY todos.source_path, todos.line"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![filter.include_excluded_notes], todo_from_row)?;

        let mut notebooks: HashMap<String, String> = HashMap::new();
        {
            let mut stmt = self.conn.prepare("SELECT path, notebook FROM notes")?;
            for row in stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))? {
                let (path, notebook): (String, String) = row?;
                notebooks.insert(path, notebook);
            }
        }

        let mut out = Vec::new();
        for row in rows {
            let todo = row?;
            let notebook = notebooks
                .get(&todo.source.path)
                .cloned()
                .or_else(|| todo.source.alias.as_ref().map(|a| format!("@{a}")))
                .unwrap_or_default();
            if filter_matches(filter, &todo, &notebook, today) {
                out.push(todo);
            }
        }
        Ok(out)
    }

    /// Query then sort into display order.
    ///
    /// Buckets: overdue (due ascending) < in-progress < due-today <
    /// due-this-week < due-later < no-due-date (created ascending).
    /// Within a bucket: priority (1 before 2 before 3 before none), then
    /// original line number.
    pub fn sorted_todos(&self, filter: &TodoFilter) -> Result<Vec<Todo>> {
        self.sorted_todos_at(filter, Local::now().date_naive())
    }

    /// Like [`Self::sorted_todos`] with an explicit evaluation date.
    pub fn sorted_todos_at(&self, filter: &TodoFilter, today: NaiveDate) -> Result<Vec<Todo>> {
        let mut todos = self.query_todos_at(filter, today)?;
        todos.sort_by_key(|todo| sort_key(todo, today));
        Ok(todos)
    }

    // ------------------------------------------------------------------
    // Linked files

    /// Register an external file or directory under a unique alias.
    ///
    /// # Errors
    /// Returns `AliasExists` when the alias is taken.
    pub fn add_linked_file(&self, linked: &LinkedFile) -> Result<()> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO linked_files (alias, path, recursive, sync, exclude_todos)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                linked.alias,
                normalize_path(&linked.path),
                linked.recursive,
                linked.sync,
                linked.exclude_todos,
            ],
        )?;
        if inserted == 0 {
            return Err(NotedownError::AliasExists { alias: linked.alias.clone() });
        }
        Ok(())
    }

    /// Remove a registration. Returns false if the alias was unknown.
    pub fn remove_linked_file(&self, alias: &str) -> Result<bool> {
        let deleted =
            self.conn.execute("DELETE FROM linked_files WHERE alias = ?1", params![alias])?;
        Ok(deleted > 0)
    }

    pub fn get_linked_file(&self, alias: &str) -> Result<Option<LinkedFile>> {
        let row = self
            .conn
            .query_row(
                "SELECT alias, path, recursive, sync, exclude_todos
                 FROM linked_files WHERE alias = ?1",
                params![alias],
                linked_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_linked_files(&self) -> Result<Vec<LinkedFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT alias, path, recursive, sync, exclude_todos FROM linked_files ORDER BY alias",
        )?;
        let rows = stmt.query_map([], linked_from_row)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }
}

fn apply_pragmas(conn: &Connection, config: &PragmaConfig) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", &config.synchronous)?;
    conn.pragma_update(None, "cache_size", -(i64::from(config.cache_size_kb)))?;
    conn.pragma_update(None, "mmap_size", config.mmap_size as i64)?;
    conn.pragma_update(None, "busy_timeout", i64::from(config.busy_timeout_ms))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "application_id", APPLICATION_ID)?;
    Ok(())
}

type Migration = fn(&Connection) -> rusqlite::Result<()>;

/// Ordered migration list. Each entry is idempotent so a partially
/// migrated file is safe to re-open.
const MIGRATIONS: &[(i64, Migration)] = &[(1, migrate_v1), (2, migrate_v2), (3, migrate_v3)];

fn migrate_v1(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS notes (
            path TEXT PRIMARY KEY,
            id TEXT NOT NULL,
            title TEXT NOT NULL,
            date TEXT,
            notebook TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            content TEXT NOT NULL,
            mtime INTEGER NOT NULL,
            external INTEGER NOT NULL DEFAULT 0,
            source_alias TEXT,
            exclude_todos INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS todos (
            id TEXT PRIMARY KEY,
            cleaned TEXT NOT NULL,
            raw TEXT NOT NULL,
            status TEXT NOT NULL,
            source_path TEXT NOT NULL,
            source_external INTEGER NOT NULL DEFAULT 0,
            source_alias TEXT,
            line INTEGER NOT NULL,
            created_date TEXT,
            completed_date TEXT,
            due_date TEXT,
            due_time TEXT,
            priority INTEGER,
            tags TEXT NOT NULL DEFAULT '[]',
            parent_id TEXT REFERENCES todos(id) ON DELETE CASCADE
        );
        CREATE TABLE IF NOT EXISTS note_tags (
            path TEXT NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (path, tag)
        );
        CREATE TABLE IF NOT EXISTS note_links (
            path TEXT NOT NULL,
            target TEXT NOT NULL,
            kind TEXT NOT NULL,
            external INTEGER NOT NULL DEFAULT 0
        );",
    )
}

fn migrate_v2(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS linked_files (
            alias TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            recursive INTEGER NOT NULL DEFAULT 0,
            sync INTEGER NOT NULL DEFAULT 0,
            exclude_todos INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_todos_source ON todos(source_path);
        CREATE INDEX IF NOT EXISTS idx_todos_status ON todos(status);
        CREATE INDEX IF NOT EXISTS idx_notes_notebook ON notes(notebook);",
    )
}

fn migrate_v3(conn: &Connection) -> rusqlite::Result<()> {
    add_column_if_missing(conn, "todos", "section", "TEXT")?;
    add_column_if_missing(conn, "todos", "details", "TEXT")?;
    add_column_if_missing(conn, "todos", "attachments", "TEXT NOT NULL DEFAULT '[]'")
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(std::result::Result::ok)
        .any(|name| name == column);
    drop(stmt);
    if !exists {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    }
    Ok(())
}

const TODO_SELECT: &str = "SELECT todos.id, todos.cleaned, todos.raw, todos.status,
    todos.source_path, todos.source_external, todos.source_alias, todos.line,
    todos.created_date, todos.completed_date, todos.due_date, todos.due_time,
    todos.priority, todos.tags, todos.section, todos.parent_id, todos.details,
    todos.attachments
    FROM todos";

fn todo_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Todo> {
    let status: String = row.get(3)?;
    let due_date: Option<String> = row.get(10)?;
    let due_time: Option<String> = row.get(11)?;
    let due = due_date.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()).map(|date| {
        Due {
            date,
            time: due_time.and_then(|t| NaiveTime::parse_from_str(&t, "%H:%M:%S").ok()),
        }
    });
    let tags_json: String = row.get(13)?;
    let attachments_json: String = row.get(17)?;

    Ok(Todo {
        id: row.get(0)?,
        cleaned: row.get(1)?,
        raw: row.get(2)?,
        status: TodoStatus::from_str_opt(&status).unwrap_or(TodoStatus::Pending),
        source: TodoSource {
            path: row.get(4)?,
            external: row.get(5)?,
            alias: row.get(6)?,
        },
        line: row.get::<_, i64>(7)? as usize,
        created_date: row
            .get::<_, Option<String>>(8)?
            .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        completed_date: row
            .get::<_, Option<String>>(9)?
            .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        due,
        priority: row.get::<_, Option<u8>>(12)?.and_then(Priority::from_level),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        section: row.get(14)?,
        parent_id: row.get(15)?,
        children: Vec::new(),
        details: row.get(16)?,
        attachments: serde_json::from_str(&attachments_json).unwrap_or_default(),
    })
}

fn linked_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LinkedFile> {
    Ok(LinkedFile {
        alias: row.get(0)?,
        path: row.get(1)?,
        recursive: row.get(2)?,
        sync: row.get(3)?,
        exclude_todos: row.get(4)?,
    })
}

fn upsert_todo_conn(conn: &Connection, todo: &Todo, today: NaiveDate) -> Result<()> {
    let existing: Option<(Option<String>, Option<String>, String)> = conn
        .query_row(
            "SELECT created_date, completed_date, status FROM todos WHERE id = ?1",
            params![todo.id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let created_date = existing
        .as_ref()
        .and_then(|(created, _, _)| created.clone())
        .or_else(|| todo.created_date.map(|d| d.to_string()))
        .unwrap_or_else(|| today.to_string());

    let completed_date = if todo.status == TodoStatus::Completed {
        existing
            .as_ref()
            .filter(|(_, _, status)| status == TodoStatus::Completed.as_str())
            .and_then(|(_, completed, _)| completed.clone())
            .or_else(|| todo.completed_date.map(|d| d.to_string()))
            .or_else(|| Some(today.to_string()))
    } else {
        None
    };

    conn.execute(
        "INSERT INTO todos
           (id, cleaned, raw, status, source_path, source_external, source_alias,
            line, created_date, completed_date, due_date, due_time, priority,
            tags, section, parent_id, details, attachments)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
         ON CONFLICT(id) DO UPDATE SET
           cleaned = ?2, raw = ?3, status = ?4, source_path = ?5,
           source_external = ?6, source_alias = ?7, line = ?8, created_date = ?9,
           completed_date = ?10, due_date = ?11, due_time = ?12, priority = ?13,
           tags = ?14, section = ?15, parent_id = ?16, details = ?17,
           attachments = ?18",
        params![
            todo.id,
            todo.cleaned,
            todo.raw,
            todo.status.as_str(),
            todo.source.path,
            todo.source.external,
            todo.source.alias,
            todo.line as i64,
            created_date,
            completed_date,
            todo.due.map(|d| d.date.to_string()),
            todo.due.and_then(|d| d.time).map(|t| t.format("%H:%M:%S").to_string()),
            todo.priority.map(Priority::level),
            serde_json::to_string(&todo.tags)?,
            todo.section,
            todo.parent_id,
            todo.details,
            serde_json::to_string(&todo.attachments)?,
        ],
    )?;
    Ok(())
}

fn delete_todos_for_source_conn(conn: &Connection, path: &str) -> Result<()> {
    let normalized = normalize_path(path);
    let legacy = normalized.replace('/', "\\");
    conn.execute(
        "DELETE FROM todos WHERE source_path IN (?1, ?2)",
        params![normalized, legacy],
    )?;
    Ok(())
}

fn delete_todos_for_source_tx(tx: &rusqlite::Transaction<'_>, path: &str) -> Result<()> {
    delete_todos_for_source_conn(tx, path)
}

fn filter_matches(filter: &TodoFilter, todo: &Todo, notebook: &str, today: NaiveDate) -> bool {
    if let Some(status) = filter.status {
        if todo.status != status {
            return false;
        }
    }
    if filter.parents_only && todo.parent_id.is_some() {
        return false;
    }
    if let Some(priority) = filter.priority {
        if todo.priority != Some(priority) {
            return false;
        }
    }
    if filter.overdue_only {
        let overdue = todo
            .due
            .is_some_and(|due| due.date < today && todo.status != TodoStatus::Completed);
        if !overdue {
            return false;
        }
    }
    if let Some(before) = filter.due_before {
        if !todo.due.is_some_and(|due| due.date < before) {
            return false;
        }
    }
    if let Some(after) = filter.due_after {
        if !todo.due.is_some_and(|due| due.date > after) {
            return false;
        }
    }
    if let Some(before) = filter.created_before {
        if !todo.created_date.is_some_and(|d| d < before) {
            return false;
        }
    }
    if let Some(after) = filter.created_after {
        if !todo.created_date.is_some_and(|d| d > after) {
            return false;
        }
    }
    if !filter.notebooks.is_empty() && !filter.notebooks.iter().any(|n| n == notebook) {
        return false;
    }
    if filter.exclude_notebooks.iter().any(|n| n == notebook) {
        return false;
    }
    if !filter.tags.iter().all(|tag| todo.tags.contains(tag)) {
        return false;
    }
    if filter.exclude_tags.iter().any(|tag| todo.tags.contains(tag)) {
        return false;
    }
    if !filter.source_paths.is_empty() {
        let normalized: Vec<String> =
            filter.source_paths.iter().map(|p| normalize_path(p)).collect();
        if !normalized.contains(&todo.source.path) {
            return false;
        }
    }
    if let Some(needle) = &filter.section_contains {
        let matched = todo
            .section
            .as_ref()
            .is_some_and(|s| s.to_lowercase().contains(&needle.to_lowercase()));
        if !matched {
            return false;
        }
    }
    true
}

/// Sort key implementing the six display buckets.
fn sort_key(todo: &Todo, today: NaiveDate) -> (u8, i64, u8, usize) {
    let priority = todo.priority.map_or(4, Priority::level);
    let line = todo.line;

    if let Some(due) = todo.due {
        if due.date < today && todo.status != TodoStatus::Completed {
            return (0, date_ord(due.date), priority, line);
        }
        if todo.status == TodoStatus::InProgress {
            return (1, date_ord(due.date), priority, line);
        }
        let bucket = if due.date == today {
            2
        } else if due.date <= today + chrono::Duration::days(7) {
            3
        } else {
            4
        };
        (bucket, date_ord(due.date), priority, line)
    } else if todo.status == TodoStatus::InProgress {
        (1, 0, priority, line)
    } else {
        (5, todo.created_date.map_or(i64::MAX, date_ord), priority, line)
    }
}

fn date_ord(date: NaiveDate) -> i64 {
    i64::from(date.num_days_from_ce())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::todo_id;
    use tempfile::tempdir;

    fn todo(path: &str, cleaned: &str, status: TodoStatus) -> Todo {
        Todo {
            id: todo_id(path, cleaned),
            cleaned: cleaned.to_string(),
            raw: cleaned.to_string(),
            status,
            source: TodoSource::note(path),
            line: 1,
            created_date: None,
            completed_date: None,
            due: None,
            priority: None,
            tags: Vec::new(),
            section: None,
            parent_id: None,
            children: Vec::new(),
            details: None,
            attachments: Vec::new(),
        }
    }

    fn note(path: &str, content: &str) -> Note {
        crate::note::parse_note_content(path, content, 100, false, None)
    }

    #[test]
    fn test_open_creates_metadata_dir() {
        let dir = tempdir().unwrap();
        let _db = Database::open_in_root(dir.path()).unwrap();
        assert!(dir.path().join(META_DIR).join(DB_NAME).exists());
    }

    #[test]
    fn test_migrations_idempotent_on_reopen() {
        let dir = tempdir().unwrap();
        drop(Database::open_in_root(dir.path()).unwrap());
        let db = Database::open_in_root(dir.path()).unwrap();
        assert_eq!(db.stored_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_schema_too_new_rejected() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open_in_root(dir.path()).unwrap();
            db.conn
                .execute("UPDATE schema_version SET version = ?1", params![SCHEMA_VERSION + 10])
                .unwrap();
        }
        let err = Database::open_in_root(dir.path()).unwrap_err();
        assert!(matches!(err, NotedownError::SchemaTooNew { .. }));
    }

    #[test]
    fn test_pragma_config_validation() {
        let bad = PragmaConfig { synchronous: "TURBO".to_string(), ..PragmaConfig::default() };
        assert!(bad.validate().is_err());

        let zero = PragmaConfig { busy_timeout_ms: 0, ..PragmaConfig::default() };
        assert!(zero.validate().is_err());

        assert!(PragmaConfig::default().validate().is_ok());
    }

    #[test]
    fn test_upsert_note_replaces_tags_and_links() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();

        db.upsert_note(&note("work/a.md", "---\ntags: [one, two]\n---\nsee [[b]]\n")).unwrap();
        db.upsert_note(&note("work/a.md", "---\ntags: [three]\n---\nsee [[c]]\n")).unwrap();

        let stored = db.get_note("work/a.md").unwrap().unwrap();
        assert_eq!(stored.tags, vec!["three"]);
        assert_eq!(stored.links.len(), 1);
        assert_eq!(stored.links[0].target, "c");
    }

    #[test]
    fn test_created_date_preserved_across_reinsert() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();
        let day1 = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();

        let t = todo("a.md", "task", TodoStatus::Pending);
        db.upsert_todo_at(&t, day1).unwrap();
        db.delete_todos_for_source("a.md").unwrap();
        db.upsert_todo_at(&t, day2).unwrap();

        let stored = db.get_todo(&t.id).unwrap().unwrap();
        assert_eq!(stored.created_date, Some(day1));
    }

    #[test]
    fn test_completed_date_lifecycle() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();
        let day1 = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2025, 1, 8).unwrap();
        let day3 = NaiveDate::from_ymd_opt(2025, 1, 20).unwrap();

        let mut t = todo("a.md", "task", TodoStatus::Pending);
        db.upsert_todo_at(&t, day1).unwrap();
        assert_eq!(db.get_todo(&t.id).unwrap().unwrap().completed_date, None);

        // First completion stamps the date.
        t.status = TodoStatus::Completed;
        db.upsert_todo_at(&t, day2).unwrap();
        assert_eq!(db.get_todo(&t.id).unwrap().unwrap().completed_date, Some(day2));

        // Still completed on a later day: original stamp preserved.
        db.upsert_todo_at(&t, day3).unwrap();
        assert_eq!(db.get_todo(&t.id).unwrap().unwrap().completed_date, Some(day2));

        // Un-complete clears it.
        t.status = TodoStatus::Pending;
        db.upsert_todo_at(&t, day3).unwrap();
        assert_eq!(db.get_todo(&t.id).unwrap().unwrap().completed_date, None);

        // Re-complete stamps fresh.
        t.status = TodoStatus::Completed;
        db.upsert_todo_at(&t, day3).unwrap();
        assert_eq!(db.get_todo(&t.id).unwrap().unwrap().completed_date, Some(day3));
    }

    #[test]
    fn test_delete_todos_tolerates_legacy_backslash_paths() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();

        let t = todo("work/a.md", "task", TodoStatus::Pending);
        db.upsert_todo(&t).unwrap();
        // Simulate a legacy row with a backslash path.
        db.conn
            .execute(
                "UPDATE todos SET source_path = 'work\\a.md' WHERE id = ?1",
                params![t.id],
            )
            .unwrap();

        db.delete_todos_for_source("work/a.md").unwrap();
        assert!(db.get_todo(&t.id).unwrap().is_none());
    }

    #[test]
    fn test_parent_cascade_delete() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();

        let parent = todo("a.md", "parent", TodoStatus::Pending);
        let mut child = todo("a.md", "child", TodoStatus::Pending);
        child.parent_id = Some(parent.id.clone());
        db.upsert_todo(&parent).unwrap();
        db.upsert_todo(&child).unwrap();

        db.conn.execute("DELETE FROM todos WHERE id = ?1", params![parent.id]).unwrap();
        assert!(db.get_todo(&child.id).unwrap().is_none());
    }

    #[test]
    fn test_query_filter_status_and_tags() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();

        let mut a = todo("n.md", "tagged pending", TodoStatus::Pending);
        a.tags = vec!["work".to_string()];
        let b = todo("n.md", "plain done", TodoStatus::Completed);
        db.upsert_todo(&a).unwrap();
        db.upsert_todo(&b).unwrap();

        let filter =
            TodoFilter { status: Some(TodoStatus::Pending), ..TodoFilter::default() };
        let got = db.query_todos(&filter).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].cleaned, "tagged pending");

        let filter = TodoFilter { tags: vec!["work".to_string()], ..TodoFilter::default() };
        assert_eq!(db.query_todos(&filter).unwrap().len(), 1);

        let filter =
            TodoFilter { exclude_tags: vec!["work".to_string()], ..TodoFilter::default() };
        let got = db.query_todos(&filter).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].cleaned, "plain done");
    }

    #[test]
    fn test_query_excludes_notodo_notes_by_default() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();

        db.upsert_note(&note("hidden.md", "---\nnotodo: true\n---\n- [ ] x\n")).unwrap();
        let t = todo("hidden.md", "x", TodoStatus::Pending);
        db.upsert_todo(&t).unwrap();

        assert!(db.query_todos(&TodoFilter::default()).unwrap().is_empty());

        let include =
            TodoFilter { include_excluded_notes: true, ..TodoFilter::default() };
        assert_eq!(db.query_todos(&include).unwrap().len(), 1);
    }

    #[test]
    fn test_parents_only_filter() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();

        let parent = todo("a.md", "parent", TodoStatus::Pending);
        let mut child = todo("a.md", "child", TodoStatus::Pending);
        child.parent_id = Some(parent.id.clone());
        db.upsert_todo(&parent).unwrap();
        db.upsert_todo(&child).unwrap();

        let filter = TodoFilter { parents_only: true, ..TodoFilter::default() };
        let got = db.query_todos(&filter).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].cleaned, "parent");
    }

    #[test]
    fn test_sort_buckets() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let due = |days: i64| {
            Some(Due { date: today + chrono::Duration::days(days), time: None })
        };

        let mut overdue = todo("a.md", "overdue", TodoStatus::Pending);
        overdue.due = due(-1);
        let in_progress = {
            let mut t = todo("a.md", "in progress", TodoStatus::InProgress);
            t.status = TodoStatus::InProgress;
            t
        };
        let mut today_t = todo("a.md", "today", TodoStatus::Pending);
        today_t.due = due(0);
        let mut week = todo("a.md", "this week", TodoStatus::Pending);
        week.due = due(3);
        let mut later = todo("a.md", "later", TodoStatus::Pending);
        later.due = due(20);
        let none = todo("a.md", "no date", TodoStatus::Pending);

        // Insert out of order.
        for t in [&none, &later, &today_t, &overdue, &week, &in_progress] {
            db.upsert_todo(t).unwrap();
        }

        let sorted = db.sorted_todos_at(&TodoFilter::default(), today).unwrap();
        let order: Vec<&str> = sorted.iter().map(|t| t.cleaned.as_str()).collect();
        assert_eq!(
            order,
            vec!["overdue", "in progress", "today", "this week", "later", "no date"]
        );
    }

    #[test]
    fn test_sort_priority_tiebreak_within_bucket() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();

        let mut low = todo("a.md", "low", TodoStatus::Pending);
        low.due = Some(Due { date: today, time: None });
        low.priority = Some(Priority::Low);
        low.line = 1;
        let mut high = todo("a.md", "high", TodoStatus::Pending);
        high.due = Some(Due { date: today, time: None });
        high.priority = Some(Priority::High);
        high.line = 2;

        db.upsert_todo(&low).unwrap();
        db.upsert_todo(&high).unwrap();

        let sorted = db.sorted_todos_at(&TodoFilter::default(), today).unwrap();
        assert_eq!(sorted[0].cleaned, "high");
        assert_eq!(sorted[1].cleaned, "low");
    }

    #[test]
    fn test_overdue_filter() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();

        let mut past_open = todo("a.md", "past open", TodoStatus::Pending);
        past_open.due = Some(Due { date: today - chrono::Duration::days(2), time: None });
        let mut past_done = todo("a.md", "past done", TodoStatus::Completed);
        past_done.due = Some(Due { date: today - chrono::Duration::days(2), time: None });
        db.upsert_todo(&past_open).unwrap();
        db.upsert_todo(&past_done).unwrap();

        let filter = TodoFilter { overdue_only: true, ..TodoFilter::default() };
        let got = db.query_todos_at(&filter, today).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].cleaned, "past open");
    }

    #[test]
    fn test_linked_file_registry() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();

        let linked = LinkedFile {
            alias: "refs".to_string(),
            path: "/ext/refs".to_string(),
            recursive: true,
            sync: false,
            exclude_todos: false,
        };
        db.add_linked_file(&linked).unwrap();

        let err = db.add_linked_file(&linked).unwrap_err();
        assert!(matches!(err, NotedownError::AliasExists { .. }));

        assert_eq!(db.list_linked_files().unwrap(), vec![linked.clone()]);
        assert!(db.remove_linked_file("refs").unwrap());
        assert!(!db.remove_linked_file("refs").unwrap());
    }

    #[test]
    fn test_remove_deleted_notes() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();

        // One note whose file exists, one whose file does not.
        std::fs::write(dir.path().join("keep.md"), "kept").unwrap();
        db.upsert_note(&note("keep.md", "kept")).unwrap();
        db.upsert_note(&note("gone.md", "gone")).unwrap();
        db.upsert_todo(&todo("gone.md", "orphan", TodoStatus::Pending)).unwrap();

        let removed = db.remove_deleted_notes().unwrap();
        assert_eq!(removed, vec!["gone.md"]);
        assert!(db.get_note("gone.md").unwrap().is_none());
        assert!(db.get_note("keep.md").unwrap().is_some());
        assert!(db.query_todos(&TodoFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_rebuild_drops_and_recreates() {
        let dir = tempdir().unwrap();
        let mut db = Database::open_in_root(dir.path()).unwrap();
        db.upsert_note(&note("a.md", "content")).unwrap();

        db.rebuild().unwrap();
        assert!(db.get_note("a.md").unwrap().is_none());
        assert_eq!(db.stored_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_due_time_round_trip() {
        let dir = tempdir().unwrap();
        let db = Database::open_in_root(dir.path()).unwrap();

        let mut t = todo("a.md", "timed", TodoStatus::Pending);
        t.due = Some(Due {
            date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            time: NaiveTime::from_hms_opt(14, 30, 0),
        });
        db.upsert_todo(&t).unwrap();

        let stored = db.get_todo(&t.id).unwrap().unwrap();
        assert_eq!(stored.due, t.due);
    }
}
