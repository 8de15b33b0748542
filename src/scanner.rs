//! Scanner/indexer orchestration.
//!
//! Enumerate markdown files under the notes root plus every registered
//! linked file or directory, filter through the change detector, parse
//! notes and todos, and reconcile into the store. A failure on one file
//! never aborts the batch.
//!
//! Sequential passes process files in sorted-path order. Batches at or
//! above [`PARALLEL_THRESHOLD`] may fan out over a bounded worker pool,
//! each worker holding its own database connection; the shared search
//! handle is serialized behind a mutex.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ignore::WalkBuilder;

use crate::changes::needs_reindex;
use crate::db::{Database, LinkedFile};
use crate::error::Result;
use crate::ident::{normalize_path, note_id};
use crate::note::{frontmatter_tags, parse_note};
use crate::search::SearchIndex;
use crate::todo::{parse_todos, TodoSource, TodoStatus};
use crate::META_DIR;

/// Batches smaller than this always run sequentially.
pub const PARALLEL_THRESHOLD: usize = 50;

/// Tuning for an indexing pass.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Worker count for large batches. 1 disables parallelism.
    pub jobs: usize,
    /// Restrict the pass to one notebook (first path segment, or `@alias`).
    pub notebook: Option<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self { jobs: 1, notebook: None }
    }
}

/// Outcome counters for an indexing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Files parsed and reconciled.
    pub indexed: usize,
    /// Files skipped as fresh by the change detector.
    pub skipped: usize,
    /// Files that failed to index (logged, not fatal).
    pub failed: usize,
}

/// One file queued for reconciliation.
#[derive(Debug, Clone)]
struct Candidate {
    /// Store key: root-relative for internal notes, normalized absolute
    /// for linked content.
    key: String,
    abs: PathBuf,
    external: bool,
    alias: Option<String>,
    /// Linked registration's todo-exclusion flag.
    exclude_todos: bool,
}

/// Drives indexing passes over one notes root.
pub struct Scanner {
    root: PathBuf,
    config: ScannerConfig,
}

impl Scanner {
    #[must_use]
    pub fn new(root: &Path, config: ScannerConfig) -> Self {
        Self { root: root.to_path_buf(), config }
    }

    /// Index every stale markdown file under the root and all linked
    /// registrations. Returns the number of files reconciled.
    ///
    /// # Errors
    /// Returns an error only for pass-level failures (enumeration, store
    /// access); per-file failures are logged and counted.
    pub fn index_all(
        &self,
        db: &Database,
        search: &mut dyn SearchIndex,
        force: bool,
    ) -> Result<usize> {
        Ok(self.index_all_stats(db, search, force)?.indexed)
    }

    /// Like [`Self::index_all`], returning full counters.
    pub fn index_all_stats(
        &self,
        db: &Database,
        search: &mut dyn SearchIndex,
        force: bool,
    ) -> Result<IndexStats> {
        let mut candidates = self.enumerate(db)?;
        candidates.sort_by(|a, b| a.key.cmp(&b.key));

        let mut stats = IndexStats::default();
        let mut stale = Vec::new();
        for candidate in candidates {
            if force || needs_reindex(db, &candidate.key, &candidate.abs)? {
                stale.push(candidate);
            } else {
                stats.skipped += 1;
            }
        }

        tracing::info!(
            stale = stale.len(),
            skipped = stats.skipped,
            force,
            "Starting indexing pass"
        );

        if self.config.jobs > 1 && stale.len() >= PARALLEL_THRESHOLD {
            let (indexed, failed) = self.index_parallel(&stale, search)?;
            stats.indexed = indexed;
            stats.failed = failed;
        } else {
            for candidate in &stale {
                match process_candidate(db, search, candidate) {
                    Ok(true) => stats.indexed += 1,
                    Ok(false) => stats.skipped += 1,
                    Err(e) => {
                        stats.failed += 1;
                        tracing::warn!(path = %candidate.key, error = %e, "Failed to index file");
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Fan a large batch out over a bounded worker pool. Each worker opens
    /// its own database connection; the search handle is mutex-guarded.
    fn index_parallel(
        &self,
        stale: &[Candidate],
        search: &mut dyn SearchIndex,
    ) -> Result<(usize, usize)> {
        let jobs = self.config.jobs.min(stale.len());
        let search = Mutex::new(search);
        let indexed = std::sync::atomic::AtomicUsize::new(0);
        let failed = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for chunk in stale.chunks(stale.len().div_ceil(jobs)) {
                let search = &search;
                let indexed = &indexed;
                let failed = &failed;
                let root = self.root.clone();
                scope.spawn(move || {
                    let db = match Database::open_in_root(&root) {
                        Ok(db) => db,
                        Err(e) => {
                            tracing::error!(error = %e, "Worker failed to open database");
                            failed.fetch_add(chunk.len(), std::sync::atomic::Ordering::Relaxed);
                            return;
                        }
                    };
                    for candidate in chunk {
                        match process_candidate_locked(&db, search, candidate) {
                            Ok(true) => {
                                indexed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            }
                            Ok(false) => {}
                            Err(e) => {
                                failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                                tracing::warn!(path = %candidate.key, error = %e, "Failed to index file");
                            }
                        }
                    }
                });
            }
        });

        Ok((
            indexed.load(std::sync::atomic::Ordering::Relaxed),
            failed.load(std::sync::atomic::Ordering::Relaxed),
        ))
    }

    /// Reconcile exactly one file, used by on-demand re-index and the
    /// daemon's debounced drain.
    ///
    /// A path outside the root that matches no linked registration is
    /// skipped with a warning.
    pub fn index_single(
        &self,
        db: &Database,
        search: &mut dyn SearchIndex,
        path: &Path,
    ) -> Result<()> {
        let Some(candidate) = self.resolve(db, path)? else {
            tracing::warn!(path = %path.display(), "Path is not under the notes root or any linked registration");
            return Ok(());
        };
        process_candidate(db, search, &candidate)?;
        Ok(())
    }

    /// Drop store rows for internal notes whose files vanished, evicting
    /// each removed note from the search index. Returns count removed.
    pub fn remove_deleted_notes(
        &self,
        db: &Database,
        search: &mut dyn SearchIndex,
    ) -> Result<usize> {
        let removed = db.remove_deleted_notes()?;
        for path in &removed {
            if let Err(e) = search.delete(&note_id(path)) {
                tracing::warn!(path = %path, error = %e, "Failed to evict note from search index");
            }
        }
        Ok(removed.len())
    }

    /// Re-submit every stored note body to the search index from scratch.
    pub fn rebuild_search_index(
        &self,
        db: &Database,
        search: &mut dyn SearchIndex,
    ) -> Result<usize> {
        search.clear()?;
        let notes = db.all_note_contents()?;
        let count = notes.len();
        for (path, content) in notes {
            search.upsert(&note_id(&path), &content, &path)?;
        }
        tracing::info!(count, "Rebuilt search index");
        Ok(count)
    }

    /// All candidate files: internal tree plus linked registrations.
    fn enumerate(&self, db: &Database) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();

        for entry in markdown_walk(&self.root).build() {
            let entry = entry?;
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            if !is_markdown(path) {
                continue;
            }
            let Ok(rel) = path.strip_prefix(&self.root) else { continue };
            let key = normalize_path(&rel.to_string_lossy());
            if key.starts_with(META_DIR) {
                continue;
            }
            candidates.push(Candidate {
                key,
                abs: path.to_path_buf(),
                external: false,
                alias: None,
                exclude_todos: false,
            });
        }

        for linked in db.list_linked_files()? {
            self.enumerate_linked(&linked, &mut candidates);
        }

        if let Some(notebook) = &self.config.notebook {
            candidates.retain(|c| {
                let nb = match &c.alias {
                    Some(alias) => format!("@{alias}"),
                    None => c.key.split('/').next().unwrap_or(&c.key).to_string(),
                };
                &nb == notebook
            });
        }

        Ok(candidates)
    }

    fn enumerate_linked(&self, linked: &LinkedFile, candidates: &mut Vec<Candidate>) {
        let target = PathBuf::from(&linked.path);
        if target.is_file() {
            candidates.push(linked_candidate(linked, &target));
            return;
        }
        if !target.is_dir() {
            tracing::warn!(alias = %linked.alias, path = %linked.path, "Linked target missing");
            return;
        }

        if linked.recursive {
            for entry in markdown_walk(&target).build().flatten() {
                let path = entry.path();
                if entry.file_type().is_some_and(|t| t.is_file()) && is_markdown(path) {
                    candidates.push(linked_candidate(linked, path));
                }
            }
        } else if let Ok(entries) = fs::read_dir(&target) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() && is_markdown(&path) {
                    candidates.push(linked_candidate(linked, &path));
                }
            }
        }
    }

    /// Map an absolute path back to a candidate: root-relative when under
    /// the root, else matched against linked registrations.
    fn resolve(&self, db: &Database, path: &Path) -> Result<Option<Candidate>> {
        if let Ok(rel) = path.strip_prefix(&self.root) {
            let key = normalize_path(&rel.to_string_lossy());
            if key.starts_with(META_DIR) {
                return Ok(None);
            }
            return Ok(Some(Candidate {
                key,
                abs: path.to_path_buf(),
                external: false,
                alias: None,
                exclude_todos: false,
            }));
        }

        let normalized = normalize_path(&path.to_string_lossy());
        for linked in db.list_linked_files()? {
            let prefix = normalize_path(&linked.path);
            if normalized == prefix || normalized.starts_with(&format!("{prefix}/")) {
                return Ok(Some(linked_candidate(&linked, path)));
            }
        }
        Ok(None)
    }
}

fn linked_candidate(linked: &LinkedFile, path: &Path) -> Candidate {
    Candidate {
        key: normalize_path(&path.to_string_lossy()),
        abs: path.to_path_buf(),
        external: true,
        alias: Some(linked.alias.clone()),
        exclude_todos: linked.exclude_todos,
    }
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("markdown"))
}

/// Walk skipping hidden entries; version-control ignore files do not apply
/// to a notes tree.
fn markdown_walk(root: &Path) -> WalkBuilder {
    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(true)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .follow_links(false);
    builder
}

/// Parse one candidate and commit its rows. Returns the note content for
/// the subsequent search push, or `None` when the note parser dropped the
/// file (unreadable or non-UTF-8).
fn reconcile(db: &Database, candidate: &Candidate) -> Result<Option<String>> {
    let Some(mut note) =
        parse_note(&candidate.key, &candidate.abs, candidate.external, candidate.alias.as_deref())?
    else {
        return Ok(None);
    };
    if candidate.exclude_todos {
        note.exclude_todos = true;
    }

    let source = match &candidate.alias {
        Some(alias) => TodoSource::linked(&candidate.key, alias),
        None => TodoSource::note(&candidate.key),
    };
    let inherited = frontmatter_tags(&note.content);
    let mut todos = parse_todos(&note.content, &source, &inherited);

    // Snapshot prior dates by id before the delete so the reinsert can
    // carry them forward.
    let history = db.todo_history_for_source(&candidate.key)?;
    for todo in &mut todos {
        if let Some(prior) = history.get(&todo.id) {
            todo.created_date = prior.created_date;
            if todo.status == TodoStatus::Completed && prior.was_completed {
                todo.completed_date = prior.completed_date;
            }
        }
    }

    // Relational rows commit before any search write so search failures
    // can never lose note/todo data.
    db.delete_todos_for_source(&candidate.key)?;
    db.upsert_note(&note)?;
    for todo in &todos {
        db.upsert_todo(todo)?;
    }

    tracing::debug!(path = %candidate.key, todos = todos.len(), "Indexed note");
    Ok(Some(note.content))
}

/// Reconcile one candidate and push it to the search index. Returns false
/// when the file was dropped by the note parser.
fn process_candidate(
    db: &Database,
    search: &mut dyn SearchIndex,
    candidate: &Candidate,
) -> Result<bool> {
    let Some(content) = reconcile(db, candidate)? else {
        return Ok(false);
    };
    if let Err(e) = search.upsert(&note_id(&candidate.key), &content, &candidate.key) {
        tracing::warn!(path = %candidate.key, error = %e, "Search index update failed");
    }
    Ok(true)
}

fn process_candidate_locked(
    db: &Database,
    search: &Mutex<&mut dyn SearchIndex>,
    candidate: &Candidate,
) -> Result<bool> {
    let Some(content) = reconcile(db, candidate)? else {
        return Ok(false);
    };
    if let Ok(mut guard) = search.lock() {
        if let Err(e) = guard.upsert(&note_id(&candidate.key), &content, &candidate.key) {
            tracing::warn!(path = %candidate.key, error = %e, "Search index update failed");
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TodoFilter;
    use crate::search::NullIndex;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_index_all_counts_and_skips_metadata_dir() {
        let dir = tempdir().unwrap();
        write(dir.path(), "work/a.md", "# A\n- [ ] one\n");
        write(dir.path(), "home/b.md", "# B\n");
        write(dir.path(), "notes.txt", "not markdown");

        let db = Database::open_in_root(dir.path()).unwrap();
        let scanner = Scanner::new(dir.path(), ScannerConfig::default());
        let count = scanner.index_all(&db, &mut NullIndex, false).unwrap();
        assert_eq!(count, 2);

        let todos = db.query_todos(&TodoFilter::default()).unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].source.path, "work/a.md");
    }

    #[test]
    fn test_incremental_pass_skips_fresh_files() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.md", "# A\n");

        let db = Database::open_in_root(dir.path()).unwrap();
        let scanner = Scanner::new(dir.path(), ScannerConfig::default());
        assert_eq!(scanner.index_all(&db, &mut NullIndex, false).unwrap(), 1);

        let stats = scanner.index_all_stats(&db, &mut NullIndex, false).unwrap();
        assert_eq!(stats.indexed, 0);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_force_reindexes_everything_idempotently() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.md", "# A\n- [ ] task\n");

        let db = Database::open_in_root(dir.path()).unwrap();
        let scanner = Scanner::new(dir.path(), ScannerConfig::default());

        scanner.index_all(&db, &mut NullIndex, true).unwrap();
        let first = db.query_todos(&TodoFilter::default()).unwrap();
        scanner.index_all(&db, &mut NullIndex, true).unwrap();
        let second = db.query_todos(&TodoFilter::default()).unwrap();

        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[0].cleaned, second[0].cleaned);
    }

    #[test]
    fn test_hidden_directories_skipped() {
        let dir = tempdir().unwrap();
        write(dir.path(), ".hidden/secret.md", "# Hidden\n");
        write(dir.path(), "visible.md", "# Visible\n");

        let db = Database::open_in_root(dir.path()).unwrap();
        let scanner = Scanner::new(dir.path(), ScannerConfig::default());
        assert_eq!(scanner.index_all(&db, &mut NullIndex, false).unwrap(), 1);
    }

    #[test]
    fn test_notebook_filter() {
        let dir = tempdir().unwrap();
        write(dir.path(), "work/a.md", "# A\n");
        write(dir.path(), "home/b.md", "# B\n");

        let db = Database::open_in_root(dir.path()).unwrap();
        let config = ScannerConfig { notebook: Some("work".to_string()), ..Default::default() };
        let scanner = Scanner::new(dir.path(), config);
        assert_eq!(scanner.index_all(&db, &mut NullIndex, false).unwrap(), 1);
        assert!(db.get_note("work/a.md").unwrap().is_some());
        assert!(db.get_note("home/b.md").unwrap().is_none());
    }

    #[test]
    fn test_linked_file_indexed_under_alias() {
        let notes = tempdir().unwrap();
        let external = tempdir().unwrap();
        write(external.path(), "list.md", "# External\n- [ ] ext task\n");

        let db = Database::open_in_root(notes.path()).unwrap();
        db.add_linked_file(&LinkedFile {
            alias: "refs".to_string(),
            path: external.path().join("list.md").to_string_lossy().to_string(),
            recursive: false,
            sync: true,
            exclude_todos: false,
        })
        .unwrap();

        let scanner = Scanner::new(notes.path(), ScannerConfig::default());
        assert_eq!(scanner.index_all(&db, &mut NullIndex, false).unwrap(), 1);

        let todos = db.query_todos(&TodoFilter::default()).unwrap();
        assert_eq!(todos.len(), 1);
        assert!(todos[0].source.external);
        assert_eq!(todos[0].source.alias.as_deref(), Some("refs"));
    }

    #[test]
    fn test_index_single_and_resolve_outside_root() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.md", "# A\n- [ ] one\n");

        let db = Database::open_in_root(dir.path()).unwrap();
        let scanner = Scanner::new(dir.path(), ScannerConfig::default());
        scanner.index_single(&db, &mut NullIndex, &dir.path().join("a.md")).unwrap();
        assert!(db.get_note("a.md").unwrap().is_some());

        // Unknown outside path is a warning-skip, not an error.
        scanner.index_single(&db, &mut NullIndex, Path::new("/nonexistent/b.md")).unwrap();
    }

    #[test]
    fn test_failure_on_one_file_does_not_abort_batch() {
        let dir = tempdir().unwrap();
        write(dir.path(), "good.md", "# Good\n");
        // Invalid UTF-8: dropped by the note parser, batch continues.
        fs::write(dir.path().join("bad.md"), [0xff, 0xfe, 0x00]).unwrap();

        let db = Database::open_in_root(dir.path()).unwrap();
        let scanner = Scanner::new(dir.path(), ScannerConfig::default());
        let stats = scanner.index_all_stats(&db, &mut NullIndex, false).unwrap();
        assert_eq!(stats.indexed, 1);
        assert!(db.get_note("good.md").unwrap().is_some());
    }

    #[test]
    fn test_remove_deleted_notes_via_scanner() {
        let dir = tempdir().unwrap();
        write(dir.path(), "keep.md", "# Keep\n");
        write(dir.path(), "gone.md", "# Gone\n- [ ] orphan\n");

        let db = Database::open_in_root(dir.path()).unwrap();
        let scanner = Scanner::new(dir.path(), ScannerConfig::default());
        scanner.index_all(&db, &mut NullIndex, false).unwrap();

        fs::remove_file(dir.path().join("gone.md")).unwrap();
        let removed = scanner.remove_deleted_notes(&db, &mut NullIndex).unwrap();
        assert_eq!(removed, 1);
        assert!(db.get_note("keep.md").unwrap().is_some());
        assert!(db.get_note("gone.md").unwrap().is_none());
        assert!(db.query_todos(&TodoFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_rebuild_search_index() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.md", "# Quarterly launch plan\n");

        let db = Database::open_in_root(dir.path()).unwrap();
        let scanner = Scanner::new(dir.path(), ScannerConfig::default());
        scanner.index_all(&db, &mut NullIndex, false).unwrap();

        let mut search = crate::search::FtsIndex::open_in_root(dir.path()).unwrap();
        let count = scanner.rebuild_search_index(&db, &mut search).unwrap();
        assert_eq!(count, 1);
        assert_eq!(crate::search::SearchIndex::query(&search, "launch", 5).unwrap().len(), 1);
    }

    #[test]
    fn test_parallel_pass_indexes_everything() {
        let dir = tempdir().unwrap();
        for i in 0..PARALLEL_THRESHOLD + 10 {
            write(dir.path(), &format!("bulk/note-{i:03}.md"), &format!("# Note {i}\n- [ ] task {i}\n"));
        }

        let db = Database::open_in_root(dir.path()).unwrap();
        let config = ScannerConfig { jobs: 4, ..Default::default() };
        let scanner = Scanner::new(dir.path(), config);
        let count = scanner.index_all(&db, &mut NullIndex, false).unwrap();
        assert_eq!(count, PARALLEL_THRESHOLD + 10);
        assert_eq!(
            db.query_todos(&TodoFilter::default()).unwrap().len(),
            PARALLEL_THRESHOLD + 10
        );
    }
}
