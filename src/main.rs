//! notedown CLI entrypoint.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use notedown::cli::{expand_tilde, Cli, Commands, DaemonCommands, LinkCommands, OutputFormat};
use notedown::daemon::{self, DaemonConfig};
use notedown::db::{Database, LinkedFile, TodoFilter};
use notedown::error::{ExitCode, NotedownError, Result};
use notedown::scanner::{Scanner, ScannerConfig};
use notedown::search::{FtsIndex, SearchIndex};
use notedown::todo::{Todo, TodoStatus};
use notedown::{dates, writeback};

fn main() -> process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = resolve_root(cli.root.as_deref());

    match run(&root, cli.command) {
        Ok(()) => ExitCode::Ok.into(),
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code().into()
        }
    }
}

fn resolve_root(arg: Option<&Path>) -> PathBuf {
    arg.map_or_else(
        || std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        expand_tilde,
    )
}

fn run(root: &Path, command: Commands) -> Result<()> {
    match command {
        Commands::Index { force, notebook, jobs, prune } => {
            run_index(root, force, notebook, jobs, prune)
        }
        Commands::Todos {
            status,
            overdue,
            priority,
            notebooks,
            exclude_notebooks,
            tags,
            exclude_tags,
            sources,
            section,
            due_before,
            due_after,
            parents_only,
            all,
            format,
        } => {
            let filter = TodoFilter {
                status: status.map(Into::into),
                overdue_only: overdue,
                priority: priority.and_then(notedown::todo::Priority::from_level),
                notebooks,
                exclude_notebooks,
                tags: lowercase_all(tags),
                exclude_tags: lowercase_all(exclude_tags),
                source_paths: sources,
                section_contains: section,
                due_before: parse_date_arg("due-before", due_before)?,
                due_after: parse_date_arg("due-after", due_after)?,
                parents_only,
                include_excluded_notes: all,
                ..TodoFilter::default()
            };
            run_todos(root, &filter, format)
        }
        Commands::Done { id } => run_set_status(root, &id, TodoStatus::Completed),
        Commands::Undone { id } => run_set_status(root, &id, TodoStatus::Pending),
        Commands::Start { id } => run_set_status(root, &id, TodoStatus::InProgress),
        Commands::Link(link) => run_link(root, link),
        Commands::Daemon(cmd) => run_daemon(root, cmd),
        Commands::Rebuild => run_rebuild(root),
        Commands::Search { query, limit, format } => {
            run_search(root, &query, usize::from(limit), format)
        }
    }
}

fn lowercase_all(tags: Vec<String>) -> Vec<String> {
    tags.into_iter().map(|t| t.trim_start_matches('#').to_lowercase()).collect()
}

fn parse_date_arg(
    field: &str,
    arg: Option<String>,
) -> Result<Option<chrono::NaiveDate>> {
    let Some(expr) = arg else { return Ok(None) };
    dates::parse_expr(&expr).map(|due| Some(due.date)).ok_or_else(|| {
        NotedownError::ConfigInvalid {
            field: field.to_string(),
            value: expr,
            reason: "unrecognized date expression".to_string(),
        }
    })
}

fn run_index(
    root: &Path,
    force: bool,
    notebook: Option<String>,
    jobs: u8,
    prune: bool,
) -> Result<()> {
    let db = Database::open_in_root(root)?;
    let mut search = FtsIndex::open_in_root(root)?;
    let config = ScannerConfig { jobs: usize::from(jobs), notebook };
    let scanner = Scanner::new(root, config);

    let stats = scanner.index_all_stats(&db, &mut search, force)?;
    let removed = if prune { scanner.remove_deleted_notes(&db, &mut search)? } else { 0 };

    // Partial success is reported as counts, not an error.
    println!(
        "Indexed {} file(s), skipped {}, failed {}, removed {}",
        stats.indexed, stats.skipped, stats.failed, removed
    );
    Ok(())
}

/// Refresh the index before a read unless a live daemon is keeping it
/// current.
fn ensure_fresh(root: &Path, db: &Database) -> Result<()> {
    if daemon::is_daemon_running(root)?.is_some() {
        tracing::debug!("Daemon running; trusting index freshness");
        return Ok(());
    }
    let scanner = Scanner::new(root, ScannerConfig::default());
    let mut search = FtsIndex::open_in_root(root)?;
    scanner.index_all(db, &mut search, false)?;
    scanner.remove_deleted_notes(db, &mut search)?;
    Ok(())
}

fn run_todos(root: &Path, filter: &TodoFilter, format: OutputFormat) -> Result<()> {
    let db = Database::open_in_root(root)?;
    ensure_fresh(root, &db)?;

    let todos = db.sorted_todos(filter)?;
    match format {
        OutputFormat::Json => {
            let docs: Vec<serde_json::Value> = todos.iter().map(todo_json).collect();
            println!("{}", serde_json::to_string_pretty(&docs)?);
        }
        OutputFormat::Text => {
            if todos.is_empty() {
                println!("No todos match.");
            }
            for todo in &todos {
                println!("{}", format_todo(todo));
            }
        }
    }
    Ok(())
}

fn todo_json(todo: &Todo) -> serde_json::Value {
    serde_json::json!({
        "id": todo.id,
        "content": todo.cleaned,
        "status": todo.status.as_str(),
        "source": todo.source.path,
        "line": todo.line,
        "due": todo.due.map(|d| d.datetime().to_string()),
        "priority": todo.priority.map(notedown::todo::Priority::level),
        "tags": todo.tags,
        "section": todo.section,
        "parent": todo.parent_id,
        "created": todo.created_date.map(|d| d.to_string()),
        "completed": todo.completed_date.map(|d| d.to_string()),
    })
}

fn format_todo(todo: &Todo) -> String {
    let mut line = format!("[{}] {}  ({})", todo.status.marker(), todo.cleaned, todo.id);
    if let Some(due) = todo.due {
        line.push_str(&format!(" due {}", due.date));
    }
    if let Some(priority) = todo.priority {
        line.push_str(&format!(" p{}", priority.level()));
    }
    for tag in &todo.tags {
        line.push_str(&format!(" #{tag}"));
    }
    line.push_str(&format!("  {}:{}", todo.source.path, todo.line));
    line
}

fn run_set_status(root: &Path, id: &str, status: TodoStatus) -> Result<()> {
    let db = Database::open_in_root(root)?;
    ensure_fresh(root, &db)?;

    let scanner = Scanner::new(root, ScannerConfig::default());
    let mut search = FtsIndex::open_in_root(root)?;
    writeback::set_todo_status(&db, &scanner, &mut search, id, status)?;
    println!("{id} -> {}", status.as_str());
    Ok(())
}

fn run_link(root: &Path, command: LinkCommands) -> Result<()> {
    let db = Database::open_in_root(root)?;
    match command {
        LinkCommands::Add { alias, path, recursive, sync, notodo } => {
            let target = expand_tilde(&path);
            if !target.exists() {
                return Err(NotedownError::ConfigInvalid {
                    field: "path".to_string(),
                    value: path.display().to_string(),
                    reason: "target does not exist".to_string(),
                });
            }
            db.add_linked_file(&LinkedFile {
                alias: alias.clone(),
                path: target.to_string_lossy().to_string(),
                recursive,
                sync,
                exclude_todos: notodo,
            })?;
            println!("Linked @{alias} -> {}", target.display());
        }
        LinkCommands::Remove { alias } => {
            if db.remove_linked_file(&alias)? {
                println!("Removed @{alias}");
            } else {
                println!("No registration named @{alias}");
            }
        }
        LinkCommands::List => {
            let links = db.list_linked_files()?;
            if links.is_empty() {
                println!("No linked files.");
            }
            for linked in links {
                println!(
                    "@{}  {}  recursive={} sync={} notodo={}",
                    linked.alias, linked.path, linked.recursive, linked.sync, linked.exclude_todos
                );
            }
        }
    }
    Ok(())
}

fn run_daemon(root: &Path, command: DaemonCommands) -> Result<()> {
    match command {
        DaemonCommands::Start { foreground, debounce, no_search } => {
            let config = DaemonConfig {
                debounce: Duration::from_secs(u64::from(debounce)),
                foreground,
                search: !no_search,
                ..DaemonConfig::default()
            };
            daemon::start(root, &config)
        }
        DaemonCommands::Stop => {
            if daemon::stop(root)? {
                println!("Daemon stopped.");
            } else {
                println!("Daemon is not running.");
            }
            Ok(())
        }
        DaemonCommands::Status => {
            match daemon::status(root)? {
                Some(state) => {
                    println!("Daemon running (pid {})", state.pid);
                    println!("  started:       {}", state.started_at);
                    println!("  files indexed: {}", state.files_indexed);
                    println!("  files removed: {}", state.files_removed);
                    println!("  errors:        {}", state.errors);
                    println!("  last activity: {}", state.last_activity);
                }
                None => println!("Daemon is not running."),
            }
            Ok(())
        }
        DaemonCommands::Log { lines } => {
            let path = daemon::log_path(root);
            let contents = std::fs::read_to_string(&path).unwrap_or_default();
            let all: Vec<&str> = contents.lines().collect();
            let start = all.len().saturating_sub(lines);
            for line in &all[start..] {
                println!("{line}");
            }
            Ok(())
        }
    }
}

fn run_rebuild(root: &Path) -> Result<()> {
    let mut db = Database::open_in_root(root)?;
    db.rebuild()?;
    // Recreate the search table dropped with the rest of the schema.
    let mut search = FtsIndex::open_in_root(root)?;
    search.clear()?;

    let scanner = Scanner::new(root, ScannerConfig::default());
    let count = scanner.index_all(&db, &mut search, true)?;
    println!("Rebuilt index: {count} file(s).");
    Ok(())
}

fn run_search(root: &Path, query: &str, limit: usize, format: OutputFormat) -> Result<()> {
    let db = Database::open_in_root(root)?;
    ensure_fresh(root, &db)?;

    let search = FtsIndex::open_in_root(root)?;
    let hits = search.query(query, limit)?;
    match format {
        OutputFormat::Json => {
            let docs: Vec<serde_json::Value> = hits
                .iter()
                .map(|hit| {
                    serde_json::json!({
                        "id": hit.id,
                        "path": hit.meta,
                        "excerpt": hit.excerpt,
                        "score": hit.score,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&docs)?);
        }
        OutputFormat::Text => {
            if hits.is_empty() {
                println!("No matches.");
            }
            for hit in &hits {
                println!("{}\n    {}", hit.meta, hit.excerpt.replace('\n', " "));
            }
        }
    }
    Ok(())
}
