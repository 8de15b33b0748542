//! Background watch daemon.
//!
//! Watches the notes root and every linked registration for filesystem
//! changes, debounces event bursts per watched root, and drives the
//! scanner incrementally. Liveness is published through a PID file and a
//! JSON statistics file under the metadata directory; their absence means
//! "not running".
//!
//! Daemonization is platform-specific (double-fork on Unix, detached
//! process creation on Windows) but the event loop itself is not.

use chrono::Local;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::db::Database;
use crate::error::{NotedownError, Result};
use crate::scanner::{Scanner, ScannerConfig};
use crate::search::{FtsIndex, NullIndex, SearchIndex};
use crate::{LOG_NAME, META_DIR, PID_NAME, STATE_NAME};

/// Cooperative shutdown flag, set by the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Daemon tuning.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Quiet period before a buffer of pending paths is drained.
    pub debounce: Duration,
    /// Event-loop tick; also bounds shutdown latency.
    pub poll_interval: Duration,
    /// Stay attached to the terminal instead of daemonizing.
    pub foreground: bool,
    /// Maintain the FTS5 search index while watching.
    pub search: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            foreground: false,
            search: true,
        }
    }
}

/// Liveness/statistics record rewritten periodically by the running
/// daemon. Readers treat an absent file as "not running", not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    pub pid: u32,
    pub started_at: String,
    pub files_indexed: u64,
    pub files_removed: u64,
    pub errors: u64,
    pub last_activity: String,
}

#[must_use]
pub fn pid_path(root: &Path) -> PathBuf {
    root.join(META_DIR).join(PID_NAME)
}

#[must_use]
pub fn state_path(root: &Path) -> PathBuf {
    root.join(META_DIR).join(STATE_NAME)
}

#[must_use]
pub fn log_path(root: &Path) -> PathBuf {
    root.join(META_DIR).join(LOG_NAME)
}

/// Check whether a daemon is alive for this root.
///
/// Reads the PID file and verifies the process still exists. A dead
/// process's stale PID and liveness files are removed as a side effect.
pub fn is_daemon_running(root: &Path) -> Result<Option<u32>> {
    let pid_file = pid_path(root);
    let Ok(contents) = fs::read_to_string(&pid_file) else {
        return Ok(None);
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        let _ = fs::remove_file(&pid_file);
        return Ok(None);
    };
    if process_alive(pid) {
        return Ok(Some(pid));
    }
    tracing::debug!(pid, "Reaping stale daemon files");
    let _ = fs::remove_file(&pid_file);
    let _ = fs::remove_file(state_path(root));
    Ok(None)
}

/// Read the liveness file for a running daemon.
pub fn status(root: &Path) -> Result<Option<DaemonState>> {
    if is_daemon_running(root)?.is_none() {
        return Ok(None);
    }
    let Ok(contents) = fs::read_to_string(state_path(root)) else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Start the daemon for a notes root.
///
/// # Errors
/// Returns `DaemonAlreadyRunning` if a live daemon already holds the PID
/// file.
pub fn start(root: &Path, config: &DaemonConfig) -> Result<()> {
    if let Some(pid) = is_daemon_running(root)? {
        return Err(NotedownError::DaemonAlreadyRunning { pid });
    }
    fs::create_dir_all(root.join(META_DIR)).map_err(|e| NotedownError::Io { source: e })?;

    if !config.foreground {
        #[cfg(unix)]
        daemonize(&log_path(root))?;

        #[cfg(windows)]
        {
            spawn_detached(root, config)?;
            return Ok(());
        }
    }

    run_loop(root, config)
}

/// Signal the running daemon to stop. Returns false if none was running.
pub fn stop(root: &Path) -> Result<bool> {
    let Some(pid) = is_daemon_running(root)? else {
        return Ok(false);
    };
    terminate_process(pid)?;

    // Give the loop a moment to exit and clean up its files.
    for _ in 0..50 {
        if !pid_path(root).exists() {
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    // Unresponsive process: reap the files ourselves.
    let _ = fs::remove_file(pid_path(root));
    let _ = fs::remove_file(state_path(root));
    Ok(true)
}

/// The daemon event loop. Blocks until a shutdown signal arrives.
///
/// Per-file drain errors increment the error counter and never stop the
/// loop; watcher or store failures at this level are fatal.
pub fn run_loop(root: &Path, config: &DaemonConfig) -> Result<()> {
    install_signal_handlers();
    SHUTDOWN.store(false, Ordering::SeqCst);

    fs::write(pid_path(root), std::process::id().to_string())
        .map_err(|e| NotedownError::Io { source: e })?;

    let db = Database::open_in_root(root)?;
    let scanner = Scanner::new(root, ScannerConfig::default());
    let mut fts;
    let mut null = NullIndex;
    let search: &mut dyn SearchIndex = if config.search {
        fts = FtsIndex::open_in_root(root)?;
        &mut fts
    } else {
        &mut null
    };

    let mut state = DaemonState {
        pid: std::process::id(),
        started_at: Local::now().to_rfc3339(),
        files_indexed: 0,
        files_removed: 0,
        errors: 0,
        last_activity: Local::now().to_rfc3339(),
    };

    // Catch up before watching.
    match scanner.index_all_stats(&db, search, false) {
        Ok(stats) => {
            state.files_indexed += stats.indexed as u64;
            state.errors += stats.failed as u64;
        }
        Err(e) => {
            tracing::error!(error = %e, "Initial indexing pass failed");
            state.errors += 1;
        }
    }

    let (tx, rx) = mpsc::channel();
    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    })?;

    let mut watch_roots: Vec<PathBuf> = vec![root.to_path_buf()];
    watcher.watch(root, RecursiveMode::Recursive)?;
    for linked in db.list_linked_files()? {
        let target = PathBuf::from(&linked.path);
        if !target.exists() {
            tracing::warn!(alias = %linked.alias, "Skipping watch on missing linked target");
            continue;
        }
        let mode =
            if linked.recursive { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };
        watcher.watch(&target, mode)?;
        watch_roots.push(target);
    }

    write_state(root, &state);
    tracing::info!(pid = state.pid, roots = watch_roots.len(), "Daemon running");

    let mut buffers = DebounceBuffers::new(watch_roots);
    while !SHUTDOWN.load(Ordering::SeqCst) {
        // Block for one tick, then drain whatever else queued up.
        match rx.recv_timeout(config.poll_interval) {
            Ok(event) => buffers.record_event(root, event, Instant::now()),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                tracing::error!("Watcher channel closed; shutting down");
                break;
            }
        }
        for event in rx.try_iter() {
            buffers.record_event(root, event, Instant::now());
        }

        let pending = buffers.drain_quiet(config.debounce, Instant::now());
        if pending.is_empty() {
            write_state(root, &state);
            continue;
        }

        let mut removed_any = false;
        for path in pending {
            if path.exists() {
                match scanner.index_single(&db, search, &path) {
                    Ok(()) => state.files_indexed += 1,
                    Err(e) => {
                        state.errors += 1;
                        tracing::warn!(path = %path.display(), error = %e, "Re-index failed");
                    }
                }
            } else {
                removed_any = true;
            }
        }
        if removed_any {
            match scanner.remove_deleted_notes(&db, search) {
                Ok(count) => state.files_removed += count as u64,
                Err(e) => {
                    state.errors += 1;
                    tracing::warn!(error = %e, "Deleted-note cleanup failed");
                }
            }
        }
        state.last_activity = Local::now().to_rfc3339();
        write_state(root, &state);
    }

    tracing::info!("Daemon stopping");
    drop(watcher);
    let _ = fs::remove_file(pid_path(root));
    let _ = fs::remove_file(state_path(root));
    Ok(())
}

fn write_state(root: &Path, state: &DaemonState) {
    match serde_json::to_string_pretty(state) {
        Ok(json) => {
            if let Err(e) = fs::write(state_path(root), json) {
                tracing::warn!(error = %e, "Failed to write liveness file");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to serialize liveness state"),
    }
}

/// Per-watched-root pending path sets with last-event timestamps.
struct DebounceBuffers {
    roots: Vec<PathBuf>,
    pending: HashMap<PathBuf, (HashSet<PathBuf>, Instant)>,
}

impl DebounceBuffers {
    fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots, pending: HashMap::new() }
    }

    fn record_event(&mut self, notes_root: &Path, event: notify::Result<notify::Event>, now: Instant) {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Watcher error");
                return;
            }
        };
        for path in event.paths {
            self.record(notes_root, path, now);
        }
    }

    fn record(&mut self, notes_root: &Path, path: PathBuf, now: Instant) {
        // The store's own WAL churn must never feed back into the loop.
        if path.strip_prefix(notes_root).is_ok_and(|rel| rel.starts_with(META_DIR)) {
            return;
        }
        let is_md = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("markdown"));
        if !is_md {
            return;
        }

        let Some(watch_root) =
            self.roots.iter().find(|root| path.starts_with(root)).cloned()
        else {
            return;
        };
        let entry = self.pending.entry(watch_root).or_insert_with(|| (HashSet::new(), now));
        entry.0.insert(path);
        entry.1 = now;
    }

    /// Drain every buffer quiet for at least `debounce`.
    fn drain_quiet(&mut self, debounce: Duration, now: Instant) -> Vec<PathBuf> {
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, last))| now.duration_since(*last) >= debounce)
            .map(|(root, _)| root.clone())
            .collect();

        let mut paths = Vec::new();
        for root in ready {
            if let Some((set, _)) = self.pending.remove(&root) {
                paths.extend(set);
            }
        }
        paths.sort();
        paths
    }
}

// ----------------------------------------------------------------------
// Platform backends

#[cfg(unix)]
extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

#[cfg(windows)]
unsafe extern "system" fn handle_ctrl(_ctrl_type: u32) -> windows_sys::Win32::Foundation::BOOL {
    SHUTDOWN.store(true, Ordering::SeqCst);
    1
}

#[cfg(windows)]
fn install_signal_handlers() {
    unsafe {
        windows_sys::Win32::System::Console::SetConsoleCtrlHandler(Some(handle_ctrl), 1);
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // kill(0) probes existence; EPERM still means the process exists.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
fn process_alive(pid: u32) -> bool {
    use windows_sys::Win32::System::Threading::{
        OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
    if handle.is_null() {
        return false;
    }
    unsafe { windows_sys::Win32::Foundation::CloseHandle(handle) };
    true
}

#[cfg(unix)]
fn terminate_process(pid: u32) -> Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        return Err(NotedownError::Io { source: std::io::Error::last_os_error() });
    }
    Ok(())
}

#[cfg(windows)]
fn terminate_process(pid: u32) -> Result<()> {
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};
    let handle = unsafe { OpenProcess(PROCESS_TERMINATE, 0, pid) };
    if handle.is_null() {
        return Err(NotedownError::Io { source: std::io::Error::last_os_error() });
    }
    let rc = unsafe { TerminateProcess(handle, 0) };
    unsafe { windows_sys::Win32::Foundation::CloseHandle(handle) };
    if rc == 0 {
        return Err(NotedownError::Io { source: std::io::Error::last_os_error() });
    }
    Ok(())
}

/// Double-fork into the background, detaching from the controlling
/// terminal and routing stdout/stderr to the daemon log.
#[cfg(unix)]
fn daemonize(log: &Path) -> Result<()> {
    use std::os::fd::AsRawFd;

    let fork_once = || -> Result<()> {
        match unsafe { libc::fork() } {
            -1 => Err(NotedownError::Io { source: std::io::Error::last_os_error() }),
            0 => Ok(()),
            _ => std::process::exit(0),
        }
    };

    fork_once()?;
    if unsafe { libc::setsid() } == -1 {
        return Err(NotedownError::Io { source: std::io::Error::last_os_error() });
    }
    fork_once()?;

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .map_err(|e| NotedownError::Io { source: e })?;
    let devnull = fs::File::open("/dev/null").map_err(|e| NotedownError::Io { source: e })?;
    unsafe {
        libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO);
        libc::dup2(log_file.as_raw_fd(), libc::STDOUT_FILENO);
        libc::dup2(log_file.as_raw_fd(), libc::STDERR_FILENO);
    }
    Ok(())
}

/// Re-invoke the binary detached from the console, in foreground-loop
/// mode, and let the parent return immediately.
#[cfg(windows)]
fn spawn_detached(root: &Path, config: &DaemonConfig) -> Result<()> {
    use std::os::windows::process::CommandExt;

    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    let exe = std::env::current_exe().map_err(|e| NotedownError::Io { source: e })?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--root")
        .arg(root)
        .arg("daemon")
        .arg("start")
        .arg("--foreground")
        .arg("--debounce")
        .arg(config.debounce.as_secs().to_string());
    if !config.search {
        cmd.arg("--no-search");
    }
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(root))
        .map_err(|e| NotedownError::Io { source: e })?;
    cmd.stdin(std::process::Stdio::null())
        .stdout(log_file.try_clone().map_err(|e| NotedownError::Io { source: e })?)
        .stderr(log_file)
        .creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    cmd.spawn().map_err(|e| NotedownError::Io { source: e })?;
    Ok(())
}
