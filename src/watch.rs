//! Watch mode for incremental rebuilds on file changes
//!
//! Runs one full build, then watches the source root with debouncing. Each
//! batch of coalesced events is reconciled with the asset tree (add, change or
//! remove) and, when anything actually changed, the pipeline runs again. The
//! engine keeps its tree and cache between runs, so only dirty entries are
//! re-transformed.

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEventKind, Debouncer};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::build::{PipelineEngine, RunResult, TreeChange};
use crate::config::schema::WatchConfig;

/// How often the watcher thread checks the stop flag while idle.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Error during watch mode
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WatchError {
    /// Failed to initialize file watcher
    #[error("Failed to initialize file watcher: {0}")]
    WatcherInit(#[source] notify::Error),
    /// Failed to add watch path
    #[error("Failed to watch path: {0}")]
    WatchPath(#[source] notify::Error),
    /// Channel receive error
    #[error("Watch channel error: {0}")]
    ChannelError(String),
    /// Source directory not found
    #[error("Source directory not found: {}", .0.display())]
    SourceNotFound(PathBuf),
}

/// A running watcher.
///
/// Dropping the handle stops watching; [`WatchHandle::stop`] does the same
/// and hands the engine back.
pub struct WatchHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<PipelineEngine>>,
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl WatchHandle {
    /// Stop watching and return the engine.
    ///
    /// A run that is in progress completes first.
    pub fn stop(mut self) -> Result<PipelineEngine, WatchError> {
        self.stop.store(true, Ordering::SeqCst);
        self.join()
    }

    /// Block until the watcher thread exits.
    pub fn wait(mut self) -> Result<PipelineEngine, WatchError> {
        self.join()
    }

    fn join(&mut self) -> Result<PipelineEngine, WatchError> {
        let thread = self
            .thread
            .take()
            .ok_or_else(|| WatchError::ChannelError("watcher already stopped".to_string()))?;
        thread.join().map_err(|_| WatchError::ChannelError("watcher thread panicked".to_string()))
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Clear terminal screen
fn clear_screen() {
    // ANSI escape code to clear screen and move cursor to top-left
    print!("\x1B[2J\x1B[1;1H");
}

/// Format duration for display
fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        format!("{}ms", millis)
    } else {
        format!("{:.2}s", duration.as_secs_f64())
    }
}

/// Get current timestamp for logging
fn timestamp() -> String {
    use std::time::SystemTime;
    let now = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
    let secs = now.as_secs() % 86400;
    let hours = (secs / 3600) % 24;
    let minutes = (secs / 60) % 60;
    let seconds = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

fn describe(change: &TreeChange) -> String {
    match change {
        TreeChange::Added(path) => format!("Added: {}", path.display()),
        TreeChange::Changed(path) => format!("Changed: {}", path.display()),
        TreeChange::Removed(path) => format!("Removed: {}", path.display()),
    }
}

/// Print run result to console
fn print_run_result(result: &RunResult) {
    if result.is_clean() {
        println!(
            "[{}] Build complete ({}) - Transformed: {} | Cached: {} | Written: {} | Deleted: {}",
            timestamp(),
            format_duration(result.duration),
            result.transformed,
            result.cached,
            result.written.len(),
            result.deleted.len()
        );
    } else {
        let count = result.failures.len();
        println!(
            "[{}] Build finished with {} failure{} ({})",
            timestamp(),
            count,
            if count == 1 { "" } else { "s" },
            format_duration(result.duration)
        );
        for failure in &result.failures {
            eprintln!("[{}] Error: {}", timestamp(), failure);
        }
    }
}

/// Run the pipeline once. Errors are reported; they never stop the watcher.
fn rebuild(engine: &mut PipelineEngine, first: bool) {
    println!("[{}] Building...", timestamp());
    let outcome = if first { engine.build() } else { engine.run() };
    match outcome {
        Ok(result) => print_run_result(&result),
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("[{}] Build failed: {}", timestamp(), e);
        }
    }
}

/// Map an event path onto the engine's source root.
///
/// Some platforms report canonical paths, which differ from the configured
/// root when it goes through a symlink.
fn source_path(event_path: &Path, source_root: &Path, canonical_root: Option<&Path>) -> PathBuf {
    if event_path.starts_with(source_root) {
        return event_path.to_path_buf();
    }
    match canonical_root.and_then(|root| event_path.strip_prefix(root).ok()) {
        Some(relative) => source_root.join(relative),
        None => event_path.to_path_buf(),
    }
}

fn watch_loop(
    mut engine: PipelineEngine,
    rx: Receiver<DebounceEventResult>,
    stop: Arc<AtomicBool>,
    config: WatchConfig,
) -> PipelineEngine {
    let source_root = engine.context().source_root().to_path_buf();
    let canonical_root = source_root.canonicalize().ok();

    while !stop.load(Ordering::SeqCst) {
        match rx.recv_timeout(STOP_POLL_INTERVAL) {
            Ok(Ok(events)) => {
                let paths: Vec<PathBuf> = events
                    .into_iter()
                    .filter(|e| matches!(e.kind, DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous))
                    .map(|e| source_path(&e.path, &source_root, canonical_root.as_deref()))
                    .collect();
                if paths.is_empty() {
                    continue;
                }

                let changes = engine.apply_changes(&paths);
                if changes.is_empty() {
                    debug!(events = paths.len(), "no effective change");
                    continue;
                }

                if config.clear_screen {
                    clear_screen();
                }
                for change in &changes {
                    println!("[{}] {}", timestamp(), describe(change));
                }
                rebuild(&mut engine, false);
                println!("[{}] Watching {} for changes...", timestamp(), source_root.display());
            }
            Ok(Err(error)) => {
                // Non-fatal, keep watching
                warn!(error = ?error, "watch error");
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                error!("watch channel disconnected");
                break;
            }
        }
    }
    engine
}

/// Build once, then rebuild on every change below the engine's source root.
///
/// Returns after the initial build with a handle to the background watcher.
pub fn watch(mut engine: PipelineEngine, config: &WatchConfig) -> Result<WatchHandle, WatchError> {
    let source_root = engine.context().source_root().to_path_buf();
    if !source_root.is_dir() {
        return Err(WatchError::SourceNotFound(source_root));
    }

    let (tx, rx) = channel();
    let mut debouncer = new_debouncer(Duration::from_millis(u64::from(config.debounce_ms)), tx)
        .map_err(WatchError::WatcherInit)?;
    debouncer
        .watcher()
        .watch(&source_root, RecursiveMode::Recursive)
        .map_err(WatchError::WatchPath)?;

    if config.clear_screen {
        clear_screen();
    }
    rebuild(&mut engine, true);
    println!("[{}] Watching {} for changes...", timestamp(), source_root.display());

    let stop = Arc::new(AtomicBool::new(false));
    let thread = {
        let stop = Arc::clone(&stop);
        let config = config.clone();
        thread::Builder::new()
            .name("assetpipe-watch".to_string())
            .spawn(move || watch_loop(engine, rx, stop, config))
            .map_err(|e| WatchError::ChannelError(format!("failed to spawn watcher thread: {}", e)))?
    };

    Ok(WatchHandle { stop, thread: Some(thread), _debouncer: debouncer })
}

/// Watch until the process is terminated.
pub fn watch_and_rebuild(engine: PipelineEngine, config: &WatchConfig) -> Result<(), WatchError> {
    watch(engine, config)?.wait().map(|_| ())
}
