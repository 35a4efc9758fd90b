//! Source Tailers
//!
//! Concrete `TailerFactory` that follows log files and systemd journals.
//!
//! # Architecture
//!
//! ```text
//! SystemTailerFactory::start(id)
//!   ├── resolve + existence probe ──► SourceNotFound
//!   ├── read history (file or journalctl)
//!   └── spawn supervisor ──► FallbackChain
//!                              ├── process::follow (sudo journalctl / journalctl / tail -F)
//!                              └── file::FileWatch
//! ```
//!
//! The supervisor runs one strategy at a time and moves along the chain
//! only on permission failures. Its events flow to the broker over a
//! bounded channel that closes once the supervisor exits.

pub mod fallback;
pub mod file;
pub mod journal;
pub mod process;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{History, StartedTailer, TailerControl, TailerError, TailerFactory};
use crate::domain::source::{ResolvedSource, SourceId, SourceLayout};
use crate::domain::streaming::{StreamEnd, TailEvent, DEFAULT_HISTORY_LINES};
use crate::infrastructure::metrics;

pub use fallback::{FallbackChain, FallbackState, FollowStrategy};

const EVENT_BUFFER: usize = 256;

// =============================================================================
// Settings
// =============================================================================

/// Where log lines are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Per-instance log files under the log directory.
    #[default]
    File,
    /// systemd journal of the per-instance unit.
    Journal,
}

impl Backend {
    /// Parse backend from string; anything unrecognised is `File`.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "journal" | "journald" | "systemd" => Self::Journal,
            _ => Self::File,
        }
    }

    /// Get the backend name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Journal => "journal",
        }
    }
}

/// Tailer settings.
#[derive(Debug, Clone)]
pub struct TailerSettings {
    /// Log source backend.
    pub backend: Backend,
    /// Source naming layout.
    pub layout: SourceLayout,
    /// Try `sudo -n journalctl` before unprivileged `journalctl`.
    pub use_sudo: bool,
    /// History lines read at start.
    pub history_lines: usize,
    /// File watch poll interval, used when the log directory cannot be
    /// watched for changes.
    pub poll_interval: Duration,
    /// Bound on follower teardown and one-shot probes.
    pub stop_timeout: Duration,
}

impl Default for TailerSettings {
    fn default() -> Self {
        Self {
            backend: Backend::File,
            layout: SourceLayout::default(),
            use_sudo: false,
            history_lines: DEFAULT_HISTORY_LINES,
            poll_interval: Duration::from_millis(250),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Follow Outcome
// =============================================================================

/// How one follow strategy finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowOutcome {
    /// Stopped on request.
    Cancelled,
    /// Access refused; the chain should advance.
    PermissionDenied(String),
    /// The stream is over.
    Ended(StreamEnd),
}

// =============================================================================
// Factory
// =============================================================================

/// Starts tailers against the local filesystem and journal.
#[derive(Debug, Clone)]
pub struct SystemTailerFactory {
    settings: Arc<TailerSettings>,
}

impl SystemTailerFactory {
    /// Create a factory.
    #[must_use]
    pub fn new(settings: TailerSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    /// Resolve the strategy chain, failing when nothing backs the source.
    async fn plan(&self, source: &ResolvedSource) -> Result<Vec<FollowStrategy>, TailerError> {
        let settings = &self.settings;

        if settings.backend == Backend::Journal {
            let loaded = journal::unit_loaded(&source.unit, settings.stop_timeout).await;
            if loaded == Some(true) {
                return Ok(fallback::plan(Backend::Journal, settings.use_sudo, true));
            }
            return match file_exists(&source.file_path).await {
                Ok(true) => Ok(fallback::plan(Backend::Journal, settings.use_sudo, false)),
                Ok(false) => Err(TailerError::SourceNotFound(source.unit.clone())),
                Err(e) => Err(access_error(&source.file_path, &e)),
            };
        }

        match file_exists(&source.file_path).await {
            Ok(true) => Ok(fallback::plan(Backend::File, settings.use_sudo, false)),
            Ok(false) => Err(TailerError::SourceNotFound(
                source.file_path.display().to_string(),
            )),
            Err(e) => Err(access_error(&source.file_path, &e)),
        }
    }

    /// Read history the way the first strategy will see the source.
    ///
    /// Returns the file offset to resume from when the history came from
    /// the log file.
    async fn read_history(
        &self,
        first: FollowStrategy,
        source: &ResolvedSource,
    ) -> (History, Option<u64>) {
        let n = self.settings.history_lines;

        let result = if first.reads_file() {
            let path = source.file_path.clone();
            match tokio::task::spawn_blocking(move || file::read_last_lines(&path, n)).await {
                Ok(Ok((lines, offset))) => Ok((lines, Some(offset))),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        } else {
            journal::read_history(
                &source.unit,
                n,
                first == FollowStrategy::PrivilegedJournal,
                self.settings.stop_timeout,
            )
            .await
            .map(|lines| (lines, None))
        };

        match result {
            Ok((lines, offset)) => (History { lines, notice: None }, offset),
            Err(reason) => {
                tracing::warn!(source = %source.id, error = %reason, "Failed to read log history");
                (
                    History {
                        lines: Vec::new(),
                        notice: Some(format!("Could not read log history: {reason}")),
                    },
                    None,
                )
            }
        }
    }
}

#[async_trait]
impl TailerFactory for SystemTailerFactory {
    async fn start(&self, source: &SourceId) -> Result<StartedTailer, TailerError> {
        let resolved = self.settings.layout.resolve(source);
        let strategies = self.plan(&resolved).await?;
        let chain = FallbackChain::new(
            strategies,
            fallback::remediation(self.settings.backend, &resolved),
        );
        let first = chain.current().ok_or_else(|| {
            TailerError::PermissionDenied(resolved.file_path.display().to_string())
        })?;

        let (history, offset) = self.read_history(first, &resolved).await;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let current = Arc::new(Mutex::new(Some(first)));

        let supervisor = Supervisor {
            source: resolved,
            settings: Arc::clone(&self.settings),
            resume_offset: offset,
            current: Arc::clone(&current),
        };
        let task = tokio::spawn(supervisor.run(chain, tx, cancel.clone()));

        tracing::debug!(source = %source, strategy = %first, "Tailer supervisor spawned");

        Ok(StartedTailer {
            control: Box::new(Tailer {
                source: source.clone(),
                cancel,
                task: Mutex::new(Some(task)),
                current,
                stop_timeout: self.settings.stop_timeout,
            }),
            history,
            events: rx,
            strategy: first.name().to_string(),
        })
    }
}

async fn file_exists(path: &std::path::Path) -> io::Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn access_error(path: &std::path::Path, error: &io::Error) -> TailerError {
    if error.kind() == io::ErrorKind::PermissionDenied {
        TailerError::PermissionDenied(path.display().to_string())
    } else {
        TailerError::Spawn(format!("cannot inspect {}: {error}", path.display()))
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Runs the fallback chain for one tailer.
struct Supervisor {
    source: ResolvedSource,
    settings: Arc<TailerSettings>,
    resume_offset: Option<u64>,
    current: Arc<Mutex<Option<FollowStrategy>>>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut chain: FallbackChain,
        tx: mpsc::Sender<TailEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let strategy = match chain.state() {
                FallbackState::Following(strategy) => *strategy,
                FallbackState::Terminal { remediation } => {
                    tracing::error!(
                        source = %self.source.id,
                        remediation = %remediation,
                        "Every follow strategy was refused access"
                    );
                    *self.current.lock() = None;
                    let end = StreamEnd::Exhausted {
                        remediation: remediation.clone(),
                    };
                    let _ = tx.send(TailEvent::Ended(end)).await;
                    return;
                }
            };
            *self.current.lock() = Some(strategy);

            tracing::info!(source = %self.source.id, strategy = %strategy, "Following source");

            match self.follow(strategy, &tx, &cancel).await {
                FollowOutcome::Cancelled => {
                    tracing::debug!(source = %self.source.id, "Tailer cancelled");
                    return;
                }
                FollowOutcome::Ended(end) => {
                    *self.current.lock() = None;
                    let _ = tx.send(TailEvent::Ended(end)).await;
                    return;
                }
                FollowOutcome::PermissionDenied(reason) => {
                    tracing::warn!(
                        source = %self.source.id,
                        strategy = %strategy,
                        reason = %reason,
                        "Follow strategy refused access, falling back"
                    );
                    metrics::record_fallback(strategy.name());

                    chain.on_permission_denied();
                    if let Some(next) = chain.current() {
                        let notice = format!(
                            "{strategy} was refused access ({reason}); falling back to {next}"
                        );
                        if tx.send(TailEvent::Info(notice)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn follow(
        &mut self,
        strategy: FollowStrategy,
        tx: &mpsc::Sender<TailEvent>,
        cancel: &CancellationToken,
    ) -> FollowOutcome {
        let stop_timeout = self.settings.stop_timeout;

        // the offset is kept for FileWatch in case `tail` is refused
        match strategy.command(&self.source, self.resume_offset) {
            Some((program, args)) => {
                process::follow(&program, &args, tx, cancel, stop_timeout).await
            }
            None => {
                let path: PathBuf = self.source.file_path.clone();
                file::FileWatch::new(&path, self.resume_offset.take(), self.settings.poll_interval)
                    .run(tx, cancel)
                    .await
            }
        }
    }
}

// =============================================================================
// Tailer Handle
// =============================================================================

/// Handle to a running tailer.
pub struct Tailer {
    source: SourceId,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    current: Arc<Mutex<Option<FollowStrategy>>>,
    stop_timeout: Duration,
}

#[async_trait]
impl TailerControl for Tailer {
    async fn stop(&self) {
        self.cancel.cancel();

        let Some(mut task) = self.task.lock().take() else {
            return;
        };

        match tokio::time::timeout(self.stop_timeout * 2, &mut task).await {
            Ok(Ok(())) => tracing::debug!(source = %self.source, "Tailer stopped"),
            Ok(Err(e)) => tracing::error!(source = %self.source, error = %e, "Tailer task failed"),
            Err(_) => {
                tracing::warn!(source = %self.source, "Tailer did not stop in time, aborting");
                task.abort();
            }
        }
    }

    fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn strategy(&self) -> Option<String> {
        self.current.lock().map(|strategy| strategy.name().to_string())
    }
}

impl Drop for Tailer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
