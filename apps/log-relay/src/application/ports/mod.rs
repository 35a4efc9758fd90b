//! Port Interfaces
//!
//! Contracts between the broker and the tailers it drives, following the
//! Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `TailerFactory`: resolves a source and starts following it
//! - `TailerControl`: stops a running tailer

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::source::SourceId;
use crate::domain::streaming::TailEvent;

/// Lines read from a source when its tailer starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    /// Up to `n` most recent non-empty lines, oldest first.
    pub lines: Vec<String>,
    /// Set when history could not be read; shown to subscribers as info.
    pub notice: Option<String>,
}

/// A freshly started tailer.
pub struct StartedTailer {
    /// Handle used to stop the tailer.
    pub control: Box<dyn TailerControl>,
    /// History read at start.
    pub history: History,
    /// Live events; closes after `TailEvent::Ended` or once stopped.
    pub events: mpsc::Receiver<TailEvent>,
    /// Name of the follow strategy in use, for diagnostics.
    pub strategy: String,
}

impl std::fmt::Debug for StartedTailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartedTailer")
            .field("history", &self.history)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

/// Starts tailers for validated sources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TailerFactory: Send + Sync + 'static {
    /// Resolve `source` and start following it.
    ///
    /// # Errors
    ///
    /// Returns `TailerError::SourceNotFound` when nothing backs the source
    /// and `TailerError::Spawn` when the follower cannot be started.
    async fn start(&self, source: &SourceId) -> Result<StartedTailer, TailerError>;
}

/// Stops a running tailer.
#[async_trait]
pub trait TailerControl: Send + Sync {
    /// Terminate the follower and wait for it to exit. Idempotent.
    async fn stop(&self);

    /// Whether the follower is still running.
    fn is_running(&self) -> bool;

    /// Follow strategy currently in use, if the tailer tracks one.
    fn strategy(&self) -> Option<String> {
        None
    }
}

/// Tailer start errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TailerError {
    /// No file or unit backs the source.
    #[error("log source not found: {0}")]
    SourceNotFound(String),

    /// Access to the source was refused and no fallback remains.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The follower could not be started.
    #[error("failed to start follower: {0}")]
    Spawn(String),
}
