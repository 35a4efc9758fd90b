//! Permission Fallback Chain
//!
//! A tailer follows its source with the first strategy of a chain and moves
//! to the next one only when the current strategy is refused access:
//!
//! ```text
//! PrivilegedJournal ──► Journal ──► FileWatch ──► Terminal(remediation)
//!         TailProcess ─────────────► FileWatch ──► Terminal(remediation)
//! ```
//!
//! Any other failure ends the stream without advancing. Every transition
//! consumes one strategy, so a chain makes at most `len` transitions.

use std::collections::VecDeque;
use std::fmt;

use crate::domain::source::ResolvedSource;

use super::Backend;

// =============================================================================
// Strategies
// =============================================================================

/// One way of following a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FollowStrategy {
    /// `sudo -n journalctl -u <unit> -f`.
    PrivilegedJournal,
    /// `journalctl -u <unit> -f`.
    Journal,
    /// `tail -F <path>`.
    TailProcess,
    /// In-process following of the log file on change notifications.
    FileWatch,
}

impl FollowStrategy {
    /// Short name used in logs, metrics and health output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PrivilegedJournal => "sudo-journalctl",
            Self::Journal => "journalctl",
            Self::TailProcess => "tail",
            Self::FileWatch => "file-watch",
        }
    }

    /// Whether this strategy reads the log file rather than the journal.
    #[must_use]
    pub const fn reads_file(self) -> bool {
        matches!(self, Self::TailProcess | Self::FileWatch)
    }

    /// Program and arguments for process-backed strategies.
    ///
    /// `tail` starts at byte `resume` when history was read from the file,
    /// so nothing appended in between is skipped. Returns `None` for
    /// `FileWatch`, which runs in-process.
    #[must_use]
    pub fn command(
        self,
        source: &ResolvedSource,
        resume: Option<u64>,
    ) -> Option<(String, Vec<String>)> {
        let journal_args = || {
            vec![
                "-u".to_string(),
                source.unit.clone(),
                "-f".to_string(),
                "-n".to_string(),
                "0".to_string(),
                "-o".to_string(),
                "cat".to_string(),
                "--no-pager".to_string(),
            ]
        };

        match self {
            Self::PrivilegedJournal => {
                let mut args = vec!["-n".to_string(), "journalctl".to_string()];
                args.extend(journal_args());
                Some(("sudo".to_string(), args))
            }
            Self::Journal => Some(("journalctl".to_string(), journal_args())),
            Self::TailProcess => {
                let start = resume.map_or_else(
                    || ["-n".to_string(), "0".to_string()],
                    |offset| ["-c".to_string(), format!("+{}", offset + 1)],
                );
                let mut args = vec!["-F".to_string()];
                args.extend(start);
                args.push(source.file_path.display().to_string());
                Some(("tail".to_string(), args))
            }
            Self::FileWatch => None,
        }
    }
}

impl fmt::Display for FollowStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Build the strategy chain for a source.
///
/// With the journal backend, a source whose unit is not loaded but whose
/// file exists is followed from the file directly.
#[must_use]
pub fn plan(backend: Backend, use_sudo: bool, unit_loaded: bool) -> Vec<FollowStrategy> {
    match backend {
        Backend::Journal if unit_loaded => {
            let mut chain = Vec::with_capacity(3);
            if use_sudo {
                chain.push(FollowStrategy::PrivilegedJournal);
            }
            chain.push(FollowStrategy::Journal);
            chain.push(FollowStrategy::FileWatch);
            chain
        }
        Backend::Journal => vec![FollowStrategy::FileWatch],
        Backend::File => vec![FollowStrategy::TailProcess, FollowStrategy::FileWatch],
    }
}

/// What an operator can do once every strategy has been refused.
#[must_use]
pub fn remediation(backend: Backend, source: &ResolvedSource) -> String {
    match backend {
        Backend::Journal => format!(
            "Add the relay user to the systemd-journal group, allow it to run \
             `sudo -n journalctl` and set LOG_RELAY_USE_SUDO=true, or make {} readable.",
            source.file_path.display()
        ),
        Backend::File => format!(
            "Make {} readable by the relay user.",
            source.file_path.display()
        ),
    }
}

// =============================================================================
// State Machine
// =============================================================================

/// Current state of a fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackState {
    /// Following with this strategy.
    Following(FollowStrategy),
    /// Every strategy was refused.
    Terminal {
        /// What an operator can do to restore access.
        remediation: String,
    },
}

/// Ordered fallback chain for one tailer.
#[derive(Debug)]
pub struct FallbackChain {
    state: FallbackState,
    remaining: VecDeque<FollowStrategy>,
    remediation: String,
}

impl FallbackChain {
    /// Create a chain starting at the first strategy.
    #[must_use]
    pub fn new(strategies: impl IntoIterator<Item = FollowStrategy>, remediation: String) -> Self {
        let mut remaining: VecDeque<_> = strategies.into_iter().collect();
        let state = remaining.pop_front().map_or_else(
            || FallbackState::Terminal {
                remediation: remediation.clone(),
            },
            FallbackState::Following,
        );

        Self {
            state,
            remaining,
            remediation,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &FallbackState {
        &self.state
    }

    /// Strategy in use, if not terminal.
    #[must_use]
    pub const fn current(&self) -> Option<FollowStrategy> {
        match self.state {
            FallbackState::Following(strategy) => Some(strategy),
            FallbackState::Terminal { .. } => None,
        }
    }

    /// Advance after the current strategy was refused access.
    pub fn on_permission_denied(&mut self) -> &FallbackState {
        if let FallbackState::Following(_) = self.state {
            self.state = self.remaining.pop_front().map_or_else(
                || FallbackState::Terminal {
                    remediation: self.remediation.clone(),
                },
                FallbackState::Following,
            );
        }
        &self.state
    }
}
