//! Log Source Identification
//!
//! A source identifier names one log stream (one service instance). It is
//! interpolated into file paths and systemd unit names, so it is validated
//! against `^\d+$` before anything else touches it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;

// =============================================================================
// Source Identifier
// =============================================================================

/// A validated source identifier (ASCII digits only).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Validate a raw identifier.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::InvalidSource` unless `raw` is a non-empty run
    /// of ASCII digits.
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(raw.to_string()))
        } else {
            Err(SourceError::InvalidSource(raw.to_string()))
        }
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SourceId {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Source Layout
// =============================================================================

/// Where the log sources of the service family live.
#[derive(Debug, Clone)]
pub struct SourceLayout {
    /// Directory holding the per-instance log files.
    pub log_dir: PathBuf,
    /// File name prefix; the file is `<prefix><id>.log`.
    pub file_prefix: String,
    /// Unit name prefix; the unit is `<prefix>@<id>.service`.
    pub unit_prefix: String,
}

impl Default for SourceLayout {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("/var/log/threshold-ecdsa-web"),
            file_prefix: "threshold-ecdsa-web-".to_string(),
            unit_prefix: "threshold-ecdsa-web".to_string(),
        }
    }
}

impl SourceLayout {
    /// Resolve an identifier to its concrete file path and unit name.
    #[must_use]
    pub fn resolve(&self, id: &SourceId) -> ResolvedSource {
        ResolvedSource {
            id: id.clone(),
            file_path: self.log_dir.join(format!("{}{id}.log", self.file_prefix)),
            unit: format!("{}@{id}.service", self.unit_prefix),
        }
    }

    /// Check whether a file name in `log_dir` belongs to this layout.
    #[must_use]
    pub fn matches_file_name(&self, name: &str) -> bool {
        name.starts_with(&self.file_prefix)
            && Path::new(name)
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("log"))
    }
}

/// A source identifier resolved against a layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    /// The identifier this was resolved from.
    pub id: SourceId,
    /// Log file path.
    pub file_path: PathBuf,
    /// systemd unit name.
    pub unit: String,
}

// =============================================================================
// Errors
// =============================================================================

/// Source identification errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The identifier does not match `^\d+$`.
    #[error("invalid source identifier: {0:?}")]
    InvalidSource(String),
}
