//! Log source listing.
//!
//! Reports which per-instance log files exist, for diagnosing why a
//! subscription finds nothing.

use std::io;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::domain::source::SourceLayout;

use super::RelayState;

/// Listing of the log directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcesResponse {
    /// Always `true`; failures use a separate body.
    pub success: bool,
    /// Directory that was listed.
    pub log_dir: String,
    /// Whether the directory exists.
    pub log_dir_exists: bool,
    /// Matching log files, by name.
    pub log_files: Vec<LogFileInfo>,
    /// When the listing was taken.
    pub timestamp: DateTime<Utc>,
}

/// One log file.
#[derive(Debug, Clone, Serialize)]
pub struct LogFileInfo {
    /// File name.
    pub name: String,
    /// Full path.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, if the platform reports one.
    pub modified: Option<DateTime<Utc>>,
    /// Whether the relay can open the file.
    pub readable: bool,
}

/// List the log files of `layout`.
///
/// A missing directory is reported, not treated as an error.
///
/// # Errors
///
/// Returns the I/O error when the directory exists but cannot be read.
pub async fn list_sources(layout: &SourceLayout) -> io::Result<SourcesResponse> {
    let log_dir = layout.log_dir.display().to_string();
    let mut log_files = Vec::new();

    let mut entries = match tokio::fs::read_dir(&layout.log_dir).await {
        Ok(entries) => Some(entries),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };
    let log_dir_exists = entries.is_some();

    if let Some(entries) = entries.as_mut() {
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !layout.matches_file_name(&name) {
                continue;
            }

            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            let path = entry.path();
            log_files.push(LogFileInfo {
                name,
                path: path.display().to_string(),
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                readable: tokio::fs::File::open(&path).await.is_ok(),
            });
        }
    }

    log_files.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(SourcesResponse {
        success: true,
        log_dir,
        log_dir_exists,
        log_files,
        timestamp: Utc::now(),
    })
}

pub(super) async fn sources_handler(State(state): State<Arc<RelayState>>) -> Response {
    match list_sources(&state.layout).await {
        Ok(listing) => (StatusCode::OK, Json(listing)).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list log sources");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": e.to_string(),
                    "timestamp": Utc::now(),
                })),
            )
                .into_response()
        }
    }
}
