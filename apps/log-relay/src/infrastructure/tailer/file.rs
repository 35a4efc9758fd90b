//! File History and Change Watch
//!
//! Reads the trailing lines of a log file and follows it on filesystem
//! change notifications, tolerating truncation, rotation and the file
//! disappearing for a while.
//!
//! The watch is registered on the file's parent directory so that the file
//! can be deleted, recreated or renamed away without losing the watch. When
//! no watch can be registered the file is polled instead.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use notify::event::{Event, EventKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::{StreamEnd, TailEvent};

use super::FollowOutcome;

const BLOCK_SIZE: u64 = 8 * 1024;

// =============================================================================
// History
// =============================================================================

/// Read up to the last `n` non-empty lines of `path`, oldest first.
///
/// Reads backwards in blocks, so the cost is bounded by the size of the
/// trailing lines rather than the file. Also returns the file length at the
/// time of reading, where following should resume.
///
/// # Errors
///
/// Returns the underlying I/O error when the file cannot be opened or read.
pub fn read_last_lines(path: &Path, n: usize) -> io::Result<(Vec<String>, u64)> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if n == 0 {
        return Ok((Vec::new(), len));
    }

    let mut pos = len;
    let mut tail: Vec<u8> = Vec::new();

    while pos > 0 && complete_lines(&tail) <= n {
        let start = pos.saturating_sub(BLOCK_SIZE);
        let mut block = vec![0; usize::try_from(pos - start).unwrap_or(0)];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut block)?;
        block.extend_from_slice(&tail);
        tail = block;
        pos = start;
    }

    let text = String::from_utf8_lossy(&tail);
    let mut segments = text.split('\n');
    if pos > 0 {
        // first segment may be the tail of a longer line
        segments.next();
    }

    let lines: Vec<String> = segments
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect();
    let skip = lines.len().saturating_sub(n);

    Ok((lines.into_iter().skip(skip).collect(), len))
}

fn complete_lines(bytes: &[u8]) -> usize {
    bytes
        .split(|b| *b == b'\n')
        .skip(1)
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .count()
}

// =============================================================================
// Change Watch
// =============================================================================

/// What wakes the watch to look at the file again.
enum Wakeup {
    /// Directory change notifications, coalesced into a single pending wake.
    Notify {
        rx: mpsc::Receiver<()>,
        _watcher: RecommendedWatcher,
    },
    /// Fixed-interval polling.
    Poll(tokio::time::Interval),
}

impl Wakeup {
    fn new(path: &Path, poll_interval: Duration) -> Self {
        match watch_parent(path) {
            Ok((watcher, rx)) => Self::Notify {
                rx,
                _watcher: watcher,
            },
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Cannot watch log directory, polling instead"
                );
                let mut interval = tokio::time::interval(poll_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                Self::Poll(interval)
            }
        }
    }

    async fn next(&mut self) {
        match self {
            Self::Notify { rx, .. } => {
                if rx.recv().await.is_none() {
                    std::future::pending::<()>().await;
                }
            }
            Self::Poll(interval) => {
                interval.tick().await;
            }
        }
    }
}

/// Watch the directory holding `path`, waking on events that name the file.
fn watch_parent(path: &Path) -> notify::Result<(RecommendedWatcher, mpsc::Receiver<()>)> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name: Option<OsString> = path.file_name().map(ToOwned::to_owned);
    let (tx, rx) = mpsc::channel(1);

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        let wake = match result {
            Ok(event) => concerns(&event, name.as_deref()),
            Err(e) => {
                tracing::warn!(error = %e, "File watch error");
                true
            }
        };
        if wake {
            // a full queue already holds a pending wake
            let _ = tx.try_send(());
        }
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;

    Ok((watcher, rx))
}

/// Whether a directory event may have changed the watched file.
fn concerns(event: &Event, name: Option<&OsStr>) -> bool {
    if event.need_rescan() {
        return true;
    }
    // our own reads show up as access events
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|p| p.file_name() == name)
}

/// Follows a file from change notifications.
#[derive(Debug)]
pub struct FileWatch<'a> {
    path: &'a Path,
    poll_interval: Duration,
    position: Option<u64>,
    identity: Option<u64>,
    pending: Vec<u8>,
    missing: bool,
}

impl<'a> FileWatch<'a> {
    /// Watch `path`, resuming at `position` or at the current end of file.
    #[must_use]
    pub const fn new(path: &'a Path, position: Option<u64>, poll_interval: Duration) -> Self {
        Self {
            path,
            poll_interval,
            position,
            identity: None,
            pending: Vec::new(),
            missing: false,
        }
    }

    /// Follow until cancelled, refused access or a fatal read error.
    ///
    /// The file is read once on start, then again on every wake.
    pub async fn run(
        mut self,
        tx: &mpsc::Sender<TailEvent>,
        cancel: &CancellationToken,
    ) -> FollowOutcome {
        let mut wakeup = Wakeup::new(self.path, self.poll_interval);

        loop {
            let events = match self.read_appended().await {
                Ok(events) => events,
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    return FollowOutcome::PermissionDenied(format!(
                        "{}: {e}",
                        self.path.display()
                    ));
                }
                Err(e) => {
                    return FollowOutcome::Ended(StreamEnd::Failed(format!(
                        "failed to read {}: {e}",
                        self.path.display()
                    )));
                }
            };

            for event in events {
                if tx.send(event).await.is_err() {
                    return FollowOutcome::Cancelled;
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return FollowOutcome::Cancelled,
                () = wakeup.next() => {}
            }
        }
    }

    /// Read whatever was appended since the last read.
    async fn read_appended(&mut self) -> io::Result<Vec<TailEvent>> {
        let mut events = Vec::new();

        let mut file = match tokio::fs::File::open(self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !self.missing {
                    self.missing = true;
                    events.push(TailEvent::Info(format!(
                        "Log file {} not found, waiting for it to appear",
                        self.path.display()
                    )));
                }
                // whatever appears next is new content
                self.position = Some(0);
                self.identity = None;
                self.pending.clear();
                return Ok(events);
            }
            Err(e) => return Err(e),
        };

        let metadata = file.metadata().await?;
        let len = metadata.len();
        let identity = file_identity(&metadata);

        if self.missing {
            self.missing = false;
            events.push(TailEvent::Info(format!(
                "Log file {} appeared",
                self.path.display()
            )));
        }

        let replaced = self.identity.is_some() && identity != self.identity;
        let position = match self.position {
            None => len,
            Some(position) if position > len || replaced => {
                events.push(TailEvent::Info(
                    "Log file was truncated or rotated, reading from the start".to_string(),
                ));
                self.pending.clear();
                0
            }
            Some(position) => position,
        };
        self.identity = identity;

        if len > position {
            file.seek(SeekFrom::Start(position)).await?;
            let mut chunk = Vec::new();
            let read = file.take(len - position).read_to_end(&mut chunk).await?;
            self.position = Some(position + read as u64);
            self.pending.extend_from_slice(&chunk);
            events.extend(self.drain_lines());
        } else {
            self.position = Some(position);
        }

        Ok(events)
    }

    /// Split complete lines off the pending buffer.
    fn drain_lines(&mut self) -> Vec<TailEvent> {
        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let complete: Vec<u8> = self.pending.drain(..=last_newline).collect();
        String::from_utf8_lossy(&complete)
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .filter(|line| !line.trim().is_empty())
            .map(|line| TailEvent::Line(line.to_string()))
            .collect()
    }
}

#[cfg(unix)]
fn file_identity(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_identity(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}
