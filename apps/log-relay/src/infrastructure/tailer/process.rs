//! Process Follower
//!
//! Runs an external follower (`tail`, `journalctl`) and turns its stdout
//! into line events. Stderr lines are classified: access refusals end the
//! follower with a permission outcome, anything else is forwarded as a
//! diagnostic.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::{StreamEnd, TailEvent};

use super::FollowOutcome;

/// Stderr fragments that mean the follower was refused access.
const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "not seeing messages from other users",
    "a password is required",
    "a terminal is required",
    "is not in the sudoers file",
    "not allowed to execute",
];

/// Whether a stderr line reports an access refusal.
#[must_use]
pub fn is_permission_error(line: &str) -> bool {
    let lower = line.to_lowercase();
    PERMISSION_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Follow `program args` until it exits, is refused access or `cancel` fires.
///
/// The child is killed on cancellation, on refusal and when this future is
/// dropped.
pub async fn follow(
    program: &str,
    args: &[String],
    tx: &mpsc::Sender<TailEvent>,
    cancel: &CancellationToken,
    stop_timeout: Duration,
) -> FollowOutcome {
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return FollowOutcome::PermissionDenied(format!("cannot execute {program}: {e}"));
        }
        Err(e) => {
            return FollowOutcome::Ended(StreamEnd::Failed(format!(
                "failed to start {program}: {e}"
            )));
        }
    };

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        terminate(&mut child, stop_timeout).await;
        return FollowOutcome::Ended(StreamEnd::Failed(format!(
            "{program} started without output pipes"
        )));
    };

    tracing::debug!(program, pid = child.id(), "Follower process started");

    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                terminate(&mut child, stop_timeout).await;
                return FollowOutcome::Cancelled;
            }
            line = stdout.next_line(), if stdout_open => match line {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() && tx.send(TailEvent::Line(line)).await.is_err() {
                        terminate(&mut child, stop_timeout).await;
                        return FollowOutcome::Cancelled;
                    }
                }
                Ok(None) => stdout_open = false,
                Err(e) => {
                    tracing::warn!(program, error = %e, "Failed to read follower stdout");
                    stdout_open = false;
                }
            },
            line = stderr.next_line(), if stderr_open => match line {
                Ok(Some(line)) if is_permission_error(&line) => {
                    terminate(&mut child, stop_timeout).await;
                    return FollowOutcome::PermissionDenied(line);
                }
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    tracing::warn!(program, stderr = %line, "Follower reported an error");
                    if tx.send(TailEvent::Error(format!("Tail error: {line}"))).await.is_err() {
                        terminate(&mut child, stop_timeout).await;
                        return FollowOutcome::Cancelled;
                    }
                }
                Ok(None) => stderr_open = false,
                Err(e) => {
                    tracing::warn!(program, error = %e, "Failed to read follower stderr");
                    stderr_open = false;
                }
            },
            status = child.wait(), if !stdout_open && !stderr_open => {
                return match status {
                    Ok(status) => {
                        tracing::info!(program, code = ?status.code(), "Follower process exited");
                        FollowOutcome::Ended(StreamEnd::Exited { code: status.code() })
                    }
                    Err(e) => FollowOutcome::Ended(StreamEnd::Failed(format!(
                        "failed to wait for {program}: {e}"
                    ))),
                };
            }
        }
    }
}

/// Kill the child and wait (bounded) for it to be reaped.
async fn terminate(child: &mut Child, stop_timeout: Duration) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Follower already exited");
    }

    match tokio::time::timeout(stop_timeout, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(code = ?status.code(), "Follower process reaped"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to reap follower process"),
        Err(_) => tracing::warn!(
            timeout_ms = stop_timeout.as_millis(),
            "Follower process did not exit in time"
        ),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("tail: cannot open '/var/log/x.log' for reading: Permission denied" ; "tail")]
    #[test_case("Hint: You are currently not seeing messages from other users and the system." ; "journalctl hint")]
    #[test_case("sudo: a password is required" ; "sudo")]
    fn recognises_permission_errors(line: &str) {
        assert!(is_permission_error(line));
    }

    #[test]
    fn other_stderr_is_not_permission() {
        assert!(!is_permission_error("tail: '/var/log/x.log' has become inaccessible: No such file or directory"));
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn forwards_stdout_lines_and_exit_code() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let outcome = follow(
            "sh",
            &sh("printf 'a\\n\\nb\\n'; exit 3"),
            &tx,
            &cancel,
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(rx.recv().await, Some(TailEvent::Line("a".to_string())));
        assert_eq!(rx.recv().await, Some(TailEvent::Line("b".to_string())));
        assert_eq!(
            outcome,
            FollowOutcome::Ended(StreamEnd::Exited { code: Some(3) })
        );
    }

    #[tokio::test]
    async fn permission_stderr_stops_follower() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let outcome = follow(
            "sh",
            &sh("echo 'tail: cannot open x: Permission denied' >&2; exec sleep 30"),
            &tx,
            &cancel,
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(outcome, FollowOutcome::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn other_stderr_is_forwarded_as_error() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        follow("sh", &sh("echo oops >&2"), &tx, &cancel, Duration::from_secs(1)).await;

        assert_eq!(
            rx.recv().await,
            Some(TailEvent::Error("Tail error: oops".to_string()))
        );
    }

    #[tokio::test]
    async fn cancel_kills_long_running_follower() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let handle = tokio::spawn(async move {
            follow("sleep", &["30".to_string()], &tx, &cancel, Duration::from_secs(1)).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, FollowOutcome::Cancelled);
    }

    #[tokio::test]
    async fn missing_program_fails_stream() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let outcome = follow(
            "definitely-not-a-real-follower",
            &[],
            &tx,
            &cancel,
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(outcome, FollowOutcome::Ended(StreamEnd::Failed(_))));
    }
}
