//! systemd Journal Probes
//!
//! One-shot `systemctl`/`journalctl` invocations used when a journal-backed
//! tailer starts: checking that the unit exists and reading its history.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// Whether systemd knows `unit`.
///
/// Returns `None` when `systemctl` cannot be run or does not answer in time.
pub async fn unit_loaded(unit: &str, timeout: Duration) -> Option<bool> {
    let output = run(
        "systemctl",
        &["show", "--property=LoadState", "--value", unit],
        timeout,
    )
    .await
    .ok()?;

    let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
    tracing::debug!(unit, load_state = %state, "Probed unit");
    Some(!state.is_empty() && state != "not-found")
}

/// Journal entries requested per non-empty history line on the first read.
const OVERREAD: usize = 2;

/// Upper bound on entries requested, as a multiple of `n`.
const MAX_OVERREAD: usize = 32;

/// Read the last `n` non-empty journal lines of `unit`, oldest first.
///
/// `journalctl -n` counts blank entries too, so more entries than `n` are
/// requested, growing the request while blanks leave the history short and
/// the journal has more to give.
///
/// # Errors
///
/// Returns a description of the failure when `journalctl` cannot be run,
/// exits unsuccessfully or reports no access.
pub async fn read_history(
    unit: &str,
    n: usize,
    privileged: bool,
    timeout: Duration,
) -> Result<Vec<String>, String> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut request = n * OVERREAD;
    loop {
        let stdout = journal_tail(unit, request, privileged, timeout).await?;
        let complete = request >= n * MAX_OVERREAD;
        if let Some(lines) = settle(&stdout, n, request, complete) {
            return Ok(lines);
        }
        request = (request * 4).min(n * MAX_OVERREAD);
    }
}

/// Last `n` non-empty lines of one read of `request` entries, or `None` when
/// blanks left fewer than `n` and a larger request could find more.
fn settle(stdout: &str, n: usize, request: usize, complete: bool) -> Option<Vec<String>> {
    let raw = stdout.lines().count();
    let lines: Vec<String> = stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect();

    if lines.len() < n && raw >= request && !complete {
        return None;
    }

    let skip = lines.len().saturating_sub(n);
    Some(lines.into_iter().skip(skip).collect())
}

async fn journal_tail(
    unit: &str,
    entries: usize,
    privileged: bool,
    timeout: Duration,
) -> Result<String, String> {
    let count = entries.to_string();
    let args = ["-u", unit, "-n", count.as_str(), "-o", "cat", "--no-pager"];

    let output = if privileged {
        let mut sudo_args = vec!["-n", "journalctl"];
        sudo_args.extend(args);
        run("sudo", &sudo_args, timeout).await?
    } else {
        run("journalctl", &args, timeout).await?
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "journalctl exited with {}: {}",
            output.status,
            stderr.trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn run(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<std::process::Output, String> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(format!("failed to run {program}: {e}")),
        Err(_) => Err(format!("{program} did not answer within {timeout:?}")),
    }
}
