//! Running a check command and turning the result into an observation.
//!
//! A probe failing (non-zero exit, timeout, unparseable metric) is data,
//! not an error: every outcome becomes an [`Observation`]. The only case
//! without an observation is cancellation while the command runs.

use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{debug, warn};
use watchpost_core::CheckKind;
use watchpost_history::Observation;

use crate::check::CheckSpec;

/// Captured process output.
#[derive(Debug, Default)]
struct Captured {
    /// stdout and stderr interleaved in arrival order.
    combined: Vec<u8>,
    stdout: Vec<u8>,
}

enum Exit {
    Exited(ExitStatus),
    TimedOut,
    Failed(String),
}

/// Resolves once `shutdown` is set or its sender is gone.
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Run the check command once.
///
/// Returns `None` if `shutdown` fires before the command finishes; the
/// child is killed in that case.
pub async fn execute_once(
    spec: &CheckSpec,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Observation> {
    if *shutdown.borrow() {
        return None;
    }

    let started = Instant::now();
    let mut child = match Command::new(&spec.shell)
        .args(["-e", "-c"])
        .arg(script(&spec.command))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let exit = Exit::Failed(format!("failed to run: {e}"));
            return Some(observe(spec, Captured::default(), exit, started));
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut captured = Captured::default();

    let finished = tokio::select! {
        result = tokio::time::timeout(spec.timeout, async {
            capture(stdout, stderr, &mut captured).await;
            child.wait().await
        }) => Some(result),
        _ = cancelled(shutdown) => None,
    };

    let exit = match finished {
        None => {
            let _ = child.kill().await;
            debug!(group = %spec.group, name = %spec.name, "probe cancelled");
            return None;
        }
        Some(Err(_)) => {
            let _ = child.kill().await;
            Exit::TimedOut
        }
        Some(Ok(Ok(status))) => Exit::Exited(status),
        Some(Ok(Err(e))) => Exit::Failed(format!("failed to run: {e}")),
    };

    Some(observe(spec, captured, exit, started))
}

/// Turn on `pipefail` when the shell has it, then run `command`.
///
/// Together with `-e` a failing step anywhere in a multi-step check, or in
/// a pipeline, fails the whole check.
fn script(command: &str) -> String {
    format!("(set -o pipefail) 2>/dev/null && set -o pipefail\n{command}")
}

/// Read both pipes to EOF, keeping the order in which chunks arrive.
async fn capture(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>, into: &mut Captured) {
    let (Some(mut stdout), Some(mut stderr)) = (stdout, stderr) else {
        return;
    };
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => {
                    into.combined.extend_from_slice(&out_buf[..n]);
                    into.stdout.extend_from_slice(&out_buf[..n]);
                }
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => into.combined.extend_from_slice(&err_buf[..n]),
            },
        }
    }
}

fn observe(spec: &CheckSpec, captured: Captured, exit: Exit, started: Instant) -> Observation {
    let failure = match exit {
        Exit::TimedOut => Some(format!("timed out after {:?}", spec.timeout)),
        Exit::Failed(reason) => Some(reason),
        Exit::Exited(status) if !status.success() => Some(match status.code() {
            Some(code) => format!("process exited with status {code}"),
            None => format!("process exited with {status}"),
        }),
        Exit::Exited(_) => None,
    };

    let mut observation = match failure {
        Some(error) => Observation::unhealthy(&spec.group, &spec.name, spec.kind, &error),
        None => Observation::healthy(&spec.group, &spec.name, spec.kind),
    };
    observation.metric_unit = spec.metric_unit.clone();

    if spec.kind == CheckKind::Metric && observation.status.is_success() {
        let raw = String::from_utf8_lossy(&captured.stdout);
        let trimmed = raw.trim();
        match trimmed.parse::<f64>() {
            Ok(value) if value.is_finite() => observation.metric_value = Some(value),
            Ok(_) => {
                warn!(group = %spec.group, name = %spec.name, output = %trimmed, "metric output is not finite");
                observation.error = format!("failed to parse metric value {trimmed:?}: not a finite number");
            }
            Err(e) => {
                warn!(group = %spec.group, name = %spec.name, output = %trimmed, "metric output is not a number");
                observation.error = format!("failed to parse metric value {trimmed:?}: {e}");
            }
        }
    }

    observation.output = captured.combined;
    observation.duration = started.elapsed();
    observation
}

/// Run one cycle: the first attempt plus up to `max_retries` retries.
///
/// Returns the terminal observation and the number of attempts made, or
/// `None` if cancelled while a command was running. Cancellation during a
/// retry wait makes the last completed attempt terminal.
pub async fn run_cycle(
    spec: &CheckSpec,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<(Observation, u32)> {
    let mut attempts = 0;
    loop {
        let observation = execute_once(spec, shutdown).await?;
        attempts += 1;
        debug!(
            group = %spec.group,
            name = %spec.name,
            attempt = attempts,
            status = %observation.status,
            duration_ms = observation.duration.as_millis() as u64,
            "probe finished"
        );

        if observation.status.is_success() || attempts > spec.max_retries {
            return Some((observation, attempts));
        }

        warn!(
            group = %spec.group,
            name = %spec.name,
            attempt = attempts,
            max_retries = spec.max_retries,
            error = %observation.error,
            "probe failed, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(spec.retry_interval) => {}
            _ = cancelled(shutdown) => return Some((observation, attempts)),
        }
    }
}
