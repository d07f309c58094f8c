//! Blocking readiness polling against a service's HTTP health endpoint.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use serde::Deserialize;

use crate::supervisor::{log_tail, ManagedProcess};

/// How often a waiting service reports progress, independent of the poll
/// interval.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// One readiness probe target.
#[derive(Debug, Clone)]
pub struct HealthCheckTarget {
    pub url: String,
    pub expect: HealthExpect,
    pub interval: Duration,
    pub timeout: Duration,
}

/// What counts as a successful probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthExpect {
    /// Any 2xx response.
    Success,
    /// A 2xx response whose JSON body carries this `status` value.
    Status(String),
}

#[derive(Deserialize)]
struct HealthPayload {
    status: String,
}

/// Terminal states of one readiness wait.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadyOutcome {
    Ready { elapsed: Duration },
    TimedOut { elapsed: Duration },
    ProcessExited,
    Interrupted,
}

/// The wait loop itself, kept free of HTTP and logging so the state machine
/// is testable on its own. A successful probe wins over a dead process in
/// the same cycle, and the elapsed time on `TimedOut` never exceeds the
/// budget by more than one interval.
fn poll_until(
    interval: Duration,
    timeout: Duration,
    mut probe: impl FnMut() -> bool,
    mut exited: impl FnMut() -> bool,
    mut cancelled: impl FnMut() -> bool,
    mut on_progress: impl FnMut(Duration),
) -> ReadyOutcome {
    let started = Instant::now();
    let mut last_progress = Instant::now();
    loop {
        if probe() {
            return ReadyOutcome::Ready {
                elapsed: started.elapsed(),
            };
        }
        if exited() {
            return ReadyOutcome::ProcessExited;
        }
        if cancelled() {
            return ReadyOutcome::Interrupted;
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return ReadyOutcome::TimedOut { elapsed };
        }
        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            on_progress(elapsed);
            last_progress = Instant::now();
        }
        sleep(interval);
    }
}

/// Block until `target` answers its health check, the supervised process
/// dies, the timeout budget runs out, or Ctrl-C is seen.
pub fn wait_ready(
    client: &Client,
    name: &str,
    target: &HealthCheckTarget,
    process: Option<&mut ManagedProcess>,
    running: &AtomicBool,
) -> ReadyOutcome {
    let log_path: Option<PathBuf> = process.as_ref().map(|process| process.log_path.clone());
    let mut process = process;
    poll_until(
        target.interval,
        target.timeout,
        || http_probe(client, target),
        || {
            process
                .as_mut()
                .map_or(false, |process| process.poll().is_some())
        },
        || !running.load(Ordering::SeqCst),
        |elapsed| {
            match log_path.as_deref().and_then(|path| log_tail(path, 1).pop()) {
                Some(line) => tracing::info!("Waiting for {name} to be ready... {line}"),
                None => tracing::info!(
                    "Waiting for {name} to be ready... ({}s elapsed)",
                    elapsed.as_secs()
                ),
            }
        },
    )
}

fn http_probe(client: &Client, target: &HealthCheckTarget) -> bool {
    let response = match client.get(&target.url).send() {
        Ok(response) => response,
        // Connection refused just means the service is not up yet
        Err(_) => return false,
    };
    if !response.status().is_success() {
        return false;
    }
    match &target.expect {
        HealthExpect::Success => true,
        HealthExpect::Status(expected) => response
            .json::<HealthPayload>()
            .map(|payload| payload.status == *expected)
            .unwrap_or(false),
    }
}
