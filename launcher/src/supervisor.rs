//! One supervised child per service, tracked through a pid record on disk so
//! a later `stop` invocation can recover the handle.

use std::fs::{self, File};
use std::io::ErrorKind;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::health::HealthCheckTarget;
use crate::LauncherError;

/// Interval between liveness probes while waiting on a signaled process.
const TERMINATION_POLL: Duration = Duration::from_millis(100);

/// Bound on the wait for SIGKILL to be acted on.
const KILL_CONFIRM_POLLS: usize = 50;

/// How a service is launched and recognized.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub name: &'static str,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Matched against `/proc/<pid>/cmdline` when no pid record exists.
    pub orphan_pattern: Regex,
    pub health: HealthCheckTarget,
}

/// A live child, as seen by the invocation that spawned it.
#[derive(Debug)]
pub struct ManagedProcess {
    pub name: &'static str,
    pub child: Child,
    pub log_path: PathBuf,
    pub started_at: Instant,
}

impl ManagedProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Some(..) once the child has exited.
    pub fn poll(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }
}

/// On-disk record tying a service name to its process.
#[derive(Debug, Serialize, Deserialize)]
struct PidRecord {
    pid: u32,
    command: String,
    started_at_unix: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// No pid record and nothing matching the service on the process table.
    NotRunning,
    /// The record pointed at a process that had already exited.
    AlreadyStopped { pid: u32 },
    /// The process exited within the grace period.
    Terminated { pid: u32 },
    /// The process ignored SIGTERM and was killed.
    Forced { pid: u32 },
    /// The process ignored SIGTERM and was left running, record retained.
    GracefulShutdownTimeout { pid: u32 },
    /// Untracked processes matching the service command line.
    Orphans { pids: Vec<u32>, killed: bool },
}

fn pid_path(logs_dir: &Path, name: &str) -> PathBuf {
    logs_dir.join(format!("{name}.pid"))
}

pub fn log_path(logs_dir: &Path, name: &str) -> PathBuf {
    logs_dir.join(format!("{name}.log"))
}

fn read_record(logs_dir: &Path, name: &str) -> Option<PidRecord> {
    let raw = fs::read_to_string(pid_path(logs_dir, name)).ok()?;
    serde_json::from_str(&raw).ok()
}

pub(crate) fn clear_record(logs_dir: &Path, name: &str) {
    let _ = fs::remove_file(pid_path(logs_dir, name));
}

/// Liveness is read out of /proc rather than `kill -0`: a zombie still
/// answers signal 0 but is already dead for our purposes.
pub(crate) fn pid_alive(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The comm field is parenthesized and may itself contain spaces.
    let Some(end) = stat.rfind(')') else {
        return false;
    };
    !matches!(stat[end + 1..].trim_start().chars().next(), Some('Z'))
}

/// Launch the service and record its pid. Readiness is the poller's job:
/// this returns as soon as the child exists.
pub fn spawn(def: &ServiceDefinition, logs_dir: &Path) -> Result<ManagedProcess, LauncherError> {
    if let Some(record) = read_record(logs_dir, def.name) {
        if pid_alive(record.pid) {
            return Err(LauncherError::AlreadyRunning {
                service: def.name.to_string(),
                pid: record.pid,
            });
        }
        tracing::info!(
            "Removing stale pid record for {} (pid {} is gone)",
            def.name,
            record.pid
        );
        clear_record(logs_dir, def.name);
    }

    fs::create_dir_all(logs_dir)?;
    let log_path = log_path(logs_dir, def.name);
    let log_file = File::create(&log_path)?;

    let mut command = Command::new(&def.program);
    command
        .args(&def.args)
        .envs(def.env.iter().map(|(key, value)| (key, value)))
        .stdout(Stdio::from(log_file.try_clone()?))
        .stderr(Stdio::from(log_file))
        // Detached process group: the service must outlive this invocation
        // and ignore the terminal's Ctrl-C.
        .process_group(0);
    if let Some(dir) = &def.working_dir {
        command.current_dir(dir);
    }

    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(LauncherError::Precondition(format!(
                "{} not found; run `setup` first",
                def.program.display()
            )));
        }
        Err(err) => return Err(err.into()),
    };

    let record = PidRecord {
        pid: child.id(),
        command: format!("{} {}", def.program.display(), def.args.join(" ")),
        started_at_unix: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0),
    };
    // The liveness check above and this write are not atomic: two launchers
    // racing here can both spawn. Known limitation of a single-operator tool.
    fs::write(pid_path(logs_dir, def.name), serde_json::to_string(&record)?)?;

    tracing::info!(
        "Started {} (pid {}), logging to {}",
        def.name,
        record.pid,
        log_path.display()
    );

    Ok(ManagedProcess {
        name: def.name,
        child,
        log_path,
        started_at: Instant::now(),
    })
}

/// Stop the recorded process for `name`, escalating to SIGKILL only under
/// `force`. Stale records are cleaned up on sight; without a record the
/// process table is scanned for orphans matching `orphan_pattern`.
pub fn terminate(
    name: &str,
    orphan_pattern: &Regex,
    logs_dir: &Path,
    force: bool,
    grace: Duration,
) -> TerminationOutcome {
    let Some(record) = read_record(logs_dir, name) else {
        let pids = find_orphans(orphan_pattern);
        if pids.is_empty() {
            return TerminationOutcome::NotRunning;
        }
        if !force {
            return TerminationOutcome::Orphans {
                pids,
                killed: false,
            };
        }
        for &pid in &pids {
            tracing::warn!("Killing untracked {name} process (pid {pid})");
            send_signal(pid, Signal::SIGKILL);
        }
        return TerminationOutcome::Orphans { pids, killed: true };
    };

    if !pid_alive(record.pid) {
        tracing::info!(
            "{name} (pid {}) already stopped, removing stale pid record",
            record.pid
        );
        clear_record(logs_dir, name);
        return TerminationOutcome::AlreadyStopped { pid: record.pid };
    }

    tracing::info!("Sending SIGTERM to {name} (pid {})", record.pid);
    send_signal(record.pid, Signal::SIGTERM);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !pid_alive(record.pid) {
            clear_record(logs_dir, name);
            tracing::info!("{name} terminated");
            return TerminationOutcome::Terminated { pid: record.pid };
        }
        sleep(TERMINATION_POLL);
    }

    if !force {
        return TerminationOutcome::GracefulShutdownTimeout { pid: record.pid };
    }

    tracing::warn!("{name} (pid {}) ignored SIGTERM, sending SIGKILL", record.pid);
    send_signal(record.pid, Signal::SIGKILL);
    for _ in 0..KILL_CONFIRM_POLLS {
        if !pid_alive(record.pid) {
            break;
        }
        sleep(TERMINATION_POLL);
    }
    clear_record(logs_dir, name);
    tracing::info!("{name} killed");
    TerminationOutcome::Forced { pid: record.pid }
}

fn send_signal(pid: u32, signal: Signal) {
    // ESRCH just means the process beat us to exiting.
    let _ = signal::kill(Pid::from_raw(pid as i32), signal);
}

/// Best-effort scan for service processes that lost their pid record.
fn find_orphans(pattern: &Regex) -> Vec<u32> {
    let mut pids = Vec::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return pids;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if pid == std::process::id() {
            continue;
        }
        let Ok(raw) = fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline = raw
            .split(|byte| *byte == 0)
            .filter(|part| !part.is_empty())
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>()
            .join(" ");
        if pattern.is_match(&cmdline) {
            pids.push(pid);
        }
    }
    pids
}

/// Last `limit` lines of a service log, for failure diagnostics.
pub fn log_tail(path: &Path, limit: usize) -> Vec<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let skip = lines.len().saturating_sub(limit);
    lines[skip..].iter().map(|line| line.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthExpect;

    fn test_def(args: &[&str], pattern: &str) -> ServiceDefinition {
        ServiceDefinition {
            name: "svc",
            program: PathBuf::from("/bin/sh"),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            working_dir: None,
            env: Vec::new(),
            orphan_pattern: Regex::new(pattern).unwrap(),
            health: HealthCheckTarget {
                url: "http://127.0.0.1:1/health".to_string(),
                expect: HealthExpect::Success,
                interval: Duration::from_millis(10),
                timeout: Duration::from_millis(10),
            },
        }
    }

    #[test]
    fn spawn_records_pid_and_rejects_second_spawn() {
        let logs = tempfile::tempdir().unwrap();
        let def = test_def(&["-c", "sleep 30"], "never-matches-anything-5a81");

        let mut managed = spawn(&def, logs.path()).unwrap();
        assert!(pid_path(logs.path(), "svc").exists());
        assert!(log_path(logs.path(), "svc").exists());

        match spawn(&def, logs.path()) {
            Err(LauncherError::AlreadyRunning { pid, .. }) => assert_eq!(pid, managed.pid()),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }

        let outcome = terminate(
            "svc",
            &def.orphan_pattern,
            logs.path(),
            false,
            Duration::from_secs(5),
        );
        assert_eq!(outcome, TerminationOutcome::Terminated { pid: managed.pid() });
        assert!(!pid_path(logs.path(), "svc").exists());
        let _ = managed.child.wait();
    }

    #[test]
    fn stale_record_is_cleared_and_reported() {
        let logs = tempfile::tempdir().unwrap();
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let record = PidRecord {
            pid,
            command: "true".to_string(),
            started_at_unix: 0,
        };
        fs::write(
            pid_path(logs.path(), "svc"),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();

        let pattern = Regex::new("never-matches-anything-5a81").unwrap();
        let outcome = terminate("svc", &pattern, logs.path(), false, Duration::from_secs(1));
        assert_eq!(outcome, TerminationOutcome::AlreadyStopped { pid });
        assert!(!pid_path(logs.path(), "svc").exists());
    }

    #[test]
    fn spawn_replaces_a_stale_record() {
        let logs = tempfile::tempdir().unwrap();
        fs::create_dir_all(logs.path()).unwrap();
        let mut child = Command::new("true").spawn().unwrap();
        let stale_pid = child.id();
        child.wait().unwrap();

        let record = PidRecord {
            pid: stale_pid,
            command: "true".to_string(),
            started_at_unix: 0,
        };
        fs::write(
            pid_path(logs.path(), "svc"),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();

        let def = test_def(&["-c", "sleep 30"], "never-matches-anything-5a81");
        let mut managed = spawn(&def, logs.path()).unwrap();
        assert_ne!(managed.pid(), stale_pid);

        terminate(
            "svc",
            &def.orphan_pattern,
            logs.path(),
            true,
            Duration::from_secs(5),
        );
        let _ = managed.child.wait();
    }

    #[test]
    fn terminate_without_record_reports_not_running() {
        let logs = tempfile::tempdir().unwrap();
        let pattern = Regex::new("never-matches-anything-5a81").unwrap();
        let outcome = terminate("svc", &pattern, logs.path(), false, Duration::from_secs(1));
        assert_eq!(outcome, TerminationOutcome::NotRunning);
    }

    #[test]
    fn sigterm_ignoring_child_times_out_then_dies_under_force() {
        let logs = tempfile::tempdir().unwrap();
        let def = test_def(
            &["-c", "trap '' TERM; sleep 10"],
            "never-matches-anything-5a81",
        );

        let mut managed = spawn(&def, logs.path()).unwrap();
        let pid = managed.pid();
        // give the shell a beat to install the trap
        sleep(Duration::from_millis(200));

        let outcome = terminate(
            "svc",
            &def.orphan_pattern,
            logs.path(),
            false,
            Duration::from_millis(500),
        );
        assert_eq!(outcome, TerminationOutcome::GracefulShutdownTimeout { pid });
        assert!(pid_path(logs.path(), "svc").exists());
        assert!(pid_alive(pid));

        let outcome = terminate(
            "svc",
            &def.orphan_pattern,
            logs.path(),
            true,
            Duration::from_millis(500),
        );
        assert_eq!(outcome, TerminationOutcome::Forced { pid });
        assert!(!pid_path(logs.path(), "svc").exists());
        let _ = managed.child.wait();
        assert!(!pid_alive(pid));
    }

    #[test]
    fn orphan_discovery_reports_then_kills() {
        let logs = tempfile::tempdir().unwrap();
        let pattern = Regex::new(r"sleep 31\.7305").unwrap();

        // launched behind the supervisor's back: no pid record
        let mut stray = Command::new("/bin/sh")
            .args(["-c", "sleep 31.7305"])
            .spawn()
            .unwrap();
        sleep(Duration::from_millis(200));

        let outcome = terminate("svc", &pattern, logs.path(), false, Duration::from_secs(1));
        match outcome {
            TerminationOutcome::Orphans { pids, killed: false } => {
                assert!(pids.contains(&stray.id()))
            }
            other => panic!("expected an orphan report, got {other:?}"),
        }
        assert!(pid_alive(stray.id()));

        let outcome = terminate("svc", &pattern, logs.path(), true, Duration::from_secs(1));
        assert!(matches!(
            outcome,
            TerminationOutcome::Orphans { killed: true, .. }
        ));
        let _ = stray.wait();
    }

    #[test]
    fn log_tail_returns_the_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.log");
        fs::write(&path, "one\ntwo\nthree\nfour\n").unwrap();
        assert_eq!(log_tail(&path, 2), vec!["three", "four"]);
        assert_eq!(log_tail(&path, 10).len(), 4);
        assert!(log_tail(&dir.path().join("missing.log"), 2).is_empty());
    }
}
