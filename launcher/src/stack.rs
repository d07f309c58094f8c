//! Ordered start/stop of the serving stack: TabbyAPI first, the Open WebUI
//! container second, reversed on the way down. A failed mandatory service
//! aborts the sequence; nothing already running is rolled back.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;

use crate::health::{self, HealthCheckTarget, HealthExpect, ReadyOutcome};
use crate::models;
use crate::supervisor::{self, log_tail, ServiceDefinition, TerminationOutcome};
use crate::{Args, LauncherError};

/// Service identifier for the inference server; pid and log files carry it.
pub const INFERENCE_SERVICE: &str = "tabby-api";

/// Model loading is slow, probing faster buys nothing.
const INFERENCE_POLL: Duration = Duration::from_secs(5);
const WEBUI_POLL: Duration = Duration::from_secs(2);
const WEBUI_TIMEOUT: Duration = Duration::from_secs(120);

/// Log lines surfaced when a service fails to come up.
const LOG_TAIL_LINES: usize = 15;

/// Per-request budget for one health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything `start` needs must exist before the first side effect.
fn check_start_preconditions(args: &Args) -> Result<(), LauncherError> {
    if !args.tabby_dir.is_dir() {
        return Err(LauncherError::Precondition(format!(
            "TabbyAPI checkout not found at {}; run `setup` first",
            args.tabby_dir.display()
        )));
    }
    let python = args.tabby_dir.join("venv/bin/python");
    if !python.is_file() {
        return Err(LauncherError::Precondition(format!(
            "virtualenv python not found at {}; run `setup` first",
            python.display()
        )));
    }
    let marker = models::artifact_dir(&args.models_dir, &args.model_repo, &args.model_revision)
        .join(models::MARKER_FILE);
    if !marker.exists() {
        return Err(LauncherError::Precondition(format!(
            "model {} ({}) not found at {}; run `setup download-model {} {}`",
            args.model_repo,
            args.model_revision,
            marker.display(),
            args.model_repo,
            args.model_revision
        )));
    }
    Ok(())
}

fn inference_orphan_pattern(args: &Args) -> Regex {
    let dir_name = args
        .tabby_dir
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("tabbyapi");
    Regex::new(&format!(
        r"{}/venv/bin/python main\.py",
        regex::escape(dir_name)
    ))
    .expect("escaped directory name is a valid regex")
}

fn inference_definition(args: &Args) -> Result<ServiceDefinition, LauncherError> {
    let program = fs::canonicalize(args.tabby_dir.join("venv/bin/python"))?;
    let model_dir = fs::canonicalize(&args.models_dir)?;
    Ok(ServiceDefinition {
        name: INFERENCE_SERVICE,
        program,
        args: vec![
            "main.py".to_string(),
            "--port".to_string(),
            args.inference_port.to_string(),
            "--model-dir".to_string(),
            model_dir.to_string_lossy().into_owned(),
        ],
        working_dir: Some(args.tabby_dir.clone()),
        // TabbyAPI buffers its logs otherwise
        env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
        orphan_pattern: inference_orphan_pattern(args),
        health: HealthCheckTarget {
            url: format!("http://127.0.0.1:{}/health", args.inference_port),
            expect: HealthExpect::Status("healthy".to_string()),
            interval: INFERENCE_POLL,
            timeout: Duration::from_secs(args.startup_timeout),
        },
    })
}

pub fn start_all(args: &Args, no_webui: bool, running: &AtomicBool) -> Result<(), LauncherError> {
    check_start_preconditions(args)?;
    let def = inference_definition(args)?;
    let client = Client::builder().timeout(PROBE_TIMEOUT).build()?;

    let mut managed = supervisor::spawn(&def, &args.logs_dir)?;
    tracing::info!("Waiting for {INFERENCE_SERVICE} to load the model...");
    match health::wait_ready(
        &client,
        INFERENCE_SERVICE,
        &def.health,
        Some(&mut managed),
        running,
    ) {
        ReadyOutcome::Ready { elapsed } => {
            tracing::info!("{INFERENCE_SERVICE} (pid {}) ready in {elapsed:?}", managed.pid());
        }
        ReadyOutcome::TimedOut { elapsed } => {
            tracing::error!(
                "{INFERENCE_SERVICE} not ready after {elapsed:?}; the process is left running"
            );
            surface_log_tail(&managed.log_path);
            return Err(LauncherError::StartupTimeout {
                service: INFERENCE_SERVICE.to_string(),
                timeout: args.startup_timeout,
            });
        }
        ReadyOutcome::ProcessExited => {
            tracing::error!(
                "{} exited {:?} after being spawned",
                managed.name,
                managed.started_at.elapsed()
            );
            surface_log_tail(&managed.log_path);
            supervisor::clear_record(&args.logs_dir, INFERENCE_SERVICE);
            return Err(LauncherError::ProcessExited {
                service: INFERENCE_SERVICE.to_string(),
            });
        }
        ReadyOutcome::Interrupted => {
            tracing::warn!("Interrupted; {INFERENCE_SERVICE} keeps starting in the background");
            return Ok(());
        }
    }

    let mut webui_started = false;
    if no_webui {
        tracing::info!("Skipping the Open WebUI container");
    } else if !docker_available() {
        // The UI is optional, a missing container runtime is not fatal
        tracing::warn!("docker is not available, skipping the Open WebUI container");
    } else {
        webui_up(args)?;
        let target = HealthCheckTarget {
            url: format!("http://127.0.0.1:{}/health", args.webui_port),
            expect: HealthExpect::Success,
            interval: WEBUI_POLL,
            timeout: WEBUI_TIMEOUT,
        };
        match health::wait_ready(&client, &args.webui_container, &target, None, running) {
            ReadyOutcome::Ready { elapsed } => {
                tracing::info!("{} ready in {elapsed:?}", args.webui_container);
                webui_started = true;
            }
            ReadyOutcome::Interrupted => {
                tracing::warn!(
                    "Interrupted; the {} container keeps starting in the background",
                    args.webui_container
                );
                return Ok(());
            }
            // The container runs without a child handle, so the only other
            // way out of the wait is the timeout.
            _ => {
                tracing::error!(
                    "{} not ready after {}s; inspect it with `docker logs {}`",
                    args.webui_container,
                    WEBUI_TIMEOUT.as_secs(),
                    args.webui_container
                );
                return Err(LauncherError::StartupTimeout {
                    service: args.webui_container.clone(),
                    timeout: WEBUI_TIMEOUT.as_secs(),
                });
            }
        }
    }

    tracing::info!(
        "{INFERENCE_SERVICE}: http://127.0.0.1:{} (OpenAI API under /v1)",
        args.inference_port
    );
    if webui_started {
        tracing::info!("{}: http://127.0.0.1:{}", args.webui_container, args.webui_port);
    }
    tracing::info!("Logs: {}", managed.log_path.display());
    Ok(())
}

pub fn stop_all(args: &Args, force: bool) -> Result<(), LauncherError> {
    // Reverse start order: the UI depends on the API, it goes first.
    if docker_available() {
        webui_down(args)?;
    } else {
        tracing::info!("docker is not available, no Open WebUI container to stop");
    }

    let outcome = supervisor::terminate(
        INFERENCE_SERVICE,
        &inference_orphan_pattern(args),
        &args.logs_dir,
        force,
        Duration::from_secs(args.shutdown_grace),
    );
    match outcome {
        TerminationOutcome::NotRunning => {
            tracing::info!("{INFERENCE_SERVICE} is not running");
        }
        TerminationOutcome::AlreadyStopped { pid } => {
            tracing::info!("{INFERENCE_SERVICE} (pid {pid}) was already stopped");
        }
        TerminationOutcome::Terminated { .. } | TerminationOutcome::Forced { .. } => {}
        TerminationOutcome::GracefulShutdownTimeout { pid } => {
            return Err(LauncherError::GracefulShutdownTimeout {
                service: INFERENCE_SERVICE.to_string(),
                pid,
                grace: args.shutdown_grace,
            });
        }
        TerminationOutcome::Orphans { pids, killed: false } => {
            return Err(LauncherError::Orphans {
                service: INFERENCE_SERVICE.to_string(),
                pids,
            });
        }
        TerminationOutcome::Orphans { pids, killed: true } => {
            tracing::info!("Killed untracked {INFERENCE_SERVICE} processes {pids:?}");
        }
    }
    Ok(())
}

fn surface_log_tail(log_path: &Path) {
    let lines = log_tail(log_path, LOG_TAIL_LINES);
    if lines.is_empty() {
        return;
    }
    tracing::error!("Last lines of {}:", log_path.display());
    for line in lines {
        tracing::error!("  {line}");
    }
}

/// `docker version` with a server format probes both the CLI and a
/// reachable daemon.
pub(crate) fn docker_available() -> bool {
    Command::new("docker")
        .args(["version", "--format", "{{.Server.Version}}"])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Some(running) when the container exists, None when it does not.
fn container_running(name: &str) -> Option<bool> {
    let output = Command::new("docker")
        .args(["inspect", "--format", "{{.State.Running}}", name])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim() == "true")
}

fn webui_up(args: &Args) -> Result<(), LauncherError> {
    match container_running(&args.webui_container) {
        Some(true) => {
            tracing::info!("{} container is already running", args.webui_container);
            Ok(())
        }
        Some(false) => {
            tracing::info!("Starting the existing {} container", args.webui_container);
            run_docker("docker start", &["start".into(), args.webui_container.clone()])
        }
        None => {
            tracing::info!(
                "Creating the {} container from {}",
                args.webui_container,
                args.webui_image
            );
            let api_base = format!("http://host.docker.internal:{}/v1", args.inference_port);
            run_docker(
                "docker run",
                &[
                    "run".into(),
                    "-d".into(),
                    "--name".into(),
                    args.webui_container.clone(),
                    "-p".into(),
                    format!("{}:8080", args.webui_port),
                    "--add-host".into(),
                    "host.docker.internal:host-gateway".into(),
                    "-e".into(),
                    format!("OPENAI_API_BASE_URL={api_base}"),
                    "-v".into(),
                    format!("{}:/app/backend/data", args.webui_container),
                    args.webui_image.clone(),
                ],
            )
        }
    }
}

fn webui_down(args: &Args) -> Result<(), LauncherError> {
    match container_running(&args.webui_container) {
        Some(true) => {
            tracing::info!("Stopping the {} container", args.webui_container);
            run_docker("docker stop", &["stop".into(), args.webui_container.clone()])
        }
        Some(false) | None => {
            tracing::info!("{} container is not running", args.webui_container);
            Ok(())
        }
    }
}

fn run_docker(step: &str, docker_args: &[String]) -> Result<(), LauncherError> {
    let output = Command::new("docker").args(docker_args).output()?;
    if output.status.success() {
        return Ok(());
    }
    tracing::error!("{}", String::from_utf8_lossy(&output.stderr).trim());
    Err(LauncherError::CommandFailed {
        step: step.to_string(),
        status: output.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_args(root: &Path) -> Args {
        Args {
            inference_port: 5000,
            webui_port: 3000,
            startup_timeout: 300,
            shutdown_grace: 30,
            model_repo: "org/Model-Name".to_string(),
            model_revision: "6_5".to_string(),
            tabby_dir: root.join("tabbyapi"),
            models_dir: root.join("models"),
            logs_dir: root.join("logs"),
            webui_image: "ghcr.io/open-webui/open-webui:main".to_string(),
            webui_container: "open-webui".to_string(),
            hf_cli: "huggingface-cli".to_string(),
            json_output: false,
            env: false,
        }
    }

    fn materialize(args: &Args) {
        fs::create_dir_all(args.tabby_dir.join("venv/bin")).unwrap();
        fs::write(args.tabby_dir.join("venv/bin/python"), "").unwrap();
        let model = models::artifact_dir(&args.models_dir, &args.model_repo, &args.model_revision);
        fs::create_dir_all(&model).unwrap();
        fs::write(model.join(models::MARKER_FILE), "{}").unwrap();
    }

    #[test]
    fn missing_checkout_is_named_in_the_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = check_start_preconditions(&test_args(tmp.path())).unwrap_err();
        match err {
            LauncherError::Precondition(msg) => {
                assert!(msg.contains("tabbyapi"), "unexpected message: {msg}")
            }
            other => panic!("expected Precondition, got {other:?}"),
        }
    }

    #[test]
    fn missing_model_is_named_in_the_error() {
        let tmp = tempfile::tempdir().unwrap();
        let args = test_args(tmp.path());
        fs::create_dir_all(args.tabby_dir.join("venv/bin")).unwrap();
        fs::write(args.tabby_dir.join("venv/bin/python"), "").unwrap();

        let err = check_start_preconditions(&args).unwrap_err();
        match err {
            LauncherError::Precondition(msg) => {
                assert!(msg.contains("org/Model-Name"), "unexpected message: {msg}");
                assert!(msg.contains("download-model"), "unexpected message: {msg}");
            }
            other => panic!("expected Precondition, got {other:?}"),
        }
    }

    #[test]
    fn preconditions_pass_once_everything_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let args = test_args(tmp.path());
        materialize(&args);
        check_start_preconditions(&args).unwrap();
    }

    #[test]
    fn orphan_pattern_matches_the_venv_python_cmdline() {
        let args = test_args(&PathBuf::from("/srv/stack"));
        let pattern = inference_orphan_pattern(&args);
        assert!(pattern.is_match(
            "/srv/stack/tabbyapi/venv/bin/python main.py --port 5000 --model-dir /srv/stack/models"
        ));
        assert!(!pattern.is_match("/usr/bin/python3 manage.py runserver"));
    }

    #[test]
    fn start_aborts_when_the_server_exits_during_startup() {
        use std::os::unix::fs::PermissionsExt;
        use std::sync::atomic::AtomicBool;

        let tmp = tempfile::tempdir().unwrap();
        let mut args = test_args(tmp.path());
        // nothing should be listening here
        args.inference_port = 59785;
        materialize(&args);

        // a "server" that dies right away, after one log line
        let python = args.tabby_dir.join("venv/bin/python");
        fs::write(&python, "#!/bin/sh\necho boom\nexit 7\n").unwrap();
        fs::set_permissions(&python, fs::Permissions::from_mode(0o755)).unwrap();

        let err = start_all(&args, true, &AtomicBool::new(true)).unwrap_err();
        assert!(matches!(err, LauncherError::ProcessExited { .. }));
        // the record is cleared so a retry is possible
        assert!(!args
            .logs_dir
            .join(format!("{INFERENCE_SERVICE}.pid"))
            .exists());
        let log = supervisor::log_path(&args.logs_dir, INFERENCE_SERVICE);
        assert!(log_tail(&log, 5).contains(&"boom".to_string()));
    }

    #[test]
    fn start_reports_timeout_and_leaves_the_server_running() {
        use std::os::unix::fs::PermissionsExt;
        use std::sync::atomic::AtomicBool;

        let tmp = tempfile::tempdir().unwrap();
        let mut args = test_args(tmp.path());
        // nothing should be listening here
        args.inference_port = 59786;
        args.startup_timeout = 1;
        materialize(&args);

        // a "server" that stays up without ever opening its port
        let python = args.tabby_dir.join("venv/bin/python");
        fs::write(&python, "#!/bin/sh\nsleep 30\n").unwrap();
        fs::set_permissions(&python, fs::Permissions::from_mode(0o755)).unwrap();

        let err = start_all(&args, true, &AtomicBool::new(true)).unwrap_err();
        assert!(matches!(err, LauncherError::StartupTimeout { .. }));
        // left for the operator to inspect, record intact
        assert!(args
            .logs_dir
            .join(format!("{INFERENCE_SERVICE}.pid"))
            .exists());

        let outcome = supervisor::terminate(
            INFERENCE_SERVICE,
            &inference_orphan_pattern(&args),
            &args.logs_dir,
            true,
            Duration::from_secs(5),
        );
        assert!(matches!(
            outcome,
            TerminationOutcome::Terminated { .. } | TerminationOutcome::Forced { .. }
        ));
    }

    #[test]
    fn inference_definition_carries_port_and_health_target() {
        let tmp = tempfile::tempdir().unwrap();
        let args = test_args(tmp.path());
        materialize(&args);

        let def = inference_definition(&args).unwrap();
        assert_eq!(def.name, INFERENCE_SERVICE);
        assert!(def.args.contains(&"5000".to_string()));
        assert_eq!(def.working_dir, Some(args.tabby_dir.clone()));
        assert_eq!(def.health.url, "http://127.0.0.1:5000/health");
        assert_eq!(def.health.expect, HealthExpect::Status("healthy".to_string()));
        assert_eq!(def.health.timeout, Duration::from_secs(300));
    }
}
