//! One-shot bootstrap: TabbyAPI checkout, its virtualenv, the download
//! client, the Open WebUI image and the default model.

use std::io::{BufRead, BufReader, ErrorKind};
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::thread;

use crate::{models, stack, Args, LauncherError};

const TABBY_REPO_URL: &str = "https://github.com/theroyallab/tabbyAPI";

pub fn run(args: &Args, skip_model: bool, running: &AtomicBool) -> Result<(), LauncherError> {
    for tool in ["git", "python3"] {
        if !tool_available(tool) {
            return Err(LauncherError::Precondition(format!(
                "{tool} is required for setup but was not found in PATH"
            )));
        }
    }

    if args.tabby_dir.is_dir() {
        tracing::info!(
            "TabbyAPI checkout already present at {}",
            args.tabby_dir.display()
        );
    } else {
        run_step(
            "git clone",
            Command::new("git")
                .args(["clone", "--depth", "1", TABBY_REPO_URL])
                .arg(&args.tabby_dir),
        )?;
    }

    let venv = args.tabby_dir.join("venv");
    if venv.join("bin/python").is_file() {
        tracing::info!("virtualenv already present at {}", venv.display());
    } else {
        run_step(
            "python3 -m venv",
            Command::new("python3").args(["-m", "venv"]).arg(&venv),
        )?;
    }

    let pip = venv.join("bin/pip");
    run_step(
        "pip install tabbyapi",
        Command::new(&pip)
            .args(["install", "--upgrade", ".[cu121]"])
            .current_dir(&args.tabby_dir),
    )?;
    run_step(
        "pip install huggingface_hub",
        Command::new(&pip).args(["install", "--upgrade", "huggingface_hub[cli,hf_transfer]"]),
    )?;

    if stack::docker_available() {
        run_step(
            "docker pull",
            Command::new("docker").args(["pull", &args.webui_image]),
        )?;
    } else {
        tracing::warn!("docker is not available; install it to get the Open WebUI front-end");
    }

    if skip_model {
        tracing::info!("Skipping the default model download");
    } else {
        models::ensure_downloaded(
            &models::resolve_client(args),
            &args.models_dir,
            &args.model_repo,
            &args.model_revision,
            running,
        )?;
    }

    tracing::info!("Setup complete; `start` will bring the stack up");
    Ok(())
}

/// Run one external setup step, forwarding its output line by line.
fn run_step(step: &str, command: &mut Command) -> Result<(), LauncherError> {
    tracing::info!("Running {step}");
    let mut child = match command.stdout(Stdio::piped()).stderr(Stdio::piped()).spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(LauncherError::Precondition(format!(
                "`{step}` failed: command not found"
            )));
        }
        Err(err) => return Err(err.into()),
    };

    let stdout = BufReader::new(child.stdout.take().unwrap());
    let out_reader = thread::spawn(move || {
        for line in stdout.lines().map_while(Result::ok) {
            tracing::info!("{line}");
        }
    });
    let stderr = BufReader::new(child.stderr.take().unwrap());
    let err_reader = thread::spawn(move || {
        for line in stderr.lines().map_while(Result::ok) {
            tracing::warn!("{line}");
        }
    });

    let status = child.wait()?;
    let _ = out_reader.join();
    let _ = err_reader.join();
    if !status.success() {
        return Err(LauncherError::CommandFailed {
            step: step.to_string(),
            status,
        });
    }
    Ok(())
}

fn tool_available(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_probe_reflects_path_lookup() {
        assert!(tool_available("true"));
        assert!(!tool_available("no-such-tool-472a"));
    }

    #[test]
    fn failing_step_carries_its_name() {
        let err = run_step("failing step", &mut Command::new("false")).unwrap_err();
        match err {
            LauncherError::CommandFailed { step, .. } => assert_eq!(step, "failing step"),
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn missing_command_is_a_precondition_error() {
        let err = run_step("ghost step", &mut Command::new("no-such-tool-472a")).unwrap_err();
        assert!(matches!(err, LauncherError::Precondition(_)));
    }
}
