//! Idempotency gate in front of the external download client: a model
//! revision that is already on disk is never fetched again.

use std::env;
use std::fs;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::thread::sleep;
use std::time::Duration;

use crate::{Args, LauncherError};

/// File whose presence marks a completed download.
pub const MARKER_FILE: &str = "config.json";

/// A locally materialized model revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    pub repo: String,
    pub revision: String,
    pub path: PathBuf,
}

/// `<models_dir>/<repo tail>_<revision>`. A different revision is a
/// different directory, never an in-place mutation.
pub fn artifact_dir(models_dir: &Path, repo: &str, revision: &str) -> PathBuf {
    let tail = repo.rsplit('/').next().unwrap_or(repo);
    models_dir.join(format!("{tail}_{revision}"))
}

/// Prefer the client `setup` installed into the TabbyAPI venv when it
/// exists; otherwise rely on PATH.
pub(crate) fn resolve_client(args: &Args) -> String {
    let venv_client = args.tabby_dir.join("venv/bin").join(&args.hf_cli);
    if venv_client.is_file() {
        return venv_client.to_string_lossy().into_owned();
    }
    args.hf_cli.clone()
}

pub fn ensure_downloaded(
    client: &str,
    models_dir: &Path,
    repo: &str,
    revision: &str,
    running: &AtomicBool,
) -> Result<ModelArtifact, LauncherError> {
    let path = artifact_dir(models_dir, repo, revision);
    let artifact = ModelArtifact {
        repo: repo.to_string(),
        revision: revision.to_string(),
        path: path.clone(),
    };

    if path.join(MARKER_FILE).exists() {
        tracing::info!("{repo} ({revision}) already present at {}", path.display());
        return Ok(artifact);
    }

    // Enter download tracing span
    let _span = tracing::span!(tracing::Level::INFO, "download").entered();

    fs::create_dir_all(&path)?;

    // Enable hf transfer for insane download speeds
    let enable_hf_transfer = env::var("HF_HUB_ENABLE_HF_TRANSFER").unwrap_or("1".to_string());

    tracing::info!("Downloading {repo} ({revision}) to {}", path.display());
    let mut download_process = match Command::new(client)
        .args(["download", repo, "--revision", revision, "--local-dir"])
        .arg(&path)
        .env("HF_HUB_ENABLE_HF_TRANSFER", enable_hf_transfer)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(process) => process,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            tracing::error!("{client} not found in PATH");
            tracing::error!("Install it with `pip install \"huggingface_hub[cli]\"` or run `setup`");
            return Err(LauncherError::Download(format!(
                "{client} not found in PATH"
            )));
        }
        Err(err) => return Err(err.into()),
    };

    let stdout = BufReader::new(download_process.stdout.take().unwrap());
    thread::spawn(move || {
        for line in stdout.lines().map_while(Result::ok) {
            tracing::info!("{line}");
        }
    });

    // We read stderr in another thread as it seems that lines() can block in some cases
    let stderr = BufReader::new(download_process.stderr.take().unwrap());
    let (err_sender, err_receiver) = mpsc::channel();
    thread::spawn(move || {
        for line in stderr.lines().map_while(Result::ok) {
            err_sender.send(line).unwrap_or(());
        }
    });

    loop {
        if let Some(status) = download_process.try_wait()? {
            if status.success() {
                break;
            }
            let mut err = String::new();
            while let Ok(line) = err_receiver.recv_timeout(Duration::from_millis(10)) {
                err = err + "\n" + &line;
            }
            tracing::error!("Download encountered an error: {err}");
            return Err(LauncherError::Download(format!(
                "{client} exited with {status}"
            )));
        }
        if !running.load(Ordering::SeqCst) {
            tracing::info!("Interrupted, terminating the download");
            download_process.kill()?;
            download_process.wait()?;
            return Err(LauncherError::Download(
                "interrupted before completion".to_string(),
            ));
        }
        sleep(Duration::from_millis(100));
    }

    // A client that exits zero without materializing the marker still counts
    // as a failed download.
    if !path.join(MARKER_FILE).exists() {
        return Err(LauncherError::Download(format!(
            "{} missing after downloading {repo} ({revision})",
            path.join(MARKER_FILE).display()
        )));
    }

    tracing::info!("Successfully downloaded {repo} ({revision})");
    Ok(artifact)
}
