use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

mod env_runtime;
mod health;
mod models;
mod setup;
mod stack;
mod supervisor;

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
    #[clap(flatten)]
    args: Args,
}

#[derive(clap::Args, Debug, Clone)]
struct Args {
    /// Port the TabbyAPI server listens on
    #[clap(default_value = "5000", long, env, global = true)]
    pub(crate) inference_port: u16,
    /// Host port published for the Open WebUI container
    #[clap(default_value = "3000", long, env, global = true)]
    pub(crate) webui_port: u16,
    /// Seconds to wait for the inference server to load its model
    #[clap(default_value = "300", long, env, global = true)]
    pub(crate) startup_timeout: u64,
    /// Seconds a stopping process gets between SIGTERM and escalation
    #[clap(default_value = "30", long, env, global = true)]
    pub(crate) shutdown_grace: u64,
    /// Hub repository of the default model
    #[clap(
        default_value = "turboderp/Llama-3.1-8B-Instruct-exl2",
        long,
        env,
        global = true
    )]
    pub(crate) model_repo: String,
    /// Quantization revision tag of the default model
    #[clap(default_value = "6_5", long, env, global = true)]
    pub(crate) model_revision: String,
    /// TabbyAPI checkout directory
    #[clap(default_value = "tabbyapi", long, env, global = true)]
    pub(crate) tabby_dir: PathBuf,
    /// Directory model artifacts are downloaded into
    #[clap(default_value = "models", long, env, global = true)]
    pub(crate) models_dir: PathBuf,
    /// Directory holding service logs and pid records
    #[clap(default_value = "logs", long, env, global = true)]
    pub(crate) logs_dir: PathBuf,
    /// Open WebUI image
    #[clap(
        default_value = "ghcr.io/open-webui/open-webui:main",
        long,
        env,
        global = true
    )]
    pub(crate) webui_image: String,
    /// Open WebUI container name
    #[clap(default_value = "open-webui", long, env, global = true)]
    pub(crate) webui_container: String,
    /// Download client invoked by the model gate
    #[clap(default_value = "huggingface-cli", long, env, global = true)]
    pub(crate) hf_cli: String,
    /// Emit logs as JSON
    #[clap(long, env, global = true)]
    pub(crate) json_output: bool,
    /// Report the runtime environment before running the command
    #[clap(long, env, global = true)]
    pub(crate) env: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start TabbyAPI, then the Open WebUI container
    Start {
        /// Leave the Open WebUI container out
        #[clap(long)]
        no_webui: bool,
    },
    /// Stop the Open WebUI container, then TabbyAPI
    Stop {
        /// Escalate to SIGKILL when the grace period expires
        #[clap(short = 'f', long)]
        force: bool,
    },
    /// Install TabbyAPI, the Open WebUI image and the default model
    Setup {
        /// Leave the default model out
        #[clap(long)]
        skip_model: bool,
        #[clap(subcommand)]
        command: Option<SetupCommand>,
    },
}

#[derive(Subcommand, Debug)]
enum SetupCommand {
    /// Fetch one model revision through the download gate
    DownloadModel {
        /// Hub repository, e.g. turboderp/Llama-3.1-8B-Instruct-exl2
        repo: String,
        /// Revision tag, e.g. 6_5
        revision: String,
    },
}

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("{service} is already running (pid {pid})")]
    AlreadyRunning { service: String, pid: u32 },
    #[error("{service} did not become ready within {timeout}s")]
    StartupTimeout { service: String, timeout: u64 },
    #[error("{service} exited before becoming ready")]
    ProcessExited { service: String },
    #[error("{service} (pid {pid}) ignored SIGTERM for {grace}s; re-run with --force to kill it")]
    GracefulShutdownTimeout {
        service: String,
        pid: u32,
        grace: u64,
    },
    #[error("found untracked {service} process(es) {pids:?}; re-run with --force to kill them")]
    Orphans { service: String, pids: Vec<u32> },
    #[error("model download failed: {0}")]
    Download(String),
    #[error("`{step}` failed with {status}")]
    CommandFailed {
        step: String,
        status: std::process::ExitStatus,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Filter events with LOG_LEVEL
    let env_filter =
        EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));

    if cli.args.json_output {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .compact()
            .init();
    }

    if cli.args.env {
        tracing::info!("{}", env_runtime::Env::new());
    }

    // Signal handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let result = match cli.command {
        Command::Start { no_webui } => stack::start_all(&cli.args, no_webui, &running),
        Command::Stop { force } => stack::stop_all(&cli.args, force),
        Command::Setup {
            skip_model,
            command,
        } => match command {
            Some(SetupCommand::DownloadModel { repo, revision }) => models::ensure_downloaded(
                &models::resolve_client(&cli.args),
                &cli.args.models_dir,
                &repo,
                &revision,
                &running,
            )
            .map(|_| ()),
            None => setup::run(&cli.args, skip_model, &running),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
