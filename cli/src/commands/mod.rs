//! CLI command definitions and dispatch.

mod lock;
mod pull;
mod push;
mod unwrap;
mod verify;
mod version;
mod wrap;

use std::path::PathBuf;
use std::sync::Arc;

use chartwrap_core::{EventEmitter, LogLevel, WrapConfig, WrapError};
use chartwrap_engine::{OciRegistry, RegistryAuth, Workflow};
use clap::{Args, Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::output;

/// chartwrap - wrap Helm charts and their images for air-gapped registries.
#[derive(Parser)]
#[command(name = "chartwrap", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags accepted by every command. They override the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// YAML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Chart.yaml annotation listing the chart's images
    #[arg(long, global = true)]
    pub annotations_key: Option<String>,

    /// Skip TLS certificate verification when talking to registries
    #[arg(long, global = true)]
    pub insecure: bool,

    /// Use plain HTTP instead of HTTPS to talk to registries
    #[arg(long, global = true)]
    pub plain_http: bool,

    /// Keep the scratch directory instead of deleting it on exit
    #[arg(long, global = true)]
    pub keep_artifacts: bool,

    /// Log level (debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Attempts per image transfer
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Generate Images.lock for a chart
    Lock(lock::LockArgs),
    /// Check Images.lock against the chart's declared images
    Verify(verify::VerifyArgs),
    /// Pull the locked images into the chart's image cache
    Pull(pull::PullArgs),
    /// Push the cached images to a registry
    Push(push::PushArgs),
    /// Lock, pull and pack a chart into a bundle
    Wrap(wrap::WrapArgs),
    /// Unpack a bundle and push its images
    Unwrap(unwrap::UnwrapArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Build the effective configuration: defaults, then the config file, then flags.
pub fn load_config(global: &GlobalArgs) -> Result<WrapConfig, Box<dyn std::error::Error>> {
    let mut config = match global.config {
        Some(ref path) => WrapConfig::from_file(path)?,
        None => WrapConfig::default(),
    };
    if let Some(ref key) = global.annotations_key {
        config.lock.annotations_key = key.clone();
    }
    if global.insecure {
        config.registry.insecure = true;
    }
    if global.plain_http {
        config.registry.plain_http = true;
    }
    if global.keep_artifacts {
        config.keep_artifacts = true;
    }
    if let Some(max_retries) = global.max_retries {
        config.transfer.max_retries = max_retries;
    }
    if let Some(level) = global.log_level {
        config.log_level = level;
    }
    Ok(config)
}

/// Per-command runtime state: the workflow plus its progress printer.
pub(crate) struct Session {
    pub workflow: Workflow,
    printer: JoinHandle<()>,
    _work_dir: tempfile::TempDir,
}

impl Session {
    pub fn new(config: WrapConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let registry = Arc::new(OciRegistry::new(&config.registry, RegistryAuth::from_env()));
        let events = EventEmitter::default();
        let printer = output::spawn_printer(events.subscribe());
        let work_dir = tempfile::Builder::new()
            .prefix("chartwrap-")
            .keep(config.keep_artifacts)
            .tempdir()?;
        if config.keep_artifacts {
            tracing::info!(path = %work_dir.path().display(), "Keeping intermediate artifacts");
        }

        let workflow = Workflow {
            config,
            registry,
            cancel: cancel_on_ctrl_c(),
            events,
            work_dir: work_dir.path().to_path_buf(),
        };
        Ok(Self {
            workflow,
            printer,
            _work_dir: work_dir,
        })
    }

    /// Wait for pending progress lines, then clean up the scratch directory.
    pub async fn finish(self) {
        let Session {
            workflow, printer, ..
        } = self;
        drop(workflow);
        let _ = printer.await;
    }
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            child.cancel();
        }
    });
    token
}

/// Process exit status for a failed command: 130 when it was interrupted.
pub fn exit_code(error: &(dyn std::error::Error + 'static)) -> i32 {
    match error.downcast_ref::<WrapError>() {
        Some(e) if e.is_cancelled() => 130,
        _ => 1,
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: WrapConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Lock(args) => lock::execute(args, config).await,
        Command::Verify(args) => verify::execute(args, config).await,
        Command::Pull(args) => pull::execute(args, config).await,
        Command::Push(args) => push::execute(args, config).await,
        Command::Wrap(args) => wrap::execute(args, config).await,
        Command::Unwrap(args) => unwrap::execute(args, config).await,
        Command::Version(args) => version::execute(args).await,
    }
}
