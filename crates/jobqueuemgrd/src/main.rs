//! jobqueuemgrd entry point.
//!
//! Loads the manifest and reconciler configuration, then applies or
//! destroys every queue once. Ctrl-C cancels in-flight waits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use converge_common::ReconcilerConfig;
use converge_jobqueuemgrd::{build_reconciler, JobQueueMgr, Manifest, SimulatedBatch, DEFAULT_SETTLE_PROBES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    /// Create or update every queue in the manifest
    Apply,
    /// Disable and delete every queue in the manifest
    Destroy,
}

/// Batch job queue manager
#[derive(Parser, Debug)]
#[command(name = "jobqueuemgrd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// What to do with the manifest's queues
    #[arg(value_enum)]
    action: Action,

    /// Job queue manifest (YAML)
    #[arg(short = 'm', long)]
    manifest: PathBuf,

    /// Reconciler configuration (YAML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Describe calls before a simulated queue settles
    #[arg(long, default_value_t = DEFAULT_SETTLE_PROBES)]
    settle_probes: u32,
}

fn init_logging(log_level: &str, json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true).json())
            .init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ReconcilerConfig> {
    match path {
        Some(path) => Ok(ReconcilerConfig::from_file(path)?),
        None => Ok(ReconcilerConfig::default()),
    }
}

async fn run(args: Args) -> anyhow::Result<bool> {
    let manifest = Manifest::from_file(&args.manifest)?;
    let config = load_config(args.config.as_ref())?;
    info!("Loaded {} job queues from {}", manifest.len(), args.manifest.display());

    let client = Arc::new(SimulatedBatch::new(args.settle_probes));
    let mgr = JobQueueMgr::new(build_reconciler(client, &config)?);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight reconciliations");
            on_signal.cancel();
        }
    });

    let summary = match args.action {
        Action::Apply => mgr.apply(&manifest, &cancel).await,
        Action::Destroy => mgr.destroy(&manifest, &cancel).await,
    };
    summary.log();
    Ok(summary.is_success())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs);

    info!("--- Starting jobqueuemgrd ({:?}) ---", args.action);

    match run(args).await {
        Ok(true) => {
            info!("jobqueuemgrd exiting normally");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            warn!("jobqueuemgrd finished with unconverged queues");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("jobqueuemgrd error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
