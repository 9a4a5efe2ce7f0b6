//! Runloop CLI: drives the hook-based runner on a synthetic workload.

mod commands;
mod demo;

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Runloop: hook-driven epoch runner with best-K checkpointing
#[derive(Parser, Debug)]
#[command(name = "runloop", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train the synthetic linear-regression model
    Train(TrainArgs),
    /// Inspect or create configuration files
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
struct TrainArgs {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for checkpoints and logs
    #[arg(short, long)]
    work_dir: Option<PathBuf>,

    /// Total number of epochs
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Resume epoch, iteration, model and optimizer from a checkpoint
    #[arg(long, conflicts_with = "load_from")]
    resume_from: Option<PathBuf>,

    /// Load model weights from a checkpoint and start from epoch 0
    #[arg(long)]
    load_from: Option<PathBuf>,

    /// Initial learning rate
    #[arg(long, default_value = "0.05")]
    lr: f64,

    /// SGD momentum
    #[arg(long, default_value = "0.9")]
    momentum: f64,

    /// Number of synthetic samples
    #[arg(long, default_value = "512")]
    samples: usize,

    /// Samples per batch
    #[arg(long, default_value = "16")]
    batch_size: usize,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write an example configuration file
    Init {
        #[arg(default_value = "runloop.toml")]
        path: PathBuf,
    },
    /// Print the fully resolved configuration
    Show {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => {
            let config = commands::resolve_train_config(&args)?;
            let dist = runloop_core::distributed::init_process_group(&config.dist)?;
            let log_file = dist
                .is_master()
                .then(|| log_file_path(&config.work_dir));
            let _guard = init_tracing(cli.verbose, cli.quiet, log_file.as_deref())?;
            commands::train(&args, config, dist)?;
            Ok(())
        }
        Commands::Config { action } => {
            let _guard = init_tracing(cli.verbose, cli.quiet, None)?;
            commands::handle_config(action)
        }
    }
}

fn log_file_path(work_dir: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    work_dir.join("logs").join(format!("{stamp}.log"))
}

/// Human-readable stderr plus, when `log_file` is given, JSON lines to that file.
fn init_tracing(
    verbose: u8,
    quiet: bool,
    log_file: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let (json_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log file path has no file name"))?;
            let file_appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    Ok(guard)
}
