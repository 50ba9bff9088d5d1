mod app;
mod cache;
mod config;
mod connectivity;
mod db;
mod gate;
mod permission;
mod queue;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::queue::{OperationId, OperationKind};

#[derive(Parser, Debug)]
#[command(name = "stockroom")]
#[command(about = "Offline cache and pending-operation sync for the stockroom inventory app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/stockroom/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Watch connectivity and sync queued operations until Ctrl-C
  Run,
  /// Sync queued operations now
  Sync,
  /// Queue an operation for the backend
  Enqueue {
    #[arg(short, long, value_enum)]
    kind: OperationKind,
    /// Target table
    #[arg(short, long)]
    entity: String,
    /// JSON payload
    #[arg(short, long)]
    payload: String,
    /// Explicit operation id
    #[arg(long)]
    id: Option<OperationId>,
  },
  /// List queued and failed operations
  Queue,
  /// Discard a failed operation
  Dismiss { id: OperationId },
  /// GET a URL through the offline cache
  Fetch {
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    html: bool,
  },
  /// Install the configured cache version
  Install,
  /// Install if needed, then activate without waiting
  Activate,
  /// List cache stores
  Caches,
  /// Request a permission, prompting at most once
  Permission {
    name: String,
    /// Forget the remembered decision
    #[arg(long)]
    forget: bool,
  },
}

/// File logging under `data_dir/logs`, plus stderr when verbose.
fn init_logging(data_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "stockroom.log"));

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with(fmt::layer().with_ansi(false).with_writer(writer))
    .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr)))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let data_dir = match &config.data_dir {
    Some(dir) => dir.clone(),
    None => db::Database::default_dir()?,
  };
  let _log_guard = init_logging(&data_dir, args.verbose)?;

  let db = db::Database::open(Some(&data_dir))?;
  let app = app::App::new(config, db)?;

  match args.command {
    Command::Run => app.run().await?,
    Command::Sync => app.sync().await?,
    Command::Enqueue {
      kind,
      entity,
      payload,
      id,
    } => app.enqueue(kind, &entity, &payload, id)?,
    Command::Queue => app.list_queue()?,
    Command::Dismiss { id } => app.dismiss(id)?,
    Command::Fetch { url, html } => app.fetch(&url, html).await?,
    Command::Install => app.install().await?,
    Command::Activate => app.activate().await?,
    Command::Caches => app.list_caches()?,
    Command::Permission { name, forget } => app.permission(&name, forget).await?,
  }

  Ok(())
}
