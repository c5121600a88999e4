mod cache;
mod classify;
mod config;
mod error;
mod host;
mod lifecycle;
mod messages;
mod network;
mod notify;
mod policy;
mod request;
mod sync;
mod worker;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::cache::{default_data_dir, SqliteStorage};
use crate::host::HostBridge;
use crate::network::HttpNetwork;
use crate::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "offline-relay")]
#[command(about = "Offline-support layer: routes requests through cache and network, syncs deferred writes")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offline-relay.yaml or $XDG_CONFIG_HOME/offline-relay/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Directory for the cache database and logs (default: $XDG_DATA_HOME/offline-relay)
  #[arg(short, long)]
  data_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let data_dir = match args.data_dir {
    Some(dir) => dir,
    None => default_data_dir()?,
  };
  let _log_guard = init_tracing(&data_dir)?;

  let storage = SqliteStorage::open(&SqliteStorage::default_path(Some(&data_dir))?)?;
  let network = HttpNetwork::new(&config.network)?;
  let bridge = Arc::new(HostBridge::stdout());

  tracing::info!(
    "Starting {} {} for {}",
    config.app_name,
    config.version,
    config.origin
  );

  let worker = Arc::new(Worker::new(
    config,
    Arc::new(storage),
    Arc::new(network),
    bridge.clone(),
  ));
  host::run(worker, bridge, tokio::io::stdin()).await
}

/// Log to a daily file in the data directory; stdout carries the host protocol.
fn init_tracing(data_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(data_dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(data_dir, "offline-relay.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter =
    EnvFilter::try_from_env("OFFLINE_RELAY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
