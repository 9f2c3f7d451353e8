//! roostd entry point: configuration, logging, signals.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use roost_config::ConfigLoader;
use roost_store::Store;
use roostd::{DaemonCore, HostSeams};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// The Roost node daemon.
#[derive(Parser, Debug)]
#[command(name = "roostd", version, about)]
struct Args {
    /// Path to the daemon configuration file.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Force debug-level logging.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_file(path);
    }
    let config = loader.load().context("loading configuration")?;

    let log_handle = roostd::logging::init(&config, args.debug)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.node.hostname,
        "roostd starting"
    );

    let seams = HostSeams::system(&config);
    let store = Arc::new(Store::new());
    let core = DaemonCore::start(config, store, seams)
        .await
        .context("daemon startup failed")?;

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut hup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = term.recv() => break,
            _ = int.recv() => break,
            _ = quit.recv() => break,
            _ = hup.recv() => {
                info!("rotating log files");
                if let Err(error) = log_handle.rotate() {
                    warn!(%error, "log rotation failed");
                }
            }
        }
    }

    core.shutdown().await;
    Ok(())
}
