//! Entrypoint of the storage cell daemon.

use std::{net::SocketAddr, sync::Arc};

use cell::CellDelegate;
use clap::Parser;
use observability_deps::tracing::{error, info};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[clap(name = "celld", about = "A fixed-budget in-memory storage cell")]
struct Config {
    /// Port the cell API listens on.
    #[clap(long = "cell-port", env = "CELL_PORT", default_value = "7777")]
    cell_port: u16,

    /// The cell's payload byte budget.
    #[clap(long = "cell-capacity", env = "CELL_CAPACITY", default_value = "100")]
    cell_capacity: u64,

    /// Logging filter directives.
    #[clap(long = "log-filter", env = "LOG_FILTER", default_value = "info")]
    log_filter: String,
}

fn init_logging(filter: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    let config = Config::parse();
    init_logging(&config.log_filter);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.cell_port));
    let delegate = Arc::new(CellDelegate::new(config.cell_capacity));

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    info!(capacity = config.cell_capacity, "storage cell starting");
    if let Err(e) = cell::serve(addr, delegate, shutdown).await {
        error!(error = %e, "cell server failed");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
