//! Entrypoint of the cellstore controller.
//!
//! Startup order matters: the catalog must be reachable (it is the
//! authoritative record the in-process view is rebuilt from), then the
//! scaler task starts, and only then does the external API begin accepting
//! requests.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use backoff::{Backoff, BackoffConfig};
use catalog::{
    interface::{Catalog, Error as CatalogError, InitialStatus},
    mongo::MongoCatalog,
};
use cell_client::HttpCellFleet;
use clap::Parser;
use clap_blocks::{catalog::CatalogConfig, fleet::FleetConfig, scaling::ScalingConfig};
use observability_deps::tracing::{error, info, warn};
use orchestrator::KubeApiOrchestrator;
use router::{
    placement::PlacementEngine,
    server::{serve, HttpDelegate},
};
use scaler::{Scaler, ScalerConfig};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// Workaround for "unused crate" lint false positives.
use workspace_hack as _;

#[derive(Debug, Parser)]
#[clap(name = "cellstored", about = "Elastically-scaled key/value storage controller")]
struct Config {
    #[clap(flatten)]
    catalog_config: CatalogConfig,

    #[clap(flatten)]
    fleet_config: FleetConfig,

    #[clap(flatten)]
    scaling_config: ScalingConfig,

    /// Address the external API binds to.
    #[clap(long = "api-bind", env = "API_BIND", default_value = "0.0.0.0:2222", action)]
    api_bind: SocketAddr,

    /// Logging filter directives.
    #[clap(long = "log-filter", env = "LOG_FILTER", default_value = "info", action)]
    log_filter: String,
}

#[derive(Debug, Error)]
enum StartupError {
    /// The catalog never became reachable; without it nothing is safe.
    #[error("catalog unreachable: {0}")]
    CatalogUnreachable(#[from] backoff::BackoffError<CatalogError>),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("could not read orchestrator credentials: {0}")]
    Credentials(#[from] std::io::Error),

    #[error("http server failed: {0}")]
    Server(#[from] hyper::Error),
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

    if let Err(e) = run(config).await {
        error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    // The catalog gets a bounded grace period to come up alongside this
    // process; past that the failure is fatal.
    let connect_backoff = BackoffConfig {
        init_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(10),
        base: 2.0,
        deadline: Some(Duration::from_secs(60)),
    };
    let catalog_host = config.catalog_config.db_host.clone();
    let catalog_port = config.catalog_config.db_port;
    let catalog: Arc<dyn Catalog> = Arc::new(
        Backoff::new(&connect_backoff)
            .retry_all_errors("connect to catalog", || async {
                let catalog = MongoCatalog::connect(&catalog_host, catalog_port).await?;
                catalog.setup().await?;
                Ok(catalog)
            })
            .await?,
    );

    // Reconcile the process-local view from the catalog: adopt the persisted
    // status, or initialize a fleet of one empty cell on first boot.
    let status = match catalog.get_server_status().await {
        Ok(status) => status,
        Err(CatalogError::NotInitialized) => {
            info!("no server status found - initializing a fleet of one cell");
            match catalog
                .initialize_server_status(InitialStatus {
                    cell_capacity: config.fleet_config.cell_capacity,
                    scale_up_threshold: config.scaling_config.scale_up_threshold,
                    scale_down_threshold: config.scaling_config.scale_down_threshold,
                    cell_name_prefix: config.fleet_config.cell_name_prefix.clone(),
                    cell_service_name: config.fleet_config.cell_service_name.clone(),
                })
                .await
            {
                Ok(status) => status,
                // another controller won the initialization race
                Err(CatalogError::AlreadyInitialized) => catalog.get_server_status().await?,
                Err(e) => return Err(e.into()),
            }
        }
        Err(e) => return Err(e.into()),
    };
    info!(
        cells = status.number_of_cells,
        total_space = status.total_space,
        used_space = status.used_space,
        "catalog state adopted"
    );

    let fleet = Arc::new(HttpCellFleet::new(
        config.fleet_config.addressing(),
        cell_client::DEFAULT_REQUEST_TIMEOUT,
    ));

    let token = match &config.fleet_config.orchestrator_token_file {
        Some(path) => Some(tokio::fs::read_to_string(path).await?),
        None => None,
    };
    let ca_pem = match &config.fleet_config.orchestrator_ca_file {
        Some(path) => Some(tokio::fs::read(path).await?),
        None => None,
    };
    let orchestrator = Arc::new(KubeApiOrchestrator::new(
        config.fleet_config.orchestrator_url.clone(),
        config.fleet_config.orchestrator_namespace.clone(),
        config.fleet_config.sts_name.clone(),
        token.as_deref().map(str::trim),
        ca_pem.as_deref(),
    ));

    let (scaler, scaler_handle) = Scaler::new(
        ScalerConfig::new(config.fleet_config.cell_capacity),
        Arc::clone(&catalog),
        Arc::clone(&fleet) as _,
        orchestrator as _,
    );
    let scaler_task = tokio::spawn(scaler.run());

    let placement = PlacementEngine::new(
        Arc::clone(&catalog),
        Arc::clone(&fleet) as _,
        scaler_handle,
    );
    let delegate = Arc::new(HttpDelegate::new(
        placement,
        Arc::clone(&catalog),
        fleet as _,
    ));

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    serve(config.api_bind, delegate, shutdown).await?;

    // the handles held by the placement engine are gone once serve returns,
    // letting the scaler task drain its queue and stop
    if let Err(e) = scaler_task.await {
        warn!(error = %e, "scaler task panicked during shutdown");
    }

    info!("controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
