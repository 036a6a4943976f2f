//! csd-sim: computational storage cache and scheduler simulator.
//!
//! Starts one worker thread per simulated device and exposes the control
//! plane over HTTP.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use csd_sim::config::{Cli, Config};
use csd_sim::device::simulator::Simulator;
use csd_sim::server::control_api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "csd_sim=debug,tower_http=debug"
    } else {
        "csd_sim=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("csd-sim v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        devices = config.topology.num_devices,
        partitions = config.topology.num_partitions,
        vertices = config.topology.num_vertices,
        partition_bytes = config.partition_bytes(),
        "Configuration loaded"
    );
    info!(
        edge_capacity = config.edge_cache.capacity_bytes,
        policy = ?config.edge_cache.policy,
        partial_eviction = config.edge_cache.partial_eviction,
        vertex_capacity = config.vertex_cache.capacity_bytes,
        "Cache capacities"
    );

    // Start the device workers.
    let simulator = Arc::new(Simulator::with_defaults(&config)?);
    simulator.start()?;

    let state = Arc::new(AppState {
        simulator: simulator.clone(),
        config: config.clone(),
        start_time: Instant::now(),
    });

    let app = build_router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let listen_addr = config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    let processed = tokio::task::spawn_blocking(move || simulator.shutdown()).await?;
    info!(processed, "Simulator stopped");

    Ok(())
}
