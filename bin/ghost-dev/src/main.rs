//! `ghost-dev`: a single-process exerciser of the Ghost control plane.
//!
//! Runs a daemon-side stack (bus, communication server, supervisor) and a
//! sample worker's connection agent in the same process, so the full
//! register → heartbeat → command round trip can be watched locally without
//! a separate `ghostd` process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use ghost_agent::{CommandRequest, ConnectionAgent};
use ghost_bus::InMemoryBus;
use ghost_common::ProcessInfo;
use ghost_config::AppConfig;
use ghost_daemon::{CommunicationServer, PeerRegistry, Supervisor, DAEMON_SELF_ID};
use ghost_store::{DataStore, InMemoryStore};

const SAMPLE_WORKER_ID: &str = "ghost-dev-sample-worker";

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        ghost_common::logging::pre_init_log(&format!("no .env file loaded: {e}"));
    }
    ghost_common::logging::init_logging("ghost-dev");

    let config = AppConfig::load().context("loading ghost-dev configuration")?;
    info!("starting ghost-dev");

    let bus = Arc::new(InMemoryBus::new());
    let registry = Arc::new(PeerRegistry::new());
    let store: Arc<dyn DataStore> = Arc::new(InMemoryStore::new());

    let supervisor = Supervisor::with_store(
        bus.clone(),
        registry.clone(),
        config.daemon.stop_grace_period(),
        Some(store),
    );
    let supervisor_handle = supervisor.clone().start().await?;

    let comm_server = Arc::new(CommunicationServer::new(
        bus.clone(),
        registry.clone(),
        config.daemon.staleness_threshold_secs as i64,
        config.daemon.staleness_scan_interval(),
    ));
    let comm_handles = comm_server.clone().start().await?;

    let worker = ConnectionAgent::new(
        sample_worker_info(),
        bus.clone(),
        config.agent.clone(),
        &config.queue,
        DAEMON_SELF_ID,
        None,
        false,
    );
    worker.start_reporting().await?;

    let exerciser_handle = tokio::spawn(run_exerciser(worker.clone()));

    info!("ghost-dev started, press Ctrl+C to stop");
    shutdown_signal().await;
    info!("shutdown signal received");

    exerciser_handle.abort();
    worker.stop().await;
    supervisor.shutdown();
    comm_server.shutdown();

    for handle in comm_handles.into_iter().chain(std::iter::once(supervisor_handle)) {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task panicked during shutdown");
        }
    }

    info!("ghost-dev shutdown complete");
    Ok(())
}

/// Periodically issues a `ping` and a `status` command over the bus so the
/// logs show the full round trip without any manual interaction.
async fn run_exerciser(worker: Arc<ConnectionAgent>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let mut tick = 0u32;
    loop {
        ticker.tick().await;
        tick += 1;
        let command_type = if tick % 2 == 0 { "status" } else { "ping" };
        match worker
            .send_command(CommandRequest {
                command_type: command_type.to_string(),
                target_process_id: None,
                parameters: HashMap::new(),
                data: None,
            })
            .await
        {
            Ok(response) => info!(command_type, success = response.success, "round trip completed"),
            Err(e) => warn!(command_type, error = %e, "round trip failed"),
        }
    }
}

fn sample_worker_info() -> ProcessInfo {
    ProcessInfo {
        id: SAMPLE_WORKER_ID.to_string(),
        name: "ghost-dev sample worker".to_string(),
        process_type: "worker".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        executable_path: String::new(),
        args: vec![],
        working_dir: String::new(),
        environment: HashMap::new(),
        configuration: HashMap::new(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
