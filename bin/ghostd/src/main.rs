//! `ghostd`: the Ghost control plane daemon.
//!
//! Composes the in-memory bus (C1), the daemon-side communication server
//! (C6) and supervisor (C7), a self-reporting connection agent embedded in
//! the daemon process itself (the "daemon-self exception" of §4.4/§4.6),
//! and the persisted-state `DataStore` (§11) backing the supervisor's
//! process table.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};

use ghost_agent::ConnectionAgent;
use ghost_bus::InMemoryBus;
use ghost_common::ProcessInfo;
use ghost_config::AppConfig;
use ghost_daemon::{CommunicationServer, PeerRegistry, Supervisor, DAEMON_SELF_ID};
use ghost_store::{DataStore, InMemoryStore, ResilienceConfig};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        ghost_common::logging::pre_init_log(&format!("no .env file loaded: {e}"));
    }
    ghost_common::logging::init_logging("ghostd");

    let config = AppConfig::load().context("loading ghostd configuration")?;
    info!("starting ghostd");

    let bus = Arc::new(InMemoryBus::new());
    let registry = Arc::new(PeerRegistry::new());
    let store = build_store(&config)?;

    let supervisor = Supervisor::with_store(
        bus.clone(),
        registry.clone(),
        config.daemon.stop_grace_period(),
        Some(store),
    );
    supervisor.restore_registrations().await;
    let supervisor_handle = supervisor.clone().start().await?;

    let comm_server = Arc::new(CommunicationServer::new(
        bus.clone(),
        registry.clone(),
        config.daemon.staleness_threshold_secs as i64,
        config.daemon.staleness_scan_interval(),
    ));
    let comm_handles = comm_server.clone().start().await?;

    let self_agent = ConnectionAgent::new(
        daemon_self_info(),
        bus.clone(),
        config.agent.clone(),
        &config.queue,
        DAEMON_SELF_ID,
        None,
        false,
    );
    self_agent.start_reporting().await?;

    info!("ghostd started, press Ctrl+C to shut down");
    shutdown_signal().await;
    info!("shutdown signal received");

    self_agent.stop().await;
    supervisor.shutdown();
    comm_server.shutdown();

    for handle in comm_handles.into_iter().chain(std::iter::once(supervisor_handle)) {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task panicked during shutdown");
        }
    }

    info!("ghostd shutdown complete");
    Ok(())
}

/// Builds the §11 decorator stack over an in-memory base, keyed by a
/// hex-encoded 32-byte secret read from the env var named in
/// `config.store.encryption_key_env`. Falls back to an all-zero key (and
/// warns loudly) so a dev environment without the secret configured still
/// starts, rather than refusing to run.
fn build_store(config: &AppConfig) -> Result<Arc<dyn DataStore>> {
    let key = match std::env::var(&config.store.encryption_key_env) {
        Ok(hex_key) => {
            let bytes = hex::decode(&hex_key)
                .context("decoding encryption key as hex")?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("encryption key must decode to exactly 32 bytes"))?;
            key
        }
        Err(_) => {
            warn!(
                env_var = %config.store.encryption_key_env,
                "no encryption key configured; using an insecure placeholder key"
            );
            [0u8; 32]
        }
    };

    let base: Arc<dyn DataStore> = Arc::new(InMemoryStore::new());
    let resilience = ResilienceConfig {
        circuit_failure_threshold: config.store.circuit_failure_threshold,
        circuit_success_threshold: config.store.circuit_success_threshold,
        circuit_open_duration: config.store.circuit_open_duration(),
        ..ResilienceConfig::default()
    };
    Ok(ghost_store::default_stack(base, &key, resilience))
}

fn daemon_self_info() -> ProcessInfo {
    ProcessInfo {
        id: DAEMON_SELF_ID.to_string(),
        name: "ghostd".to_string(),
        process_type: "daemon".to_string(),
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
