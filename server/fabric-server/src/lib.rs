//! Process wiring for the `fabric-server` binary, split from `main.rs` so
//! integration tests can drive the same router and task set the binary
//! runs in production.

pub mod bridge;
pub mod config;
pub mod controlplane;
pub mod datagram;
pub mod state;

use std::{net::SocketAddr, sync::Arc};

use axum::{routing::get, Router};
use fabric_metrics::{FabricMetrics, LabelPolicy, MetricsConfig, MetricsServer};
use fabric_wire::EndpointId;
use tracing::info;

pub use config::Config;
pub use state::AppState;

/// Binds the datagram socket, registers the virtual endpoint, and spawns
/// every background task (datagram loop, pacer tick, registry-event drain,
/// monitor flush, registry maintenance). Returns the ready-to-serve
/// control-plane router; the caller is responsible for binding a
/// `TcpListener` and running it.
pub async fn build(cfg: &Config) -> anyhow::Result<Router> {
    let metrics = FabricMetrics::new("fabric", LabelPolicy::default());
    let (state, registry_events) = AppState::bind(cfg, metrics).await?;

    let virtual_id = EndpointId::virtual_endpoint();
    state.registry.register_virtual(virtual_id, std::time::Instant::now());
    info!(id = %virtual_id, "virtual endpoint registered");

    tokio::spawn(datagram::run_datagram_loop(state.clone()));
    tokio::spawn(datagram::run_pacer_loop(state.clone()));
    tokio::spawn(controlplane::run_registry_event_loop(state.clone(), registry_events));
    tokio::spawn(controlplane::run_monitor_flush_loop(state.clone()));
    tokio::spawn(controlplane::run_registry_maintenance_loop(state.clone()));

    Ok(router(state))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(controlplane::control_ws))
        .route("/bridge", get(bridge::bridge_ws))
        .with_state(state)
}

pub fn control_addr(cfg: &Config) -> SocketAddr {
    ([0, 0, 0, 0], cfg.control_port).into()
}

pub async fn install_metrics_server(cfg: &Config) -> anyhow::Result<()> {
    let metrics_server = MetricsServer::install(MetricsConfig { listen: cfg.metrics_listen.clone(), namespace: "fabric" })?;
    tokio::spawn(async move {
        let _ = metrics_server.serve().await;
    });
    Ok(())
}
