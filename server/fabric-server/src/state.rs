use std::{net::SocketAddr, sync::Arc};

use fabric_control::{bridge::BridgeEvent, AudioParams, ClientHub, MonitorBatch, ServerEvent, ServerStatsCounters};
use fabric_metrics::FabricMetrics;
use fabric_pacer::PacedQueue;
use fabric_registry::Registry;
use fabric_routing::RoutingEngine;
use fabric_wire::EndpointId;
use tokio::net::UdpSocket;

use crate::config::Config;

/// Shared state handed to every task in the process: the datagram loop,
/// the control-plane `/ws` handler, and the bridge `/bridge` handler.
pub struct AppState {
    pub registry: Registry,
    pub routing: RoutingEngine,
    pub pacer: PacedQueue,
    pub hub: ClientHub<ServerEvent>,
    pub bridge_hub: ClientHub<BridgeEvent>,
    pub monitor: MonitorBatch,
    pub stats: ServerStatsCounters,
    pub metrics: FabricMetrics,
    pub socket: UdpSocket,
    pub audio: AudioParams,
    pub max_packet_size: usize,
    pub ping_interval_ms: u64,
    /// Physical endpoint addresses, learned from inbound datagrams. The
    /// registry tracks the same information per snapshot; this is a fast
    /// lookup path for the egress send.
    pub device_addrs: dashmap::DashMap<EndpointId, SocketAddr>,
}

impl AppState {
    /// Binds the datagram socket and constructs shared state. Returns the
    /// registry's lifecycle-event receiver alongside it; the caller (the
    /// control plane is the single consumer, per design) spawns a task to
    /// drain it into client broadcasts.
    pub async fn bind(
        cfg: &Config,
        metrics: FabricMetrics,
    ) -> anyhow::Result<(Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<fabric_registry::RegistryEvent>)> {
        let (registry, events) = Registry::new(fabric_registry::RegistryConfig {
            frame_duration_ms: cfg.frame_duration_ms,
            timeout: cfg.device_timeout(),
            gc_after: std::time::Duration::from_secs(3600),
            max_devices: cfg.max_devices,
        });

        let socket = UdpSocket::bind(("0.0.0.0", cfg.udp_port)).await?;

        let state = Arc::new(Self {
            registry,
            routing: RoutingEngine::new(cfg.max_group_size),
            pacer: PacedQueue::new(),
            hub: ClientHub::new(),
            bridge_hub: ClientHub::new(),
            monitor: MonitorBatch::new(),
            stats: ServerStatsCounters::new(),
            metrics,
            socket,
            audio: AudioParams { sample_rate: cfg.sample_rate, frame_duration_ms: cfg.frame_duration_ms },
            max_packet_size: cfg.max_packet_size,
            ping_interval_ms: cfg.ping_interval_ms,
            device_addrs: dashmap::DashMap::new(),
        });

        Ok((state, events))
    }
}
