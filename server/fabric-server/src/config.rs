use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "fabric-server", about = "Real-time audio exchange fabric")]
pub struct Config {
    /// Bind port for the datagram (audio) socket.
    #[arg(long, env = "FABRIC_UDP_PORT", default_value_t = 7000)]
    pub udp_port: u16,

    /// Base local port advertised to simulator/test endpoints. Not bound
    /// by the server itself.
    #[arg(long, env = "FABRIC_DEVICE_PORT_START", default_value_t = 8000)]
    pub device_port_start: u16,

    /// MTU guard for datagram reads.
    #[arg(long, env = "FABRIC_MAX_PACKET_SIZE", default_value_t = 1400)]
    pub max_packet_size: usize,

    /// Advertised in `initial-state`; not interpreted by the core.
    #[arg(long, env = "FABRIC_SAMPLE_RATE", default_value_t = 48_000)]
    pub sample_rate: u32,

    /// Nominal inter-packet interval, used for jitter accounting.
    #[arg(long, env = "FABRIC_FRAME_DURATION_MS", default_value_t = 20)]
    pub frame_duration_ms: u32,

    /// Advertised only; not interpreted by the core.
    #[arg(long, env = "FABRIC_AUDIO_CHANNELS", default_value_t = 1)]
    pub audio_channels: u8,

    /// Advertised only; not interpreted by the core.
    #[arg(long, env = "FABRIC_OPUS_BITRATE", default_value_t = 32_000)]
    pub opus_bitrate: u32,

    /// Capacity bound for the endpoint registry.
    #[arg(long, env = "FABRIC_MAX_DEVICES", default_value_t = 512)]
    pub max_devices: usize,

    /// `T_timeout`: how long since last contact before an endpoint is
    /// marked offline.
    #[arg(long, env = "FABRIC_DEVICE_TIMEOUT_SECS", default_value_t = 10)]
    pub device_timeout_secs: u64,

    /// Hint given to clients; the server does not enforce this itself.
    #[arg(long, env = "FABRIC_HEARTBEAT_INTERVAL_MS", default_value_t = 5_000)]
    pub heartbeat_interval_ms: u64,

    /// Initial routing mode label, informational only.
    #[arg(long, env = "FABRIC_DEFAULT_ROUTING_MODE", default_value = "clear")]
    pub default_routing_mode: String,

    /// Conference/group cardinality bound.
    #[arg(long, env = "FABRIC_MAX_GROUP_SIZE", default_value_t = 16)]
    pub max_group_size: usize,

    /// Control channel port; serves `/ws`, `/bridge`, and `/metrics` unless
    /// `metrics_listen` overrides the latter.
    #[arg(long, env = "FABRIC_CONTROL_PORT", default_value_t = 9000)]
    pub control_port: u16,

    /// `T_ping`: keepalive ping cadence on the control channel.
    #[arg(long, env = "FABRIC_PING_INTERVAL_MS", default_value_t = 15_000)]
    pub ping_interval_ms: u64,

    /// Bind address for the Prometheus `/metrics` endpoint.
    #[arg(long, env = "FABRIC_METRICS_LISTEN", default_value = "0.0.0.0:9100")]
    pub metrics_listen: String,
}

impl Config {
    pub fn device_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.device_timeout_secs)
    }
}
