//! JSON message envelopes for the `/ws` control channel.

use std::collections::HashMap;

use fabric_registry::EndpointSnapshot;
use fabric_routing::RouteEntry;
use fabric_wire::EndpointId;
use serde::{Deserialize, Serialize};

use crate::stats::ServerStats;

#[derive(Clone, Debug, Serialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
}

/// One accumulated datagram-arrival record, flushed in batches as `packets`.
#[derive(Clone, Debug, Serialize)]
pub struct MonitorEvent {
    pub from: String,
    pub to: String,
    pub sequence: u16,
    pub bytes: usize,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientCommand {
    GetDevices,
    GetRoutes,
    GetStats,
    SetRoute { source: String, target: String },
    RemoveRoute { source: String, target: String },
    SetMultipleRoutes { source: String, targets: Vec<String> },
    ClearRoutes { source: String },
    CreateBidirectional {
        #[serde(rename = "deviceA")]
        device_a: String,
        #[serde(rename = "deviceB")]
        device_b: String,
    },
    CreateConference { ids: Vec<String> },
    EnableBroadcast { source: String },
    DisableBroadcast { source: String },
    MuteDevice { id: String },
    UnmuteDevice { id: String },
    ApplyScenario { scenario: String },
    ExportConfig,
    ImportConfig { config: fabric_routing::RoutingConfig },
    Ping,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    InitialState {
        endpoints: Vec<EndpointSnapshot>,
        routing_matrix: HashMap<EndpointId, RouteEntry>,
        stats: ServerStats,
        audio: AudioParams,
    },
    Devices {
        endpoints: Vec<EndpointSnapshot>,
    },
    Routes {
        routing_matrix: HashMap<EndpointId, RouteEntry>,
    },
    Stats {
        stats: ServerStats,
    },
    DeviceConnected {
        id: EndpointId,
    },
    DeviceDisconnected {
        id: EndpointId,
    },
    RouteCreated {
        source: EndpointId,
        target: EndpointId,
    },
    RouteRemoved {
        source: EndpointId,
        target: EndpointId,
    },
    BidirectionalCreated {
        #[serde(rename = "deviceA")]
        device_a: EndpointId,
        #[serde(rename = "deviceB")]
        device_b: EndpointId,
    },
    Packets {
        events: Vec<MonitorEvent>,
    },
    Error {
        message: String,
    },
    Pong,
    ConfigExported {
        config: fabric_routing::RoutingConfig,
    },
}
