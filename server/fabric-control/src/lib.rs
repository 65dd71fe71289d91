//! Control-plane application logic: applies client commands against the
//! registry and routing engine, and shapes their effects into
//! [`messages::ServerEvent`]s for broadcast or per-client reply.

pub mod bridge;
pub mod errors;
pub mod hub;
pub mod messages;
pub mod monitor;
pub mod stats;

use std::{str::FromStr, time::Instant};

use fabric_registry::{EndpointSnapshot, Registry};
use fabric_routing::{RoutingEngine, Scenario};
use fabric_wire::EndpointId;
use serde::Serialize;

pub use errors::{ControlError, ControlResult};
pub use hub::{ClientHub, ClientId};
pub use messages::{AudioParams, ClientCommand, MonitorEvent, ServerEvent};
pub use monitor::MonitorBatch;
pub use stats::{ServerStats, ServerStatsCounters};

/// JSON-friendly view of a pacer violation, surfaced on the bridge as
/// `timing_violation`.
#[derive(Clone, Debug, Serialize)]
pub struct ViolationDto {
    pub kind: &'static str,
    pub flow: Option<(String, String)>,
    pub detail_ms: f64,
}

impl From<fabric_pacer::Violation> for ViolationDto {
    fn from(v: fabric_pacer::Violation) -> Self {
        let kind = match v.kind {
            fabric_pacer::ViolationKind::IntervalDrift => "interval_drift",
            fabric_pacer::ViolationKind::QueueBuildup => "queue_buildup",
            fabric_pacer::ViolationKind::HighLatency => "high_latency",
            fabric_pacer::ViolationKind::PacketInterval => "packet_interval",
        };
        Self {
            kind,
            flow: v.flow.map(|(s, t)| (s.as_str().into_owned(), t.as_str().into_owned())),
            detail_ms: v.detail_ms,
        }
    }
}

/// Outcome of applying a [`ClientCommand`]: the reply owed to the requester
/// plus any event that should additionally be broadcast to every client.
pub struct CommandOutcome {
    pub reply: ServerEvent,
    pub broadcast: Option<ServerEvent>,
}

impl CommandOutcome {
    fn reply_only(reply: ServerEvent) -> Self {
        Self { reply, broadcast: None }
    }

    fn with_broadcast(reply: ServerEvent, broadcast: ServerEvent) -> Self {
        Self { reply, broadcast: Some(broadcast) }
    }
}

fn parse_id(s: &str) -> ControlResult<EndpointId> {
    EndpointId::new(s).map_err(ControlError::from)
}

pub fn endpoints_snapshot(registry: &Registry, now: Instant) -> Vec<EndpointSnapshot> {
    registry.snapshot_all(now)
}

pub fn initial_state(
    registry: &Registry,
    routing: &RoutingEngine,
    stats: &ServerStatsCounters,
    audio: AudioParams,
    now: Instant,
) -> ServerEvent {
    let endpoints = registry.snapshot_all(now);
    let online = registry.online_ids();
    ServerEvent::InitialState {
        routing_matrix: routing.matrix(&online),
        stats: stats.snapshot(online.len() as u64, registry.len() as u64),
        endpoints,
        audio,
    }
}

/// Apply one parsed client command, mutating the registry/routing engine as
/// needed. Malformed ids or unknown scenarios are returned as a typed
/// `ControlError`; the caller turns that into an `error` reply and does
/// not disconnect the client.
pub fn apply_command(
    cmd: ClientCommand,
    registry: &Registry,
    routing: &RoutingEngine,
    stats: &ServerStatsCounters,
    now: Instant,
) -> ControlResult<CommandOutcome> {
    let online = || registry.online_ids();

    let outcome = match cmd {
        ClientCommand::GetDevices => {
            CommandOutcome::reply_only(ServerEvent::Devices { endpoints: registry.snapshot_all(now) })
        }
        ClientCommand::GetRoutes => {
            CommandOutcome::reply_only(ServerEvent::Routes { routing_matrix: routing.matrix(&online()) })
        }
        ClientCommand::GetStats => CommandOutcome::reply_only(ServerEvent::Stats {
            stats: stats.snapshot(online().len() as u64, registry.len() as u64),
        }),
        ClientCommand::SetRoute { source, target } => {
            let src = parse_id(&source)?;
            let tgt = parse_id(&target)?;
            routing.set_route(src, tgt);
            CommandOutcome::with_broadcast(
                ServerEvent::RouteCreated { source: src, target: tgt },
                ServerEvent::RouteCreated { source: src, target: tgt },
            )
        }
        ClientCommand::RemoveRoute { source, target } => {
            let src = parse_id(&source)?;
            let tgt = parse_id(&target)?;
            routing.remove_route(src, tgt);
            CommandOutcome::with_broadcast(
                ServerEvent::RouteRemoved { source: src, target: tgt },
                ServerEvent::RouteRemoved { source: src, target: tgt },
            )
        }
        ClientCommand::CreateBidirectional { device_a, device_b } => {
            let ea = parse_id(&device_a)?;
            let eb = parse_id(&device_b)?;
            routing.create_bidirectional(ea, eb);
            CommandOutcome::with_broadcast(
                ServerEvent::BidirectionalCreated { device_a: ea, device_b: eb },
                ServerEvent::BidirectionalCreated { device_a: ea, device_b: eb },
            )
        }
        ClientCommand::SetMultipleRoutes { source, targets } => {
            let src = parse_id(&source)?;
            let tgts: Vec<EndpointId> = targets.iter().map(|t| parse_id(t)).collect::<ControlResult<_>>()?;
            routing.set_multiple_routes(src, tgts);
            CommandOutcome::with_broadcast(
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
            )
        }
        ClientCommand::ClearRoutes { source } => {
            let src = parse_id(&source)?;
            routing.clear_routes(src);
            CommandOutcome::with_broadcast(
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
            )
        }
        ClientCommand::CreateConference { ids } => {
            let endpoint_ids: Vec<EndpointId> = ids.iter().map(|i| parse_id(i)).collect::<ControlResult<_>>()?;
            routing.create_conference(&endpoint_ids)?;
            CommandOutcome::with_broadcast(
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
            )
        }
        ClientCommand::EnableBroadcast { source } => {
            let src = parse_id(&source)?;
            routing.enable_broadcast(src);
            CommandOutcome::with_broadcast(
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
            )
        }
        ClientCommand::DisableBroadcast { source } => {
            let src = parse_id(&source)?;
            routing.disable_broadcast(src);
            CommandOutcome::with_broadcast(
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
            )
        }
        ClientCommand::MuteDevice { id } => {
            let eid = parse_id(&id)?;
            routing.mute(eid);
            CommandOutcome::with_broadcast(
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
            )
        }
        ClientCommand::UnmuteDevice { id } => {
            let eid = parse_id(&id)?;
            routing.unmute(eid);
            CommandOutcome::with_broadcast(
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
            )
        }
        ClientCommand::ApplyScenario { scenario } => {
            let parsed = Scenario::from_str(&scenario).map_err(|_| ControlError::UnknownScenario(scenario))?;
            routing.apply_scenario(parsed, &online());
            CommandOutcome::with_broadcast(
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
            )
        }
        ClientCommand::ExportConfig => {
            CommandOutcome::reply_only(ServerEvent::ConfigExported { config: routing.export_config() })
        }
        ClientCommand::ImportConfig { config } => {
            routing.import_config(&config)?;
            CommandOutcome::with_broadcast(
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
                ServerEvent::Routes { routing_matrix: routing.matrix(&online()) },
            )
        }
        ClientCommand::Ping => CommandOutcome::reply_only(ServerEvent::Pong),
    };

    Ok(outcome)
}
