//! The datagram server: UDP ingress/egress. Also owns the paced
//! egress tick loop, since both share `AppState`'s socket and pacer.
//!
//! `route_and_egress` is the bridge's only entry point into this module
//! (the design-note inversion: the bridge holds no back-reference to the
//! UDP socket or routing internals, it calls this one function with an
//! already-decoded frame and an explicit target list).

use std::sync::Arc;

use bytes::Bytes;
use fabric_control::{bridge::BridgeEvent, MonitorEvent};
use fabric_wire::{decode, encode, EndpointId, Packet, PacketType};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::state::AppState;

/// A reduced control command set deliverable as an in-band UDP control
/// packet (`PacketType::Control`), distinct from and narrower than the
/// `/ws` control-plane's full command surface.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum UdpControlCommand {
    Route { source: String, target: String },
    Broadcast { source: String, enabled: bool },
    Mute { id: String, muted: bool },
}

/// `ShouldPace(src, tgt)`: true iff `src` is the virtual endpoint and `tgt`
/// is not. The virtual endpoint is the only source with bursty timing;
/// physical endpoints are already the cadence source.
pub fn should_pace(source: &EndpointId, target: &EndpointId) -> bool {
    *source == EndpointId::virtual_endpoint() && *target != EndpointId::virtual_endpoint()
}

pub async fn run_datagram_loop(state: Arc<AppState>) {
    let mut buf = vec![0u8; state.max_packet_size];
    loop {
        let (len, addr) = match state.socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "datagram socket recv error");
                continue;
            }
        };

        let packet = match decode(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, %addr, "dropped malformed datagram");
                state.metrics.packet_dropped("malformed");
                state.stats.record_dropped();
                continue;
            }
        };

        state.stats.record_received(len);
        state.metrics.packet_received(len);

        state.device_addrs.insert(packet.id, addr);
        let now = std::time::Instant::now();
        state.registry.update_from_datagram(packet.id, addr, packet.sequence, now);

        match packet.kind {
            PacketType::Heartbeat => {
                state.registry.mark_heartbeat(&packet.id, now);
                let reply = encode(&Packet::heartbeat_reply());
                if let Err(e) = state.socket.send_to(&reply, addr).await {
                    warn!(error = %e, %addr, "heartbeat reply send failed");
                }
            }
            PacketType::Control => {
                apply_udp_control(&state, &packet.payload);
            }
            PacketType::Audio => {
                let online = state.registry.online_ids();
                let targets = state.routing.get_routes(&packet.id, &online);
                route_and_egress(&state, packet.id, packet.sequence, packet.payload.clone(), targets).await;
            }
        }
    }
}

fn apply_udp_control(state: &AppState, payload: &[u8]) {
    let cmd: UdpControlCommand = match serde_json::from_slice(payload) {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, "ignored malformed in-band control payload");
            return;
        }
    };

    let parse = |s: &str| EndpointId::new(s).ok();

    match cmd {
        UdpControlCommand::Route { source, target } => {
            if let (Some(src), Some(tgt)) = (parse(&source), parse(&target)) {
                state.routing.set_route(src, tgt);
            }
        }
        UdpControlCommand::Broadcast { source, enabled } => {
            if let Some(src) = parse(&source) {
                if enabled {
                    state.routing.enable_broadcast(src);
                } else {
                    state.routing.disable_broadcast(src);
                }
            }
        }
        UdpControlCommand::Mute { id, muted } => {
            if let Some(eid) = parse(&id) {
                if muted {
                    state.routing.mute(eid);
                } else {
                    state.routing.unmute(eid);
                }
            }
        }
    }
}

/// Route `payload` from `source` to `targets`, sending directly to physical
/// endpoints or enqueuing into the paced egress queue when the source is
/// the virtual endpoint, and surfacing to bridge clients when the virtual
/// endpoint itself is among the targets.
pub async fn route_and_egress(
    state: &AppState,
    source: EndpointId,
    sequence: u16,
    payload: Bytes,
    targets: Vec<EndpointId>,
) {
    let virtual_id = EndpointId::virtual_endpoint();
    let record_monitor = |target: EndpointId| {
        state.monitor.record(MonitorEvent {
            from: source.as_str().into_owned(),
            to: target.as_str().into_owned(),
            sequence,
            bytes: payload.len(),
        });
    };

    for target in targets {
        if target == virtual_id {
            let opus = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &payload);
            state
                .bridge_hub
                .broadcast(BridgeEvent::AudioReceived {
                    from: source.as_str().into_owned(),
                    sequence,
                    opus,
                    timestamp: now_millis(),
                })
                .await;
            record_monitor(target);
            continue;
        }

        if should_pace(&source, &target) {
            let dropped = state.pacer.enqueue(source, target, sequence, payload.clone(), std::time::Instant::now());
            if dropped > 0 {
                state.metrics.pacer_dropped(dropped as u64);
            }
            record_monitor(target);
            continue;
        }

        if let Err(e) = send_direct(state, target, source, sequence, PacketType::Audio, payload.clone()).await {
            warn!(error = %e, %target, "direct egress send failed");
            state.metrics.packet_dropped("send_failed");
            state.stats.record_dropped();
            record_monitor(target);
            continue;
        }
        state.stats.record_routed(payload.len());
        state.metrics.packet_routed(payload.len());
        record_monitor(target);
    }
}

/// Send a datagram to `target`'s known address. The wire header's id field
/// carries `header_id` — the originating endpoint, preserved unchanged as
/// the datagram is forwarded — so the receiver knows whose audio it is,
/// not who it was addressed to.
pub async fn send_direct(
    state: &AppState,
    target: EndpointId,
    header_id: EndpointId,
    sequence: u16,
    kind: PacketType,
    payload: Bytes,
) -> std::io::Result<()> {
    let Some(addr) = state.device_addrs.get(&target).map(|a| *a) else {
        return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no known address for target"));
    };
    let wire = encode(&Packet::new(header_id, sequence, kind, payload));
    state.socket.send_to(&wire, addr).await.map(|_| ())
}

/// Drives the 20 ms paced-egress tick loop: one fire per interval, at most
/// one packet released, sent physically and counted.
pub async fn run_pacer_loop(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(fabric_pacer::PACKET_INTERVAL);
    loop {
        interval.tick().await;
        let now = std::time::Instant::now();
        let outcome = state.pacer.tick(now).await;

        for violation in &outcome.violations {
            state.metrics.pacer_violation(violation_label(violation.kind));
        }

        let Some(egress) = outcome.egress else { continue };

        if let Err(e) =
            send_direct(&state, egress.target, egress.source, egress.sequence, PacketType::Audio, egress.payload.clone()).await
        {
            warn!(error = %e, target = %egress.target, "paced egress send failed");
            state.metrics.packet_dropped("pacer_send_failed");
            state.stats.record_dropped();
            continue;
        }
        state.stats.record_routed(egress.payload.len());
        state.metrics.packet_routed(egress.payload.len());
        state.metrics.pacer_sent();
        state.metrics.pacer_queue_depth(&egress.source, &egress.target, state.pacer.queue_depth(&egress.source, &egress.target));
        if let Some(ms) = outcome.interval_ms {
            state.metrics.pacer_interval(ms);
        }
    }
}

fn violation_label(kind: fabric_pacer::ViolationKind) -> &'static str {
    match kind {
        fabric_pacer::ViolationKind::IntervalDrift => "interval_drift",
        fabric_pacer::ViolationKind::QueueBuildup => "queue_buildup",
        fabric_pacer::ViolationKind::HighLatency => "high_latency",
        fabric_pacer::ViolationKind::PacketInterval => "packet_interval",
    }
}

fn now_millis() -> u64 {
    // Wall-clock timestamp for client display only; never used for pacing
    // or ordering decisions inside the fabric itself.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
