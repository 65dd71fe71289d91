//! The `/bridge` channel: audio in and out of the browser-hosted virtual
//! endpoint `"DSH"`, independent of the `/ws` control channel.
//!
//! Per the design-note inversion, this handler never touches the UDP
//! socket or pacer directly — it calls [`crate::datagram::route_and_egress`]
//! with an already-decoded frame, same as the datagram loop does for
//! physical-endpoint audio.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use fabric_control::bridge::{decode_audio_packet, start_listening, stop_listening, BridgeCommand, BridgeEvent};
use fabric_wire::EndpointId;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{datagram::route_and_egress, state::AppState};

pub async fn bridge_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_bridge_ws(socket, state))
}

async fn handle_bridge_ws(socket: WebSocket, state: Arc<AppState>) {
    let (id, rx) = state.bridge_hub.register().await;
    info!(client = id, "bridge client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    state.bridge_hub.send_to(id, BridgeEvent::Connected).await;

    let mut egress = tokio::spawn(async move { run_bridge_egress(&mut ws_sender, rx).await });

    let ingress_state = state.clone();
    let mut ingress = tokio::spawn(async move {
        run_bridge_ingress(&mut ws_receiver, &ingress_state).await;
    });

    tokio::select! {
        _ = &mut egress => { ingress.abort(); }
        _ = &mut ingress => { egress.abort(); }
    }

    state.bridge_hub.unregister(id).await;
    info!(client = id, "bridge client disconnected");
}

async fn run_bridge_egress(
    ws_sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<BridgeEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Ok(text) = serde_json::to_string(&event) else { continue };
        if ws_sender.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

async fn run_bridge_ingress(ws_receiver: &mut futures_util::stream::SplitStream<WebSocket>, state: &Arc<AppState>) {
    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(_) => break,
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };

        let cmd: BridgeCommand = match serde_json::from_str(&text) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "malformed bridge command");
                continue;
            }
        };

        if let Err(e) = apply_bridge_command(cmd, state).await {
            warn!(error = %e, "bridge command rejected");
        }
    }
}

async fn apply_bridge_command(cmd: BridgeCommand, state: &Arc<AppState>) -> fabric_control::ControlResult<()> {
    match cmd {
        BridgeCommand::AudioPacket { from, to, sequence, opus, timestamp: _ } => {
            let frame = decode_audio_packet(&from, &to, sequence, &opus)?;
            route_and_egress(state, frame.source, frame.sequence, frame.payload, vec![frame.target]).await;
        }
        BridgeCommand::StartListening { device_id } => {
            let device = EndpointId::new(&device_id).map_err(fabric_control::ControlError::from)?;
            start_listening(&state.routing, device);
            state.bridge_hub.broadcast(BridgeEvent::ListeningStarted { device_id }).await;
        }
        BridgeCommand::StopListening { device_id } => {
            let device = EndpointId::new(&device_id).map_err(fabric_control::ControlError::from)?;
            stop_listening(&state.routing, device);
            state.bridge_hub.broadcast(BridgeEvent::ListeningStopped { device_id }).await;
        }
        BridgeCommand::RequestStats => {
            let now = std::time::Instant::now();
            let virtual_id = EndpointId::virtual_endpoint();
            if let Some(snapshot) = state.registry.stats(&virtual_id, now) {
                state
                    .bridge_hub
                    .broadcast(BridgeEvent::AudioStats {
                        packets_received: snapshot.packets_received,
                        packets_lost: snapshot.packets_lost,
                    })
                    .await;
            }

            let stats = state.pacer.stats().await;
            if let (Some(min), Some(max), Some(avg)) =
                (stats.min_interval_ms, stats.max_interval_ms, stats.avg_interval_ms)
            {
                state
                    .bridge_hub
                    .broadcast(BridgeEvent::TimingUpdate {
                        min_interval_ms: min,
                        max_interval_ms: max,
                        avg_interval_ms: avg,
                    })
                    .await;
            }
            for violation in state.pacer.recent_violations().await {
                state.bridge_hub.broadcast(BridgeEvent::TimingViolation { violation: violation.into() }).await;
            }
        }
        BridgeCommand::SetRoute { source, target } => {
            let src = EndpointId::new(&source).map_err(fabric_control::ControlError::from)?;
            let tgt = EndpointId::new(&target).map_err(fabric_control::ControlError::from)?;
            state.routing.set_route(src, tgt);
        }
    }
    Ok(())
}
