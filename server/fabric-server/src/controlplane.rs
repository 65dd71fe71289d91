//! The `/ws` control channel: device/route/stats queries and mutations,
//! plus server-pushed lifecycle and monitor events.
//!
//! One writer per connection owns the socket's write half (the egress
//! task below); the read task and the shared broadcast tasks only ever
//! enqueue onto that client's [`fabric_control::ClientHub`] channel.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use fabric_control::{apply_command, initial_state, ClientCommand, ServerEvent};
use fabric_registry::RegistryEvent;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::AppState;

pub async fn control_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_control_ws(socket, state))
}

async fn handle_control_ws(socket: WebSocket, state: Arc<AppState>) {
    let (id, rx) = state.hub.register().await;
    state.metrics.control_client_connected();
    info!(client = id, "control client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let initial = initial_state(
        &state.registry,
        &state.routing,
        &state.stats,
        state.audio.clone(),
        std::time::Instant::now(),
    );
    state.hub.send_to(id, initial).await;

    let ping_interval = Duration::from_millis(state.ping_interval_ms);
    let mut egress = tokio::spawn(async move {
        run_control_egress(&mut ws_sender, rx, ping_interval).await;
    });

    let ingress_state = state.clone();
    let mut ingress = tokio::spawn(async move {
        run_control_ingress(&mut ws_receiver, id, &ingress_state).await;
    });

    tokio::select! {
        _ = &mut egress => { ingress.abort(); }
        _ = &mut ingress => { egress.abort(); }
    }

    state.hub.unregister(id).await;
    state.metrics.control_client_disconnected();
    info!(client = id, "control client disconnected");
}

async fn run_control_egress(
    ws_sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerEvent>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await; // first tick fires immediately, skip it

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if ws_sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn run_control_ingress(
    ws_receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    id: fabric_control::ClientId,
    state: &Arc<AppState>,
) {
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

        let cmd: ClientCommand = match serde_json::from_str(&text) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "malformed control command");
                state.hub.send_to(id, ServerEvent::Error { message: e.to_string() }).await;
                continue;
            }
        };

        let kind = command_kind(&cmd);
        state.metrics.control_command(kind);

        let now = std::time::Instant::now();
        match apply_command(cmd, &state.registry, &state.routing, &state.stats, now) {
            Ok(outcome) => {
                state.hub.send_to(id, outcome.reply).await;
                if let Some(broadcast) = outcome.broadcast {
                    state.hub.broadcast(broadcast).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "control command rejected");
                state.hub.send_to(id, ServerEvent::Error { message: e.to_string() }).await;
            }
        }
    }
}

fn command_kind(cmd: &ClientCommand) -> &'static str {
    match cmd {
        ClientCommand::GetDevices => "get-devices",
        ClientCommand::GetRoutes => "get-routes",
        ClientCommand::GetStats => "get-stats",
        ClientCommand::SetRoute { .. } => "set-route",
        ClientCommand::RemoveRoute { .. } => "remove-route",
        ClientCommand::CreateBidirectional { .. } => "create-bidirectional",
        ClientCommand::SetMultipleRoutes { .. } => "set-multiple-routes",
        ClientCommand::ClearRoutes { .. } => "clear-routes",
        ClientCommand::CreateConference { .. } => "create-conference",
        ClientCommand::EnableBroadcast { .. } => "enable-broadcast",
        ClientCommand::DisableBroadcast { .. } => "disable-broadcast",
        ClientCommand::MuteDevice { .. } => "mute-device",
        ClientCommand::UnmuteDevice { .. } => "unmute-device",
        ClientCommand::ApplyScenario { .. } => "apply-scenario",
        ClientCommand::ExportConfig => "export-config",
        ClientCommand::ImportConfig { .. } => "import-config",
        ClientCommand::Ping => "ping",
    }
}

/// Drains registry lifecycle events into `device-connected` /
/// `device-disconnected` broadcasts. The registry's single consumer.
pub async fn run_registry_event_loop(state: Arc<AppState>, mut events: mpsc::UnboundedReceiver<RegistryEvent>) {
    while let Some(event) = events.recv().await {
        let server_event = match event {
            RegistryEvent::DeviceConnected(id) | RegistryEvent::DeviceReconnected(id) => {
                ServerEvent::DeviceConnected { id }
            }
            RegistryEvent::DeviceDisconnected(id) => ServerEvent::DeviceDisconnected { id },
        };
        state.hub.broadcast(server_event).await;
    }
}

/// Flushes the 100 ms monitor batch window into a `packets` broadcast.
pub async fn run_monitor_flush_loop(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(fabric_control::monitor::FLUSH_INTERVAL);
    loop {
        interval.tick().await;
        if let Some(events) = state.monitor.flush() {
            state.hub.broadcast(ServerEvent::Packets { events }).await;
        }
    }
}

/// Periodic registry upkeep: times out stale endpoints, garbage-collects
/// long-dead ones, and republishes the online/total endpoint gauges.
pub async fn run_registry_maintenance_loop(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        let now = std::time::Instant::now();
        state.registry.check_timeouts(now);
        state.registry.cleanup(now);
        state.metrics.endpoints_online(state.registry.online_ids().len() as u64);
        state.metrics.endpoints_total(state.registry.len() as u64);
    }
}
