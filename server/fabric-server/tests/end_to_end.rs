//! Exercises the six end-to-end scenarios against a real bound UDP socket
//! and the live registry/routing/pacer stack, the way a client or browser
//! bridge would drive the server.

use std::time::{Duration, Instant};

use base64::Engine;
use clap::Parser;
use fabric_control::{apply_command, bridge::start_listening, ClientCommand, ServerEvent};
use fabric_metrics::{FabricMetrics, LabelPolicy};
use fabric_server::{datagram, Config};
use fabric_wire::{encode, EndpointId, Packet, PacketType};
use tokio::net::UdpSocket;
use tokio::time::timeout;

async fn spawn_server() -> (std::sync::Arc<fabric_server::AppState>, std::net::SocketAddr) {
    let cfg = Config::parse_from(["fabric-server-test", "--udp-port", "0", "--control-port", "0"]);
    let metrics = FabricMetrics::new("fabric", LabelPolicy::default());
    let (state, registry_events) = fabric_server::AppState::bind(&cfg, metrics).await.unwrap();
    let addr = state.socket.local_addr().unwrap();

    tokio::spawn(datagram::run_datagram_loop(state.clone()));
    tokio::spawn(fabric_server::controlplane::run_registry_event_loop(state.clone(), registry_events));

    (state, addr)
}

async fn recv_with_timeout(socket: &UdpSocket, buf: &mut [u8]) -> usize {
    timeout(Duration::from_millis(500), socket.recv(buf)).await.expect("timed out waiting for datagram").unwrap()
}

#[tokio::test]
async fn scenario_1_echo() {
    let (state, server_addr) = spawn_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(server_addr).await.unwrap();

    let raw: [u8; 10] = [0x30, 0x30, 0x31, 0x00, 0x00, 0x2A, 0x00, 0x01, 0xAA, 0xBB];

    // First arrival registers the endpoint; no route exists yet.
    client.send(&raw).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    state.routing.set_route(EndpointId::new("001").unwrap(), EndpointId::new("001").unwrap());

    client.send(&raw).await.unwrap();

    let mut buf = [0u8; 64];
    let n = recv_with_timeout(&client, &mut buf).await;
    assert_eq!(&buf[..n], &raw);

    let snapshot = state.stats.snapshot(1, 1);
    assert_eq!(snapshot.packets_routed, 1);
}

#[tokio::test]
async fn scenario_2_sequence_loss() {
    let (state, server_addr) = spawn_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(server_addr).await.unwrap();
    let id = EndpointId::new("001").unwrap();

    for seq in [0u16, 1, 2, 5] {
        let pkt = Packet::new(id, seq, PacketType::Audio, &b"x"[..]);
        client.send(&encode(&pkt)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let snapshot = state.registry.stats(&id, Instant::now()).unwrap();
    assert_eq!(snapshot.packets_received, 4);
    assert_eq!(snapshot.packets_lost, 2);
}

#[tokio::test]
async fn scenario_3_sequence_reset_is_not_loss() {
    let (state, server_addr) = spawn_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(server_addr).await.unwrap();
    let id = EndpointId::new("001").unwrap();

    for seq in [0u16, 1, 2, 60000] {
        let pkt = Packet::new(id, seq, PacketType::Audio, &b"x"[..]);
        client.send(&encode(&pkt)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let snapshot = state.registry.stats(&id, Instant::now()).unwrap();
    assert_eq!(snapshot.packets_lost, 0);
}

#[tokio::test]
async fn scenario_4_bidirectional_via_control() {
    let (state, server_addr) = spawn_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(server_addr).await.unwrap();

    // Register both endpoints by having them speak first, same as the
    // devices discovering their own address via an initial datagram.
    for (id, seq) in [("001", 0u16), ("002", 0u16)] {
        let pkt = Packet::new(EndpointId::new(id).unwrap(), seq, PacketType::Audio, &b"hi"[..]);
        client.send(&encode(&pkt)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let now = Instant::now();
    let outcome = apply_command(
        ClientCommand::CreateBidirectional { device_a: "001".into(), device_b: "002".into() },
        &state.registry,
        &state.routing,
        &state.stats,
        now,
    )
    .unwrap();
    assert!(matches!(outcome.reply, ServerEvent::BidirectionalCreated { .. }));

    let a = EndpointId::new("001").unwrap();
    let b = EndpointId::new("002").unwrap();
    let online = state.registry.online_ids();
    assert_eq!(state.routing.get_routes(&a, &online), vec![b]);
    assert_eq!(state.routing.get_routes(&b, &online), vec![a]);
}

#[tokio::test(start_paused = true)]
async fn scenario_5_paced_egress_burst_and_drop() {
    let (state, _addr) = spawn_server().await;
    let source = EndpointId::virtual_endpoint();
    let target = EndpointId::new("001").unwrap();

    let now: Instant = tokio::time::Instant::now().into();
    for seq in 0u16..15 {
        state.pacer.enqueue(source, target, seq, bytes::Bytes::from_static(b"f"), now);
    }

    let stats = state.pacer.stats().await;
    assert_eq!(stats.total_dropped, 5);

    let mut released = 0;
    for _ in 0..10 {
        tokio::time::advance(fabric_pacer::PACKET_INTERVAL).await;
        let tick_now: Instant = tokio::time::Instant::now().into();
        if state.pacer.tick(tick_now).await.egress.is_some() {
            released += 1;
        }
    }
    assert_eq!(released, 10);
}

#[tokio::test]
async fn scenario_6_listening_surfaces_audio_on_bridge() {
    let (state, server_addr) = spawn_server().await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(server_addr).await.unwrap();
    let device = EndpointId::new("001").unwrap();

    start_listening(&state.routing, device);
    let online = vec![device, EndpointId::virtual_endpoint()];
    assert!(state.routing.get_routes(&device, &online).contains(&EndpointId::virtual_endpoint()));

    let (_client_id, mut rx) = state.bridge_hub.register().await;

    let payload = b"\x01\x02\x03";
    let pkt = Packet::new(device, 7, PacketType::Audio, &payload[..]);
    client.send(&encode(&pkt)).await.unwrap();

    let event = timeout(Duration::from_millis(500), rx.recv()).await.expect("no bridge event").unwrap();
    match event {
        fabric_control::bridge::BridgeEvent::AudioReceived { from, opus, .. } => {
            assert_eq!(from, "001");
            assert_eq!(opus, base64::engine::general_purpose::STANDARD.encode(payload));
        }
        other => panic!("unexpected bridge event: {other:?}"),
    }
}
