//! JSON message envelopes for the `/bridge` virtual-endpoint channel. This
//! is a second, independent WebSocket upgrade used exclusively for audio
//! frames to and from the browser-hosted virtual endpoint `"DSH"`.

use base64::Engine;
use bytes::Bytes;
use fabric_routing::RoutingEngine;
use fabric_wire::EndpointId;
use serde::{Deserialize, Serialize};

use crate::{ControlError, ControlResult, ViolationDto};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeCommand {
    AudioPacket { from: String, to: String, sequence: u16, opus: String, timestamp: u64 },
    StartListening { device_id: String },
    StopListening { device_id: String },
    RequestStats,
    SetRoute { source: String, target: String },
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Connected,
    AudioReceived { from: String, sequence: u16, opus: String, timestamp: u64 },
    AudioStats { packets_received: u64, packets_lost: u64 },
    ListeningStarted { device_id: String },
    ListeningStopped { device_id: String },
    TimingUpdate { min_interval_ms: f64, max_interval_ms: f64, avg_interval_ms: f64 },
    TimingViolation { violation: ViolationDto },
}

/// A decoded `audio_packet` bridge command, ready to enter the
/// routing/pacing pipeline as if it had arrived on the datagram socket.
pub struct BridgeAudioFrame {
    pub source: EndpointId,
    pub target: EndpointId,
    pub sequence: u16,
    pub payload: Bytes,
}

pub fn decode_audio_packet(from: &str, to: &str, sequence: u16, opus_b64: &str) -> ControlResult<BridgeAudioFrame> {
    let source = EndpointId::new(from).map_err(ControlError::from)?;
    let target = EndpointId::new(to).map_err(ControlError::from)?;
    let payload = base64::engine::general_purpose::STANDARD.decode(opus_b64)?;
    Ok(BridgeAudioFrame { source, target, sequence, payload: Bytes::from(payload) })
}

/// `start_listening(d)`: route `d -> "DSH"` so the device's audio is
/// surfaced to bridge clients via `audio_received`.
pub fn start_listening(routing: &RoutingEngine, device: EndpointId) {
    routing.set_route(device, EndpointId::virtual_endpoint());
}

pub fn stop_listening(routing: &RoutingEngine, device: EndpointId) {
    routing.remove_route(device, EndpointId::virtual_endpoint());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_audio_packet_round_trips_base64_payload() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"\xAA\xBB");
        let frame = decode_audio_packet("DSH", "001", 7, &encoded).unwrap();
        assert_eq!(frame.source, EndpointId::new("DSH").unwrap());
        assert_eq!(frame.target, EndpointId::new("001").unwrap());
        assert_eq!(frame.sequence, 7);
        assert_eq!(&frame.payload[..], &[0xAA, 0xBB]);
    }

    #[test]
    fn decode_audio_packet_rejects_invalid_base64() {
        assert!(decode_audio_packet("DSH", "001", 0, "not base64!!").is_err());
    }

    #[test]
    fn start_then_stop_listening_toggles_route_to_virtual_endpoint() {
        let routing = RoutingEngine::new(16);
        let device = EndpointId::new("001").unwrap();
        start_listening(&routing, device);
        assert_eq!(routing.get_routes(&device, &[device, EndpointId::virtual_endpoint()]), vec![EndpointId::virtual_endpoint()]);
        stop_listening(&routing, device);
        assert!(routing.get_routes(&device, &[device, EndpointId::virtual_endpoint()]).is_empty());
    }
}
