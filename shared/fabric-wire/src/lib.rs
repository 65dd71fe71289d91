//! Wire codec for the audio fabric's datagram transport.
//!
//! Packet format (fixed 8-byte header, big-endian multi-byte fields):
//!
//! ```text
//! offset 0 : 4 bytes   endpoint id (ASCII, NUL-padded)
//! offset 4 : 2 bytes   sequence number (u16, big-endian)
//! offset 6 : 2 bytes   packet type     (u16, big-endian)
//! offset 8 : N bytes   payload
//! ```
//!
//! This crate treats the payload as opaque bytes; codec internals (Opus, PCM,
//! JSON) are the caller's concern.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

/// Length of the id field, in bytes.
pub const ID_LEN: usize = 4;
/// Length of the fixed header, in bytes.
pub const HEADER_LEN: usize = 8;

/// The id the server itself uses when replying (e.g. to heartbeats).
pub const SERVER_ID: &str = "SRVR";
/// The id reserved for the control-plane-backed virtual endpoint.
pub const VIRTUAL_ENDPOINT_ID: &str = "DSH";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too short: {0} bytes, header requires {HEADER_LEN}")]
    TooShort(usize),
    #[error("unknown packet type: {0:#06x}")]
    UnknownType(u16),
    #[error("endpoint id longer than {ID_LEN} bytes: {0:?}")]
    IdTooLong(String),
}

/// A 4-byte endpoint identifier, textually a short ASCII string right-padded
/// with NULs on the wire. Display/`as_str` strip the padding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId([u8; ID_LEN]);

impl EndpointId {
    /// Build an id from a short ASCII string, right-padding with NULs.
    /// Returns an error if `s` does not fit in [`ID_LEN`] bytes.
    pub fn new(s: &str) -> Result<Self, WireError> {
        if s.len() > ID_LEN {
            return Err(WireError::IdTooLong(s.to_string()));
        }
        let mut raw = [0u8; ID_LEN];
        raw[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self(raw))
    }

    /// Build an id from the raw 4-byte wire representation.
    pub fn from_raw(raw: [u8; ID_LEN]) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> [u8; ID_LEN] {
        self.0
    }

    /// The id with trailing NULs stripped, as a `&str`.
    ///
    /// Non-ASCII / invalid UTF-8 bytes (malformed input from the wire) are
    /// replaced rather than rejected — the id is a routing key, not trusted
    /// content, and the registry must still be able to key off it.
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        let trimmed = trim_nul(&self.0);
        String::from_utf8_lossy(trimmed)
    }

    pub fn server() -> Self {
        Self::new(SERVER_ID).expect("SERVER_ID fits in ID_LEN")
    }

    pub fn virtual_endpoint() -> Self {
        Self::new(VIRTUAL_ENDPOINT_ID).expect("VIRTUAL_ENDPOINT_ID fits in ID_LEN")
    }
}

fn trim_nul(raw: &[u8; ID_LEN]) -> &[u8] {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(ID_LEN);
    &raw[..end]
}

impl Serialize for EndpointId {
    /// Serializes as the trimmed string form, e.g. `"001"` — the id a
    /// control-plane client sent originally, not its NUL-padded wire bytes.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_str())
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointId({:?})", self.as_str())
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The three packet types the fabric understands. Anything else is rejected
/// at decode time and counted by the caller as a malformed-input drop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    Audio,
    Control,
    Heartbeat,
}

impl PacketType {
    pub const AUDIO: u16 = 0x0001;
    pub const CONTROL: u16 = 0x0002;
    pub const HEARTBEAT: u16 = 0x0003;

    pub fn as_u16(self) -> u16 {
        match self {
            PacketType::Audio => Self::AUDIO,
            PacketType::Control => Self::CONTROL,
            PacketType::Heartbeat => Self::HEARTBEAT,
        }
    }
}

impl TryFrom<u16> for PacketType {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            Self::AUDIO => Ok(PacketType::Audio),
            Self::CONTROL => Ok(PacketType::Control),
            Self::HEARTBEAT => Ok(PacketType::Heartbeat),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

/// A decoded datagram: header fields plus an owned, ref-counted payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub id: EndpointId,
    pub sequence: u16,
    pub kind: PacketType,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(id: EndpointId, sequence: u16, kind: PacketType, payload: impl Into<Bytes>) -> Self {
        Self { id, sequence, kind, payload: payload.into() }
    }

    /// Build the canonical heartbeat reply: id `"SRVR"`, seq 0, empty payload.
    pub fn heartbeat_reply() -> Self {
        Self::new(EndpointId::server(), 0, PacketType::Heartbeat, Bytes::new())
    }
}

/// Parse a raw datagram into a [`Packet`]. Rejects anything shorter than
/// [`HEADER_LEN`] or carrying an unrecognized packet type.
pub fn decode(buf: &[u8]) -> Result<Packet, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::TooShort(buf.len()));
    }

    let mut raw_id = [0u8; ID_LEN];
    raw_id.copy_from_slice(&buf[0..4]);
    let id = EndpointId::from_raw(raw_id);

    let sequence = u16::from_be_bytes([buf[4], buf[5]]);
    let kind = PacketType::try_from(u16::from_be_bytes([buf[6], buf[7]]))?;
    let payload = Bytes::copy_from_slice(&buf[HEADER_LEN..]);

    Ok(Packet { id, sequence, kind, payload })
}

/// Serialize a [`Packet`] to its wire representation.
pub fn encode(pkt: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + pkt.payload.len());
    buf.put_slice(&pkt.id.raw());
    buf.put_u16(pkt.sequence);
    buf.put_u16(pkt.kind.as_u16());
    buf.put_slice(&pkt.payload);
    buf.freeze()
}

/// Sequence-number arithmetic helpers shared by the registry and pacer, both
/// of which reason about wraparound at 2^16.
pub mod seq {
    /// Forward distance from `expected` to `actual`, modulo 2^16.
    pub fn forward_distance(expected: u16, actual: u16) -> u16 {
        actual.wrapping_sub(expected)
    }

    pub fn next(seq: u16) -> u16 {
        seq.wrapping_add(1)
    }
}
