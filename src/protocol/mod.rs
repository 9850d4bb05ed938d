//! # Wire Protocol Module
//!
//! Message shapes exchanged between probe and aggregator.
//!
//! This module handles:
//! - Telemetry packets (`session_start`, `session_end`, `frame`, `snapshot`, `batch_upload`)
//! - Control messages (`welcome`, `ack`, `pairing_request`, `pairing_response`)
//! - UDP discovery probe/response strings
//!
//! Everything on the WebSocket is JSON text. Telemetry packets are decoded
//! exactly once into the [`Packet`] sum type; nothing downstream compares
//! type strings.

pub mod control;
pub mod packet;
pub mod udp;

pub use control::{Ack, ControlMessage, PairingRequest, PairingResponse, Welcome};
pub use packet::{BatchData, FrameData, Packet, PacketBody, RawPacket, SessionInfo, SnapshotData};
pub use udp::ServerAnnouncement;

/// Protocol version advertised in `welcome`, mDNS TXT records and UDP responses
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current time as Unix milliseconds, the timestamp unit used on the wire
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
