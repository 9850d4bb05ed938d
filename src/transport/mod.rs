//! # Transport Module
//!
//! Self-healing WebSocket link from probe to aggregator.
//!
//! This module handles:
//! - Connecting only to a trusted aggregator (checked against the trust store
//!   and against the `serverId` in the aggregator's `welcome`)
//! - Reconnecting with capped exponential backoff and jitter
//! - Queueing messages while offline and flushing them in order on reconnect
//! - Detecting dead links with a ping heartbeat
//!
//! State changes are published on a `watch` channel and inbound text on a
//! `broadcast` channel.

pub mod backoff;
pub mod client;

pub use backoff::Backoff;
pub use client::ReconnectableClient;

/// Connection state of a [`ReconnectableClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, max: u32 },
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Outcome of a non-queueing send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendResult {
    pub ok: bool,
    /// The failure is transient and the same message may succeed later
    pub should_retry: bool,
}

impl SendResult {
    pub const SENT: SendResult = SendResult { ok: true, should_retry: false };
    pub const RETRY: SendResult = SendResult { ok: false, should_retry: true };
    pub const GIVE_UP: SendResult = SendResult { ok: false, should_retry: false };
}
