//! # Telemetry Bridge Library
//!
//! Carry device telemetry from a handheld probe to a desktop aggregator over
//! an unreliable local network.
//!
//! The probe side finds an aggregator ([`discovery`]), establishes trust once
//! ([`pairing`]), and ships measurements in durable batches ([`uploader`])
//! over a self-healing WebSocket ([`transport`]), optionally compressed and
//! encrypted ([`codec`]). The aggregator side accepts those connections
//! ([`ingest`]) and persists sessions into SQLite ([`store`]).

pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod pairing;
pub mod persist;
pub mod protocol;
pub mod store;
pub mod transport;
pub mod uploader;
