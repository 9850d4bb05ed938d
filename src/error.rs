//! # Error Types
//!
//! Custom error types for Telemetry Bridge using `thiserror`.
//!
//! Each component owns a narrow error enum. Transient failures are handled
//! where they happen (the transport reconnects, the uploader retries); only
//! configuration and storage failures are expected to reach the binary.

use thiserror::Error;

/// Main error type for Telemetry Bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Transport errors (connect refused, timeout, peer reset)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Pairing errors (code mismatch, ticket expired)
    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    /// Wire frame decoding errors
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Batch upload errors
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    /// mDNS daemon or registration errors
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Wire protocol errors (unexpected packet shape)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Encoding errors on the outbound path
    #[error("Encode error: {0}")]
    Encode(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// SQLite storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Logging subscriber setup errors
    #[error("Logging error: {0}")]
    Logging(String),

    /// Background task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Errors raised by the reconnectable transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} is not trusted, pair first")]
    Untrusted(String),

    #[error("connection attempt timed out after {0} ms")]
    ConnectTimeout(u64),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("not connected")]
    NotConnected,
}

/// Errors reported to the caller of the pairing API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("invalid pairing code")]
    CodeMismatch,

    #[error("pairing ticket expired")]
    Expired,

    #[error("no outstanding pairing ticket")]
    NoTicket,

    #[error("pairing request rejected: {0}")]
    Rejected(String),

    #[error("malformed pairing message: {0}")]
    Malformed(String),
}

/// Errors raised while decoding a wire frame. Decoding fails closed: none of
/// these ever yield bytes to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("bad frame magic")]
    BadMagic,

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown compression type {0}")]
    UnknownCompression(u8),

    #[error("unknown encryption type {0}")]
    UnknownEncryption(u8),

    #[error("frame is encrypted but no key is configured")]
    MissingKey,

    #[error("authentication failed")]
    Authentication,

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("size mismatch: header says {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("invalid text envelope: {0}")]
    Envelope(String),
}

/// Errors raised by the batched uploader.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("batch of {0} items could not be sent")]
    BatchFailed(usize),

    #[error("sink gave up on a batch of {0} items, kept for later")]
    GaveUp(usize),

    #[error("spool error: {0}")]
    Spool(String),
}

/// Result type alias for Telemetry Bridge
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_errors_convert_into_bridge_error() {
        let err: BridgeError = TransportError::NotConnected.into();
        assert!(matches!(err, BridgeError::Transport(TransportError::NotConnected)));

        let err: BridgeError = PairingError::Expired.into();
        assert_eq!(err.to_string(), "Pairing error: pairing ticket expired");

        let err: BridgeError = DecodeError::Authentication.into();
        assert_eq!(err.to_string(), "Decode error: authentication failed");
    }

    #[test]
    fn test_truncated_message_includes_sizes() {
        let err = DecodeError::Truncated { needed: 13, available: 4 };
        assert_eq!(err.to_string(), "frame truncated: need 13 bytes, have 4");
    }
}
