//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and every field has a default, so an empty file (or no file
//! at all, via [`Config::default`]) yields a working local setup.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::{CompressionType, EncryptionType};
use crate::error::{BridgeError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub uploader: UploaderConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Peer discovery configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Prefix of the UDP probe/response strings (`<APP>_DISCOVER`)
    #[serde(default = "default_app_tag")]
    pub app_tag: String,

    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    #[serde(default = "default_service_type")]
    pub service_type: String,

    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_broadcast_addresses")]
    pub broadcast_addresses: Vec<String>,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    #[serde(default = "default_true")]
    pub mdns_enabled: bool,

    #[serde(default = "default_true")]
    pub udp_enabled: bool,
}

/// Pairing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PairingConfig {
    #[serde(default = "default_pairing_timeout_ms")]
    pub timeout_ms: u64,

    /// Directory holding the trust store and the device identity
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default)]
    pub device_model: String,

    /// Port the probe listens on for pairing requests
    #[serde(default = "default_pairing_port")]
    pub port: u16,
}

/// Reconnectable transport configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    #[serde(default = "default_transport_url")]
    pub url: String,

    /// Id of the trusted aggregator this probe connects to
    #[serde(default)]
    pub peer_id: String,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,
}

/// Compression and encryption configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CodecConfig {
    #[serde(default = "default_compression")]
    pub compression: CompressionType,

    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    #[serde(default = "default_encryption")]
    pub encryption: EncryptionType,

    /// Pre-shared session key, hex encoded (16 or 32 bytes)
    #[serde(default)]
    pub key_hex: Option<String>,

    /// Device-bound key file, created on first use
    #[serde(default)]
    pub key_file: Option<String>,
}

/// Batched uploader configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UploaderConfig {
    #[serde(default = "default_upload_interval_ms")]
    pub upload_interval_ms: u64,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_spool_path")]
    pub spool_path: String,
}

/// What the ingestion side does with frames that arrive before a session
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PreSessionPolicy {
    /// Acknowledge and discard
    Drop,
    /// Keep up to `pre_roll_limit` records and attach them to the next session
    Buffer,
}

/// Ingestion server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_ingest_port")]
    pub port: u16,

    #[serde(default = "default_server_name")]
    pub server_name: String,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub require_trusted: bool,

    #[serde(default = "default_pre_session")]
    pub pre_session: PreSessionPolicy,

    #[serde(default = "default_pre_roll_limit")]
    pub pre_roll_limit: usize,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// When set, logs are also written to a daily rolling file here
    #[serde(default)]
    pub directory: Option<String>,
}

// Default value functions
fn default_true() -> bool { true }

fn default_app_tag() -> String { "TELEMETRY_BRIDGE".to_string() }
fn default_udp_port() -> u16 { 9876 }
fn default_service_type() -> String { "_telemetrybridge._tcp.local.".to_string() }
fn default_discovery_timeout_ms() -> u64 { 3000 }
fn default_broadcast_addresses() -> Vec<String> { vec!["255.255.255.255".to_string()] }
fn default_sweep_interval_ms() -> u64 { 10000 }

fn default_pairing_timeout_ms() -> u64 { 300_000 }
fn default_state_dir() -> String { "./state".to_string() }
fn default_device_name() -> String { "telemetry-probe".to_string() }
fn default_pairing_port() -> u16 { 38300 }

fn default_transport_url() -> String { "ws://127.0.0.1:8080".to_string() }
fn default_max_attempts() -> u32 { 10 }
fn default_base_delay_ms() -> u64 { 1000 }
fn default_max_delay_ms() -> u64 { 30000 }
fn default_jitter_ms() -> u64 { 1000 }
fn default_ping_interval_ms() -> u64 { 15000 }
fn default_connect_timeout_ms() -> u64 { 10000 }
fn default_flush_delay_ms() -> u64 { 10 }

fn default_compression() -> CompressionType { CompressionType::Gzip }
fn default_compression_threshold() -> usize { 512 }
fn default_encryption() -> EncryptionType { EncryptionType::None }

fn default_upload_interval_ms() -> u64 { 5000 }
fn default_max_batch_size() -> usize { 50 }
fn default_spool_path() -> String { "./state/pending_uploads.json".to_string() }

fn default_bind_address() -> String { "0.0.0.0".to_string() }
fn default_ingest_port() -> u16 { 8080 }
fn default_server_name() -> String { "Telemetry Aggregator".to_string() }
fn default_database_path() -> String { "./state/telemetry.sqlite3".to_string() }
fn default_liveness_timeout_ms() -> u64 { 30000 }
fn default_pre_session() -> PreSessionPolicy { PreSessionPolicy::Drop }
fn default_pre_roll_limit() -> usize { 256 }

fn default_log_level() -> String { "info".to_string() }

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            app_tag: default_app_tag(),
            udp_port: default_udp_port(),
            service_type: default_service_type(),
            timeout_ms: default_discovery_timeout_ms(),
            broadcast_addresses: default_broadcast_addresses(),
            sweep_interval_ms: default_sweep_interval_ms(),
            mdns_enabled: true,
            udp_enabled: true,
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_pairing_timeout_ms(),
            state_dir: default_state_dir(),
            device_name: default_device_name(),
            device_model: String::new(),
            port: default_pairing_port(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: default_transport_url(),
            peer_id: String::new(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            flush_delay_ms: default_flush_delay_ms(),
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            compression_threshold: default_compression_threshold(),
            encryption: default_encryption(),
            key_hex: None,
            key_file: None,
        }
    }
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            upload_interval_ms: default_upload_interval_ms(),
            max_batch_size: default_max_batch_size(),
            spool_path: default_spool_path(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_ingest_port(),
            server_name: default_server_name(),
            database_path: default_database_path(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            require_trusted: true,
            pre_session: default_pre_session(),
            pre_roll_limit: default_pre_roll_limit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Probe string sent by the prober, e.g. `TELEMETRY_BRIDGE_DISCOVER`
    pub fn probe_message(&self) -> String {
        crate::protocol::udp::probe_message(&self.app_tag)
    }

    /// Prefix of every valid responder reply, e.g. `TELEMETRY_BRIDGE_SERVER:`
    pub fn response_prefix(&self) -> String {
        crate::protocol::udp::response_prefix(&self.app_tag)
    }
}

impl PairingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn trust_store_path(&self) -> PathBuf {
        Path::new(&self.state_dir).join("trusted_peers.json")
    }
}

impl TransportConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}

impl UploaderConfig {
    pub fn upload_interval(&self) -> Duration {
        Duration::from_millis(self.upload_interval_ms)
    }
}

impl IngestConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

fn invalid(msg: impl std::fmt::Display) -> BridgeError {
    BridgeError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_bridge::config::Config;
    ///
    /// let config = Config::load("config/aggregator.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Discovery
        if self.discovery.app_tag.is_empty() || self.discovery.app_tag.contains(':') {
            return Err(invalid("app_tag must be non-empty and must not contain ':'"));
        }

        if self.discovery.udp_port == 0 {
            return Err(invalid("udp_port must be greater than 0"));
        }

        if !self.discovery.service_type.ends_with(".local.") {
            return Err(invalid("service_type must end with '.local.'"));
        }

        if self.discovery.timeout_ms == 0 || self.discovery.timeout_ms > 60000 {
            return Err(invalid("discovery timeout_ms must be between 1 and 60000"));
        }

        if self.discovery.sweep_interval_ms < self.discovery.timeout_ms {
            return Err(invalid("sweep_interval_ms must not be shorter than discovery timeout_ms"));
        }

        for addr in &self.discovery.broadcast_addresses {
            if addr.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(invalid(format!("broadcast address '{}' is not an IPv4 address", addr)));
            }
        }

        // Pairing
        if self.pairing.timeout_ms == 0 {
            return Err(invalid("pairing timeout_ms must be greater than 0"));
        }

        if self.pairing.state_dir.is_empty() {
            return Err(invalid("pairing state_dir cannot be empty"));
        }

        // Transport
        if !(self.transport.url.starts_with("ws://") || self.transport.url.starts_with("wss://")) {
            return Err(invalid("transport url must start with ws:// or wss://"));
        }

        if self.transport.max_attempts == 0 {
            return Err(invalid("max_attempts must be greater than 0"));
        }

        if self.transport.base_delay_ms == 0 || self.transport.base_delay_ms > self.transport.max_delay_ms {
            return Err(invalid("base_delay_ms must be between 1 and max_delay_ms"));
        }

        if self.transport.max_delay_ms > 600_000 {
            return Err(invalid("max_delay_ms must not exceed 600000"));
        }

        if self.transport.ping_interval_ms < 100 || self.transport.ping_interval_ms > 300_000 {
            return Err(invalid("ping_interval_ms must be between 100 and 300000"));
        }

        if self.transport.connect_timeout_ms == 0 || self.transport.connect_timeout_ms > 60000 {
            return Err(invalid("connect_timeout_ms must be between 1 and 60000"));
        }

        // Codec
        if self.codec.encryption != EncryptionType::None
            && self.codec.key_hex.is_none()
            && self.codec.key_file.is_none()
        {
            return Err(invalid("encryption requires key_hex or key_file"));
        }

        if let Some(key_hex) = &self.codec.key_hex {
            let key = hex::decode(key_hex)
                .map_err(|e| invalid(format!("key_hex is not valid hex: {}", e)))?;
            let expected = self.codec.encryption.key_len().unwrap_or(key.len());
            if key.len() != expected || !(key.len() == 16 || key.len() == 32) {
                return Err(invalid("key_hex length does not match the encryption type"));
            }
        }

        // Uploader
        if self.uploader.upload_interval_ms == 0 || self.uploader.upload_interval_ms > 600_000 {
            return Err(invalid("upload_interval_ms must be between 1 and 600000"));
        }

        if self.uploader.max_batch_size == 0 || self.uploader.max_batch_size > 1000 {
            return Err(invalid("max_batch_size must be between 1 and 1000"));
        }

        if self.uploader.spool_path.is_empty() {
            return Err(invalid("spool_path cannot be empty"));
        }

        // Ingest
        if self.ingest.database_path.is_empty() {
            return Err(invalid("database_path cannot be empty"));
        }

        if self.ingest.liveness_timeout_ms < 1000 {
            return Err(invalid("liveness_timeout_ms must be at least 1000"));
        }

        if self.ingest.pre_session == PreSessionPolicy::Buffer && self.ingest.pre_roll_limit == 0 {
            return Err(invalid("pre_roll_limit must be greater than 0 when buffering"));
        }

        // Logging
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("log level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }
}
