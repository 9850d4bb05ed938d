//! # Ingestion Module
//!
//! WebSocket server on the aggregator side.
//!
//! This module handles:
//! - Greeting every connection with `welcome{serverId, serverName, version}`
//! - Decoding each message once (plain JSON, text envelope or binary frame)
//! - Routing packets through a per-connection [`ConnectionContext`]
//! - Acknowledging every message with `{type:"ack", received, stored}`
//! - Refusing devices that are not in the trust store
//! - Tracking connected devices and marking silent ones stale
//!
//! Lifecycle changes are published as [`IngestEvent`]s on a broadcast channel.

pub mod context;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use context::{ConnectionContext, Handled};

use crate::codec::{Codec, ENVELOPE_TYPE};
use crate::config::IngestConfig;
use crate::error::{BridgeError, Result, TransportError};
use crate::pairing::TrustStore;
use crate::protocol::{now_millis, Ack, ControlMessage, Packet, Welcome, PROTOCOL_VERSION};
use crate::store::SessionStore;

/// How often the liveness sweep runs
pub const LIVENESS_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestEvent {
    DeviceConnected { connection_id: String, device_id: String },
    DeviceDisconnected { connection_id: String, device_id: Option<String> },
    /// No traffic for the liveness timeout
    DeviceStale { connection_id: String, device_id: Option<String> },
    SessionStarted { device_id: String, session_id: String, resumed: bool },
    SessionEnded { device_id: String, session_id: String },
}

/// Registry view of one live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedDevice {
    pub connection_id: String,
    pub device_id: Option<String>,
    pub remote_addr: String,
    pub connected_at: i64,
    pub stale: bool,
}

struct RegistryEntry {
    device: ConnectedDevice,
    last_seen: Instant,
}

/// One inbound WebSocket payload
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

/// What to do after processing a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ack(Ack),
    Close(String),
}

#[derive(Deserialize)]
struct TypeTag {
    #[serde(rename = "type")]
    kind: String,
}

struct ServerInner {
    config: IngestConfig,
    server_id: String,
    store: Arc<SessionStore>,
    trust: Arc<TrustStore>,
    codec: Codec,
    events: broadcast::Sender<IngestEvent>,
    registry: Mutex<HashMap<String, RegistryEntry>>,
}

/// Aggregator ingestion server. Cheap to clone.
#[derive(Clone)]
pub struct IngestServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for IngestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestServer")
            .field("server_id", &self.inner.server_id)
            .field("port", &self.inner.config.port)
            .finish_non_exhaustive()
    }
}

impl IngestServer {
    /// Create a server
    ///
    /// The server id announced in `welcome` is the trust store's device id,
    /// which is what probes record when they pair with this aggregator.
    ///
    /// # Errors
    ///
    /// Returns error if the device id cannot be created
    pub fn new(config: IngestConfig, store: Arc<SessionStore>, trust: Arc<TrustStore>, codec: Codec) -> Result<Self> {
        let server_id = trust.device_id()?;
        let (events, _) = broadcast::channel(256);

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                server_id,
                store,
                trust,
                codec,
                events,
                registry: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.inner.events.subscribe()
    }

    pub fn connected_devices(&self) -> Vec<ConnectedDevice> {
        let mut devices: Vec<_> = self.registry().values().map(|e| e.device.clone()).collect();
        devices.sort_by_key(|d| d.connected_at);
        devices
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
        self.inner.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: IngestEvent) {
        debug!("Ingest event: {:?}", event);
        let _ = self.inner.events.send(event);
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.inner.config.bind_address, self.inner.config.port);
        Ok(TcpListener::bind(&addr).await?)
    }

    /// Accept connections until the listener fails
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Ingestion server listening on {}", addr);
        }

        loop {
            let (stream, remote) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote).await {
                    warn!("Connection from {} ended with error: {}", remote, e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let ws = accept_async(stream)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let connection_id = self.register_connection(remote);
        info!("Connection {} from {}", connection_id, remote);

        let result = self.run_connection(ws, &connection_id).await;
        self.unregister_connection(&connection_id);
        result
    }

    async fn run_connection(
        &self,
        ws: tokio_tungstenite::WebSocketStream<TcpStream>,
        connection_id: &str,
    ) -> Result<()> {
        let (mut sink, mut source) = ws.split();
        let send_err = |e: tokio_tungstenite::tungstenite::Error| BridgeError::from(TransportError::Send(e.to_string()));

        let welcome = ControlMessage::Welcome(Welcome {
            server_id: self.inner.server_id.clone(),
            server_name: self.inner.config.server_name.clone(),
            version: PROTOCOL_VERSION.to_string(),
            message: "connected".to_string(),
        });
        sink.send(Message::Text(welcome.to_json()?)).await.map_err(send_err)?;

        let mut ctx = ConnectionContext::new(
            connection_id,
            self.inner.config.pre_session,
            self.inner.config.pre_roll_limit,
        );

        while let Some(msg) = source.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("Connection {} read error: {}", connection_id, e);
                    break;
                }
            };
            self.touch(connection_id);

            let inbound = match msg {
                Message::Text(text) => Inbound::Text(text),
                Message::Binary(bytes) => Inbound::Binary(bytes),
                Message::Close(_) => break,
                _ => continue,
            };

            // SQLite writes block; keep them off the runtime workers
            let server = self.clone();
            let (returned, verdict) = tokio::task::spawn_blocking(move || {
                let verdict = server.process(&mut ctx, inbound);
                (ctx, verdict)
            })
            .await?;
            ctx = returned;

            match verdict {
                Verdict::Ack(ack) => {
                    let text = ControlMessage::Ack(ack).to_json()?;
                    sink.send(Message::Text(text)).await.map_err(send_err)?;
                }
                Verdict::Close(reason) => {
                    warn!("Closing connection {}: {}", connection_id, reason);
                    let frame = CloseFrame { code: CloseCode::Policy, reason: reason.into() };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }

        Ok(())
    }

    /// Decode and route one message
    ///
    /// Undecodable messages are acknowledged with `received: false` and
    /// otherwise ignored.
    pub fn process(&self, ctx: &mut ConnectionContext, inbound: Inbound) -> Verdict {
        const REJECTED: Verdict = Verdict::Ack(Ack { received: false, stored: false });

        let text = match self.decode(inbound) {
            Ok(text) => text,
            Err(e) => {
                warn!("Discarding message on {}: {}", ctx.connection_id(), e);
                return REJECTED;
            }
        };

        let packet = match Packet::from_json(&text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Discarding message on {}: {}", ctx.connection_id(), e);
                return REJECTED;
            }
        };

        if ctx.device_id().is_none() && self.inner.config.require_trusted && !self.inner.trust.is_trusted(&packet.device_id) {
            return Verdict::Close(format!("device {} is not paired", packet.device_id));
        }

        match ctx.handle(&self.inner.store, packet) {
            Ok(handled) => {
                for event in handled.events {
                    if let IngestEvent::DeviceConnected { connection_id, device_id } = &event {
                        self.bind_device(connection_id, device_id);
                    }
                    self.publish(event);
                }
                Verdict::Ack(Ack { received: true, stored: handled.stored })
            }
            Err(BridgeError::Protocol(reason)) => {
                warn!("Rejected packet on {}: {}", ctx.connection_id(), reason);
                Verdict::Ack(Ack { received: true, stored: false })
            }
            Err(e) => {
                error!("Failed to store packet on {}: {}", ctx.connection_id(), e);
                Verdict::Ack(Ack { received: true, stored: false })
            }
        }
    }

    fn decode(&self, inbound: Inbound) -> Result<String> {
        let bytes = match inbound {
            Inbound::Binary(bytes) => self.inner.codec.decode(&bytes)?,
            Inbound::Text(text) => {
                let is_envelope = serde_json::from_str::<TypeTag>(&text)
                    .map(|tag| tag.kind == ENVELOPE_TYPE)
                    .unwrap_or(false);
                if !is_envelope {
                    return Ok(text);
                }
                self.inner.codec.decode_envelope(&text)?
            }
        };

        String::from_utf8(bytes).map_err(|e| BridgeError::Protocol(format!("payload is not UTF-8: {}", e)))
    }

    fn register_connection(&self, remote: SocketAddr) -> String {
        let connection_id = Uuid::new_v4().to_string();
        self.registry().insert(
            connection_id.clone(),
            RegistryEntry {
                device: ConnectedDevice {
                    connection_id: connection_id.clone(),
                    device_id: None,
                    remote_addr: remote.to_string(),
                    connected_at: now_millis(),
                    stale: false,
                },
                last_seen: Instant::now(),
            },
        );
        connection_id
    }

    fn bind_device(&self, connection_id: &str, device_id: &str) {
        if let Some(entry) = self.registry().get_mut(connection_id) {
            entry.device.device_id = Some(device_id.to_string());
        }
    }

    fn touch(&self, connection_id: &str) {
        if let Some(entry) = self.registry().get_mut(connection_id) {
            entry.last_seen = Instant::now();
            entry.device.stale = false;
        }
    }

    fn unregister_connection(&self, connection_id: &str) {
        let removed = self.registry().remove(connection_id);
        if let Some(entry) = removed {
            info!("Connection {} closed", connection_id);
            self.publish(IngestEvent::DeviceDisconnected {
                connection_id: connection_id.to_string(),
                device_id: entry.device.device_id,
            });
        }
    }

    /// Mark connections silent for longer than the liveness timeout
    ///
    /// # Returns
    ///
    /// Number of connections newly marked stale
    pub fn sweep_stale(&self, now: Instant) -> usize {
        let timeout = self.inner.config.liveness_timeout();
        let mut stale = Vec::new();

        for entry in self.registry().values_mut() {
            if !entry.device.stale && now.saturating_duration_since(entry.last_seen) > timeout {
                entry.device.stale = true;
                stale.push(IngestEvent::DeviceStale {
                    connection_id: entry.device.connection_id.clone(),
                    device_id: entry.device.device_id.clone(),
                });
            }
        }

        let count = stale.len();
        for event in stale {
            warn!("No traffic within liveness timeout: {:?}", event);
            self.publish(event);
        }
        count
    }

    /// Run [`sweep_stale`](Self::sweep_stale) every second
    pub fn spawn_liveness_sweep(&self) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LIVENESS_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                server.sweep_stale(Instant::now());
            }
        })
    }
}
