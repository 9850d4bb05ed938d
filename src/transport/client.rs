//! Reconnectable WebSocket client
//!
//! One background driver task owns the socket. Producers never touch it:
//! while a session is up they hand messages to the driver through an
//! unbounded channel, otherwise they append to the offline queue.
//!
//! Lock order is always `session_rx`, then `outbound`, then `queue`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{Backoff, ConnectionState, SendResult};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::pairing::TrustStore;
use crate::protocol::ControlMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Capacity of the inbound broadcast channel
const INBOUND_CAPACITY: usize = 256;

/// How long `disconnect()` lets the driver close the socket cleanly
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

struct Outbound {
    text: String,
    /// `Some` for `try_send`, which never falls back to the queue
    ack: Option<oneshot::Sender<bool>>,
}

struct Driver {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

enum SessionEnd {
    /// Link lost or never established; reconnect
    Lost { reason: String, was_connected: bool },
    /// The server is not the peer we trust; do not retry
    Rejected(String),
    /// `disconnect()` was called
    Stopped,
}

struct Inner {
    config: TransportConfig,
    trust: Arc<TrustStore>,
    state: watch::Sender<ConnectionState>,
    inbound: broadcast::Sender<String>,
    queue: Mutex<VecDeque<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    /// Receiving end of the session writer; held by the driver while a
    /// session is up so an aborted driver leaves it behind to be drained
    session_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    driver: Mutex<Option<Driver>>,
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Outbound>>> {
        self.outbound.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn driver(&self) -> MutexGuard<'_, Option<Driver>> {
        self.driver.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("Transport state -> {:?}", state);
        self.state.send_replace(state);
    }

    /// Detach the session writer and move everything still in flight back
    /// to the queue, keeping order. `failed` is the message whose write failed.
    fn teardown(&self, session_rx: &mut Option<mpsc::UnboundedReceiver<Outbound>>, failed: Option<Outbound>) {
        let mut outbound = self.outbound();
        *outbound = None;

        let mut queue = self.queue();
        let mut requeue = |msg: Outbound| match msg.ack {
            Some(ack) => {
                let _ = ack.send(false);
            }
            None => queue.push_back(msg.text),
        };

        if let Some(msg) = failed {
            requeue(msg);
        }
        if let Some(mut rx) = session_rx.take() {
            rx.close();
            while let Ok(msg) = rx.try_recv() {
                requeue(msg);
            }
        }
    }
}

/// WebSocket client that survives link drops. Cheap to clone.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use telemetry_bridge::config::TransportConfig;
/// use telemetry_bridge::pairing::TrustStore;
/// use telemetry_bridge::transport::ReconnectableClient;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let trust = Arc::new(TrustStore::load("./state/trusted_peers.json")?);
///     let client = ReconnectableClient::new(TransportConfig::default(), trust);
///     client.connect()?;
///     client.send(r#"{"type":"session_start","timestamp":0,"deviceId":"d","data":{}}"#);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ReconnectableClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ReconnectableClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectableClient")
            .field("url", &self.inner.config.url)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

impl ReconnectableClient {
    pub fn new(config: TransportConfig, trust: Arc<TrustStore>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                trust,
                state,
                inbound,
                queue: Mutex::new(VecDeque::new()),
                outbound: Mutex::new(None),
                session_rx: tokio::sync::Mutex::new(None),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to connection state changes
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().is_connected()
    }

    /// Subscribe to inbound text messages (acks and anything else the
    /// aggregator sends after `welcome`)
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<String> {
        self.inner.inbound.subscribe()
    }

    /// Number of messages waiting for a connection
    pub fn pending_count(&self) -> usize {
        self.inner.queue().len()
    }

    /// Start connecting in the background
    ///
    /// Does nothing if a driver is already running. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Untrusted` if the configured peer has not
    /// been paired
    pub fn connect(&self) -> Result<(), TransportError> {
        let peer_id = &self.inner.config.peer_id;
        if !self.inner.trust.is_trusted(peer_id) {
            return Err(TransportError::Untrusted(peer_id.clone()));
        }

        let mut driver = self.inner.driver();
        if let Some(running) = driver.as_ref() {
            if !running.handle.is_finished() {
                return Ok(());
            }
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(drive(self.inner.clone(), stop_rx));
        *driver = Some(Driver { handle, stop });
        info!("Connecting to {}", self.inner.config.url);
        Ok(())
    }

    /// Stop the link and cancel any pending reconnect
    ///
    /// Idempotent. Queued messages, and messages handed to a session that
    /// had not written them yet, are kept for the next `connect()`.
    pub async fn disconnect(&self) {
        let driver = self.inner.driver().take();

        if let Some(Driver { mut handle, stop }) = driver {
            let _ = stop.send(true);
            if timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                warn!("Transport driver did not stop in time, aborting");
                handle.abort();
                let _ = handle.await;
                let mut session_rx = self.inner.session_rx.lock().await;
                self.inner.teardown(&mut session_rx, None);
            }
            info!("Disconnected from {}", self.inner.config.url);
        }

        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Send `text`, queueing it if the link is down or the write fails
    ///
    /// Never blocks. Queued messages are delivered in order once connected.
    pub fn send(&self, text: impl Into<String>) {
        let text = text.into();
        let outbound = self.inner.outbound();

        let text = match outbound.as_ref() {
            Some(tx) => match tx.send(Outbound { text, ack: None }) {
                Ok(()) => return,
                Err(err) => err.0.text,
            },
            None => text,
        };

        self.inner.queue().push_back(text);
    }

    /// Send `text` now or report failure; never queues
    pub async fn try_send(&self, text: impl Into<String>) -> SendResult {
        let (ack, ack_rx) = oneshot::channel();
        {
            let outbound = self.inner.outbound();
            let Some(tx) = outbound.as_ref() else {
                return self.offline_result();
            };
            if tx.send(Outbound { text: text.into(), ack: Some(ack) }).is_err() {
                return self.offline_result();
            }
        }

        match ack_rx.await {
            Ok(true) => SendResult::SENT,
            _ => SendResult::RETRY,
        }
    }

    fn offline_result(&self) -> SendResult {
        match &*self.inner.state.borrow() {
            ConnectionState::Failed { .. } => SendResult::GIVE_UP,
            _ => SendResult::RETRY,
        }
    }
}

async fn drive(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    let backoff = Backoff::from_config(&inner.config);
    let max = inner.config.max_attempts;
    let mut attempt: u32 = 0;

    loop {
        if *stop.borrow() {
            return;
        }
        inner.set_state(ConnectionState::Connecting);

        match connect_once(&inner, &mut stop).await {
            SessionEnd::Stopped => return,
            SessionEnd::Rejected(reason) => {
                warn!("Connection rejected: {}", reason);
                inner.set_state(ConnectionState::Failed { reason });
                return;
            }
            SessionEnd::Lost { reason, was_connected } => {
                warn!("Connection to {} lost: {}", inner.config.url, reason);
                if was_connected {
                    attempt = 0;
                }
            }
        }

        attempt += 1;
        if attempt > max {
            let reason = format!("gave up after {} reconnect attempts", max);
            warn!("{}", reason);
            inner.set_state(ConnectionState::Failed { reason });
            return;
        }

        inner.set_state(ConnectionState::Reconnecting { attempt, max });
        let delay = backoff.delay(attempt);
        info!("Reconnecting in {:?} (attempt {}/{})", delay, attempt, max);

        tokio::select! {
            _ = sleep(delay) => {}
            _ = stop.changed() => return,
        }
    }
}

async fn connect_once(inner: &Arc<Inner>, stop: &mut watch::Receiver<bool>) -> SessionEnd {
    let connect_timeout = inner.config.connect_timeout();

    let ws = tokio::select! {
        result = timeout(connect_timeout, connect_async(inner.config.url.as_str())) => match result {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                return SessionEnd::Lost { reason: TransportError::Connect(e.to_string()).to_string(), was_connected: false };
            }
            Err(_) => {
                let reason = TransportError::ConnectTimeout(connect_timeout.as_millis() as u64).to_string();
                return SessionEnd::Lost { reason, was_connected: false };
            }
        },
        _ = stop.changed() => return SessionEnd::Stopped,
    };

    let (sink, mut source) = ws.split();

    let server_id = tokio::select! {
        result = timeout(connect_timeout, wait_for_welcome(&mut source)) => match result {
            Ok(Some(server_id)) => server_id,
            Ok(None) => {
                return SessionEnd::Lost { reason: "closed before welcome".to_string(), was_connected: false };
            }
            Err(_) => {
                return SessionEnd::Lost { reason: "no welcome from server".to_string(), was_connected: false };
            }
        },
        _ = stop.changed() => return SessionEnd::Stopped,
    };

    if server_id != inner.config.peer_id {
        return SessionEnd::Rejected(format!(
            "server id {} does not match trusted peer {}",
            server_id, inner.config.peer_id
        ));
    }

    run_session(inner, sink, source, stop).await
}

/// Read until the server's `welcome`; `None` if the link closes first
async fn wait_for_welcome(source: &mut WsSource) -> Option<String> {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Ok(ControlMessage::Welcome(welcome)) = ControlMessage::from_json(&text) {
                    return Some(welcome.server_id);
                }
                debug!("Ignoring message before welcome");
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn run_session(
    inner: &Arc<Inner>,
    mut sink: WsSink,
    mut source: WsSource,
    stop: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let mut session_rx = inner.session_rx.lock().await;
    let rx = session_rx.insert(rx);
    *inner.outbound() = Some(tx);
    inner.set_state(ConnectionState::Connected);
    info!("Connected to {}", inner.config.url);

    // Older queued messages go first; new sends wait in the channel.
    // A message leaves the queue only once written.
    let flush_delay = inner.config.flush_delay();
    loop {
        let next = inner.queue().front().cloned();
        let Some(text) = next else { break };

        if let Err(e) = sink.send(Message::Text(text)).await {
            inner.teardown(&mut session_rx, None);
            return SessionEnd::Lost { reason: e.to_string(), was_connected: true };
        }
        inner.queue().pop_front();
        sleep(flush_delay).await;
    }

    let ping_interval = inner.config.ping_interval();
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    let mut heard_since_ping = true;
    let mut failed = None;

    let end = loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    break SessionEnd::Lost { reason: "writer closed".to_string(), was_connected: true };
                };
                match sink.send(Message::Text(msg.text.clone())).await {
                    Ok(()) => {
                        if let Some(ack) = msg.ack {
                            let _ = ack.send(true);
                        }
                    }
                    Err(e) => {
                        failed = Some(msg);
                        break SessionEnd::Lost { reason: e.to_string(), was_connected: true };
                    }
                }
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    heard_since_ping = true;
                    let _ = inner.inbound.send(text);
                }
                Some(Ok(Message::Close(_))) | None => {
                    break SessionEnd::Lost { reason: "closed by peer".to_string(), was_connected: true };
                }
                Some(Err(e)) => {
                    break SessionEnd::Lost { reason: e.to_string(), was_connected: true };
                }
                Some(Ok(_)) => heard_since_ping = true,
            },
            _ = ping.tick() => {
                if !heard_since_ping {
                    break SessionEnd::Lost { reason: "heartbeat timeout".to_string(), was_connected: true };
                }
                heard_since_ping = false;
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    break SessionEnd::Lost { reason: e.to_string(), was_connected: true };
                }
            }
            _ = stop.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break SessionEnd::Stopped;
            }
        }
    };

    inner.teardown(&mut session_rx, failed);
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::TrustedPeer;
    use crate::protocol::Welcome;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    const AGGREGATOR_ID: &str = "agg-1";

    /// How the fake aggregator behaves on each accepted connection
    #[derive(Clone, Copy)]
    enum ServerMode {
        /// Send welcome, then forward every text message to the test
        Collect,
        /// Send welcome, read one message, then drop the connection
        DropAfterOne,
        /// Send welcome, then never read again (no pongs)
        Silent,
    }

    async fn spawn_server(server_id: &'static str, mode: ServerMode) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    let welcome = ControlMessage::Welcome(Welcome {
                        server_id: server_id.to_string(),
                        server_name: "Desk".to_string(),
                        version: "0.1.0".to_string(),
                        message: String::new(),
                    });
                    ws.send(Message::Text(welcome.to_json().unwrap())).await.unwrap();

                    match mode {
                        ServerMode::Collect => {
                            while let Some(Ok(msg)) = ws.next().await {
                                if let Message::Text(text) = msg {
                                    let _ = tx.send(text);
                                }
                            }
                        }
                        ServerMode::DropAfterOne => {
                            while let Some(Ok(msg)) = ws.next().await {
                                if let Message::Text(text) = msg {
                                    let _ = tx.send(text);
                                    break;
                                }
                            }
                        }
                        ServerMode::Silent => {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                    }
                });
            }
        });

        (url, rx)
    }

    fn create_client(dir: &TempDir, url: &str, trusted: bool) -> ReconnectableClient {
        let trust = Arc::new(TrustStore::load(dir.path().join("trusted_peers.json")).unwrap());
        if trusted {
            trust
                .trust(TrustedPeer {
                    peer_id: AGGREGATOR_ID.to_string(),
                    peer_name: "Desk".to_string(),
                    paired_at: 0,
                })
                .unwrap();
        }

        let config = TransportConfig {
            url: url.to_string(),
            peer_id: AGGREGATOR_ID.to_string(),
            max_attempts: 3,
            base_delay_ms: 20,
            max_delay_ms: 100,
            jitter_ms: 0,
            ping_interval_ms: 15000,
            connect_timeout_ms: 2000,
            flush_delay_ms: 1,
        };
        ReconnectableClient::new(config, trust)
    }

    async fn wait_for(client: &ReconnectableClient, pred: impl FnMut(&ConnectionState) -> bool) -> ConnectionState {
        let mut state = client.state();
        let seen = timeout(Duration::from_secs(10), state.wait_for(pred))
            .await
            .expect("state not reached in time")
            .unwrap()
            .clone();
        seen
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_connect_requires_trusted_peer() {
        let dir = TempDir::new().unwrap();
        let client = create_client(&dir, "ws://127.0.0.1:1", false);

        assert_eq!(client.connect(), Err(TransportError::Untrusted(AGGREGATOR_ID.to_string())));
        assert_eq!(client.current_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_connected_is_delivered_in_order() {
        let dir = TempDir::new().unwrap();
        let (url, mut rx) = spawn_server(AGGREGATOR_ID, ServerMode::Collect).await;
        let client = create_client(&dir, &url, true);

        client.connect().unwrap();
        wait_for(&client, ConnectionState::is_connected).await;

        for i in 0..5 {
            client.send(format!("m{}", i));
        }
        for i in 0..5 {
            assert_eq!(recv(&mut rx).await, format!("m{}", i));
        }

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_offline_queue_flushed_on_connect() {
        let dir = TempDir::new().unwrap();
        let (url, mut rx) = spawn_server(AGGREGATOR_ID, ServerMode::Collect).await;
        let client = create_client(&dir, &url, true);

        client.send("first");
        client.send("second");
        assert_eq!(client.pending_count(), 2);

        client.connect().unwrap();
        assert_eq!(recv(&mut rx).await, "first");
        assert_eq!(recv(&mut rx).await, "second");

        client.send("third");
        assert_eq!(recv(&mut rx).await, "third");
        assert_eq!(client.pending_count(), 0);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_welcome_from_wrong_server_fails() {
        let dir = TempDir::new().unwrap();
        let (url, _rx) = spawn_server("impostor", ServerMode::Collect).await;
        let client = create_client(&dir, &url, true);

        client.connect().unwrap();
        let state = wait_for(&client, |s| matches!(s, ConnectionState::Failed { .. })).await;

        match state {
            ConnectionState::Failed { reason } => assert!(reason.contains("impostor")),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let dir = TempDir::new().unwrap();
        let (url, mut rx) = spawn_server(AGGREGATOR_ID, ServerMode::DropAfterOne).await;
        let client = create_client(&dir, &url, true);
        let mut states = client.state();

        client.connect().unwrap();
        wait_for(&client, ConnectionState::is_connected).await;
        client.send("before drop");
        assert_eq!(recv(&mut rx).await, "before drop");

        timeout(
            Duration::from_secs(10),
            states.wait_for(|s| matches!(s, ConnectionState::Reconnecting { attempt: 1, .. })),
        )
        .await
        .unwrap()
        .unwrap();

        wait_for(&client, ConnectionState::is_connected).await;
        client.send("after reconnect");
        assert_eq!(recv(&mut rx).await, "after reconnect");

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let dir = TempDir::new().unwrap();
        let client = create_client(&dir, &url, true);
        client.connect().unwrap();

        let state = wait_for(&client, |s| matches!(s, ConnectionState::Failed { .. })).await;
        assert_eq!(state, ConnectionState::Failed { reason: "gave up after 3 reconnect attempts".to_string() });
        assert_eq!(client.try_send("x").await, SendResult::GIVE_UP);
    }

    #[tokio::test]
    async fn test_heartbeat_declares_silent_link_dead() {
        let dir = TempDir::new().unwrap();
        let (url, _rx) = spawn_server(AGGREGATOR_ID, ServerMode::Silent).await;
        let mut client = create_client(&dir, &url, true);
        {
            let inner = Arc::get_mut(&mut client.inner).unwrap();
            inner.config.ping_interval_ms = 50;
        }

        client.connect().unwrap();
        wait_for(&client, ConnectionState::is_connected).await;
        wait_for(&client, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_try_send_never_queues() {
        let dir = TempDir::new().unwrap();
        let client = create_client(&dir, "ws://127.0.0.1:1", true);

        assert_eq!(client.try_send("x").await, SendResult::RETRY);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_try_send_when_connected() {
        let dir = TempDir::new().unwrap();
        let (url, mut rx) = spawn_server(AGGREGATOR_ID, ServerMode::Collect).await;
        let client = create_client(&dir, &url, true);

        client.connect().unwrap();
        wait_for(&client, ConnectionState::is_connected).await;

        assert_eq!(client.try_send("batch").await, SendResult::SENT);
        assert_eq!(recv(&mut rx).await, "batch");

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_keeps_queue() {
        let dir = TempDir::new().unwrap();
        let client = create_client(&dir, "ws://127.0.0.1:1", true);

        client.disconnect().await;
        client.connect().unwrap();
        client.disconnect().await;
        client.disconnect().await;

        assert_eq!(client.current_state(), ConnectionState::Disconnected);
        client.send("kept");
        assert_eq!(client.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_timeout_keeps_unwritten_messages() {
        let dir = TempDir::new().unwrap();
        let client = create_client(&dir, "ws://127.0.0.1:1", true);

        // a live session whose writer never drains its channel
        let (tx, rx) = mpsc::unbounded_channel();
        *client.inner.session_rx.lock().await = Some(rx);
        *client.inner.outbound() = Some(tx);
        for i in 0..3 {
            client.send(format!("m{}", i));
        }
        let mut attempt = Box::pin(client.try_send("direct"));
        assert!(futures::poll!(attempt.as_mut()).is_pending());
        assert_eq!(client.pending_count(), 0);

        // a driver that ignores the stop signal
        let (stop, _stop_rx) = watch::channel(false);
        let handle = tokio::spawn(std::future::pending::<()>());
        *client.inner.driver() = Some(Driver { handle, stop });

        client.disconnect().await;

        let queued: Vec<String> = client.inner.queue().iter().cloned().collect();
        assert_eq!(queued, vec!["m0", "m1", "m2"]);
        assert_eq!(attempt.await, SendResult::RETRY);
        assert!(client.inner.outbound().is_none());
        assert_eq!(client.current_state(), ConnectionState::Disconnected);
    }
}
