//! # Telemetry Bridge
//!
//! Runs either side of the bridge.
//!
//! - `aggregator`: accepts probe connections, stores sessions in SQLite and
//!   answers discovery probes
//! - `probe`: reads telemetry items as JSON lines on stdin and uploads them
//!   in batches to a trusted aggregator
//! - `pair`: presents a probe's pairing code and trusts the probe
//! - `discover`: lists aggregators on the local network
//! - `trust`: inspects or edits the trust store
//!
//! # Examples
//!
//! ```bash
//! telemetry-bridge --config aggregator.toml aggregator
//! telemetry-bridge probe --pair < samples.jsonl
//! telemetry-bridge pair --url ws://192.168.1.20:38300 --code 123456
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use telemetry_bridge::codec::Codec;
use telemetry_bridge::config::Config;
use telemetry_bridge::discovery::{self, Discovery, DiscoveryResponder, MdnsAdvertiser};
use telemetry_bridge::ingest::IngestServer;
use telemetry_bridge::logging;
use telemetry_bridge::pairing::{self, PairingManager, PairingState, PairingTicket, TrustStore};
use telemetry_bridge::protocol::{now_millis, ServerAnnouncement, PROTOCOL_VERSION};
use telemetry_bridge::store::SessionStore;
use telemetry_bridge::transport::{ConnectionState, ReconnectableClient};
use telemetry_bridge::uploader::BatchUploader;

/// Configuration file used when `--config` is not given, if present
const DEFAULT_CONFIG_FILE: &str = "telemetry-bridge.toml";

#[derive(Debug, Parser)]
#[command(name = "telemetry-bridge", version, about = "Local-network telemetry bridge")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept probe connections and store sessions
    Aggregator,

    /// Upload telemetry read as JSON lines from stdin
    Probe {
        /// Issue a pairing ticket at startup
        #[arg(long)]
        pair: bool,

        /// Find the aggregator on the network instead of using `transport.url`
        #[arg(long)]
        discover: bool,
    },

    /// Pair with a probe (run on the aggregator)
    Pair {
        /// Probe pairing endpoint, e.g. ws://192.168.1.20:38300
        #[arg(long, requires = "code", conflicts_with = "ticket")]
        url: Option<String>,

        /// Six digit code shown by the probe
        #[arg(long)]
        code: Option<String>,

        /// Ticket JSON as scanned from the probe's QR code
        #[arg(long)]
        ticket: Option<String>,
    },

    /// List aggregators on the local network
    Discover {
        /// Keep sweeping every `sweep_interval_ms`
        #[arg(long)]
        watch: bool,
    },

    /// Inspect or edit the trust store
    Trust {
        #[command(subcommand)]
        action: TrustAction,
    },
}

#[derive(Debug, Subcommand)]
enum TrustAction {
    List,
    Remove { peer_id: String },
    Clear,
}

/// One stdin line of the probe
#[derive(Debug, Deserialize)]
struct InputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path).with_context(|| format!("failed to load {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            Config::load(DEFAULT_CONFIG_FILE).with_context(|| format!("failed to load {}", DEFAULT_CONFIG_FILE))
        }
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let _log_guard = logging::init(&config.logging)?;

    info!("Telemetry Bridge v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Aggregator => run_aggregator(config).await,
        Command::Probe { pair, discover } => run_probe(config, pair, discover).await,
        Command::Pair { url, code, ticket } => run_pair(config, url, code, ticket).await,
        Command::Discover { watch } => run_discover(config, watch).await,
        Command::Trust { action } => run_trust(config, action),
    }
}

fn open_trust_store(config: &Config) -> Result<Arc<TrustStore>> {
    let path = config.pairing.trust_store_path();
    let store = TrustStore::load(&path).with_context(|| format!("failed to load trust store {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn run_aggregator(config: Config) -> Result<()> {
    let store = Arc::new(
        SessionStore::open(&config.ingest.database_path)
            .with_context(|| format!("failed to open {}", config.ingest.database_path))?,
    );
    store.backfill_open_sessions(now_millis())?;

    let trust = open_trust_store(&config)?;
    let codec = Codec::from_config(&config.codec)?;
    let server = IngestServer::new(config.ingest.clone(), store, trust, codec)?;

    let listener = server.bind().await.context("failed to bind ingestion port")?;
    let port = listener.local_addr()?.port();
    info!("Aggregator {} ({}) ready", config.ingest.server_name, server.server_id());

    let mut tasks = Vec::new();
    let serving = server.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = serving.serve(listener).await {
            warn!("Ingestion server stopped: {}", e);
        }
    }));
    tasks.push(server.spawn_liveness_sweep());

    let mut events = server.subscribe();
    tasks.push(tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!("{:?}", event),
                Err(broadcast::error::RecvError::Lagged(missed)) => debug!("Missed {} ingest event(s)", missed),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }));

    if config.discovery.udp_enabled {
        let announcement = ServerAnnouncement {
            port,
            name: config.ingest.server_name.clone(),
            version: Some(PROTOCOL_VERSION.to_string()),
        };
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.discovery.udp_port);
        match DiscoveryResponder::bind(addr, &config.discovery.app_tag, announcement).await {
            Ok(responder) => tasks.push(tokio::spawn(responder.run())),
            Err(e) => warn!("Discovery responder unavailable: {}", e),
        }
    }

    let advertiser = if config.discovery.mdns_enabled {
        MdnsAdvertiser::register(
            &config.discovery.service_type,
            &config.ingest.server_name,
            server.server_id(),
            port,
            &[discovery::local_ip()],
        )
        .map_err(|e| warn!("mDNS advertising unavailable: {}", e))
        .ok()
    } else {
        None
    };

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    if let Some(advertiser) = advertiser {
        advertiser.shutdown();
    }
    for task in tasks {
        task.abort();
    }
    Ok(())
}

async fn run_probe(config: Config, pair: bool, discover: bool) -> Result<()> {
    let trust = open_trust_store(&config)?;
    let device_id = trust.device_id()?;
    info!("Probe device id {}", device_id);

    let manager = PairingManager::new(&config.pairing, trust.clone(), discovery::local_ip().to_string());
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.pairing.port))
        .await
        .context("failed to bind pairing port")?;
    let pairing_task = tokio::spawn(pairing::endpoint::serve_pairing(listener, manager.clone()));

    let mut peer_id = config.transport.peer_id.clone();
    if peer_id.is_empty() {
        peer_id = trust
            .list()
            .into_iter()
            .max_by_key(|p| p.paired_at)
            .map(|p| p.peer_id)
            .unwrap_or_default();
    }

    if pair || !trust.is_trusted(&peer_id) {
        peer_id = wait_for_pairing(&manager).await?;
    }

    let mut transport = config.transport.clone();
    transport.peer_id = peer_id;
    if discover {
        transport.url = discover_url(&config).await?;
    }

    let codec = Codec::from_config(&config.codec)?;
    let client = ReconnectableClient::new(transport, trust.clone());
    let uploader = BatchUploader::new(device_id, config.uploader.clone(), codec, Arc::new(client.clone()));

    uploader.start()?;
    client.connect()?;

    let mut state = client.state();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    info!("Reading telemetry from stdin, press Ctrl+C to exit");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => queue_line(&uploader, &line),
                    None => {
                        info!("End of input");
                        break;
                    }
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                info!("Transport {:?}", current);
                if let ConnectionState::Failed { reason } = current {
                    warn!("Transport failed: {}", reason);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    if client.is_connected() {
        let report = uploader.force_flush_all().await;
        info!("{} item(s) uploaded before shutdown", report.uploaded_count);
    }
    uploader.stop().await?;
    client.disconnect().await;
    pairing_task.abort();
    Ok(())
}

fn queue_line(uploader: &BatchUploader, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<InputItem>(line) {
        Ok(item) => uploader.add_item(item.kind, item.data),
        Err(e) => warn!("Skipping input line: {}", e),
    }
}

/// Issue a ticket and block until an aggregator pairs with it
async fn wait_for_pairing(manager: &PairingManager) -> Result<String> {
    let ticket = manager.generate_ticket()?;
    print_ticket(&ticket);

    let mut state = manager.state();
    loop {
        let current = state.borrow_and_update().clone();
        match current {
            PairingState::Paired { peer_id } => {
                info!("Paired with {}", peer_id);
                return Ok(peer_id);
            }
            PairingState::Expired => bail!("pairing ticket expired before an aggregator paired"),
            PairingState::Idle | PairingState::WaitingForPeer => {}
        }

        tokio::select! {
            changed = state.changed() => changed.context("pairing manager dropped")?,
            _ = tokio::signal::ctrl_c() => bail!("pairing cancelled"),
        }
    }
}

fn print_ticket(ticket: &PairingTicket) {
    match pairing::qr::render_qr(ticket) {
        Ok(qr) => println!("{}", qr),
        Err(e) => debug!("QR rendering failed: {}", e),
    }
    println!("Pairing code: {}", ticket.pairing_code);
    println!(
        "Pair from the aggregator with: telemetry-bridge pair --url ws://{}:{} --code {}",
        ticket.ip_address, ticket.transport_port, ticket.pairing_code
    );
}

async fn discover_url(config: &Config) -> Result<String> {
    let discovery = Discovery::new(config.discovery.clone());
    let peers = discovery.probe(config.discovery.timeout()).await;
    let Some(peer) = peers.first() else {
        bail!("no aggregator found on the local network");
    };
    info!("Using aggregator {} at {}", peer.name, peer.url());
    Ok(peer.url())
}

async fn run_pair(config: Config, url: Option<String>, code: Option<String>, ticket: Option<String>) -> Result<()> {
    let (url, code) = match (url, code, ticket) {
        (Some(url), Some(code), _) => (url, code),
        (_, _, Some(ticket)) => {
            let ticket: PairingTicket = serde_json::from_str(&ticket).context("invalid ticket JSON")?;
            (format!("ws://{}:{}", ticket.ip_address, ticket.transport_port), ticket.pairing_code)
        }
        _ => bail!("either --url and --code or --ticket is required"),
    };

    let trust = open_trust_store(&config)?;
    let peer = pairing::endpoint::complete_pairing(&url, &code, &trust, &config.ingest.server_name).await?;
    println!("Paired with {} ({})", peer.peer_name, peer.peer_id);
    Ok(())
}

async fn run_discover(config: Config, watch: bool) -> Result<()> {
    let discovery = Discovery::new(config.discovery.clone());

    if !watch {
        for peer in discovery.probe(config.discovery.timeout()).await {
            println!("{}", serde_json::to_string(&peer)?);
        }
        return Ok(());
    }

    let sweep = discovery.spawn_periodic_sweep(config.discovery.sweep_interval());
    let mut results = sweep.subscribe();
    loop {
        tokio::select! {
            result = results.recv() => {
                let Ok(peers) = result else { continue };
                println!("{}", serde_json::to_string(&peers)?);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    sweep.stop();
    Ok(())
}

fn run_trust(config: Config, action: TrustAction) -> Result<()> {
    let trust = open_trust_store(&config)?;
    match action {
        TrustAction::List => {
            for peer in trust.list() {
                println!("{}", serde_json::to_string(&peer)?);
            }
        }
        TrustAction::Remove { peer_id } => {
            if !trust.remove(&peer_id)? {
                bail!("{} is not a trusted peer", peer_id);
            }
        }
        TrustAction::Clear => trust.clear()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_probe_flags() {
        let cli = Cli::try_parse_from(["telemetry-bridge", "--config", "probe.toml", "probe", "--pair"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some(Path::new("probe.toml")));
        assert!(matches!(cli.command, Command::Probe { pair: true, discover: false }));
    }

    #[test]
    fn test_pair_requires_code_with_url() {
        assert!(Cli::try_parse_from(["telemetry-bridge", "pair", "--url", "ws://10.0.0.5:38300"]).is_err());
        assert!(Cli::try_parse_from(["telemetry-bridge", "pair", "--url", "ws://h:1", "--code", "123456"]).is_ok());
    }

    #[test]
    fn test_input_item_defaults_data() {
        let item: InputItem = serde_json::from_str(r#"{"type":"session_end"}"#).unwrap();
        assert_eq!(item.kind, "session_end");
        assert!(item.data.is_null());
    }

    #[test]
    fn test_explicit_missing_config_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(load_config(Some(&path)).is_err());
    }
}
