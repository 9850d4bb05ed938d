//! # Discovery Module
//!
//! Finds aggregators on the local network.
//!
//! Two channels run concurrently until a deadline:
//! - mDNS browsing for the configured service type
//! - A UDP broadcast probe answered by [`DiscoveryResponder`]
//!
//! Reports from both are merged by `(host, port)`; the first report for an
//! address wins and later ones are ignored. Discovery never fails: a channel
//! that cannot start is logged and contributes nothing.

pub mod mdns;
pub mod udp;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, UdpSocket as StdUdpSocket};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use mdns::MdnsAdvertiser;
pub use udp::DiscoveryResponder;

use crate::config::DiscoveryConfig;

/// Which channel reported a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerSource {
    Mdns,
    UdpBroadcast,
}

/// A discovered aggregator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerCandidate {
    pub name: String,
    pub host: IpAddr,
    pub port: u16,
    pub source: PeerSource,
    pub version: Option<String>,
}

impl PeerCandidate {
    pub fn key(&self) -> (IpAddr, u16) {
        (self.host, self.port)
    }

    /// WebSocket URL of the candidate's ingestion endpoint
    pub fn url(&self) -> String {
        match self.host {
            IpAddr::V6(v6) => format!("ws://[{}]:{}", v6, self.port),
            IpAddr::V4(v4) => format!("ws://{}:{}", v4, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found(PeerCandidate),
    Lost(PeerCandidate),
}

/// What a channel tells the merger
#[derive(Debug)]
pub(crate) enum Report {
    /// `instance` is the mDNS fullname, `None` for UDP
    Resolved { instance: Option<String>, candidate: PeerCandidate },
    Removed { instance: String },
}

/// Candidates merged by address, in first-seen order
#[derive(Debug, Default)]
pub struct CandidateSet {
    order: Vec<(IpAddr, u16)>,
    by_key: HashMap<(IpAddr, u16), PeerCandidate>,
    instances: HashMap<String, (IpAddr, u16)>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate unless its address is already known
    ///
    /// # Returns
    ///
    /// `true` if the candidate was new
    pub fn insert(&mut self, candidate: PeerCandidate) -> bool {
        self.insert_from(None, candidate)
    }

    fn insert_from(&mut self, instance: Option<String>, candidate: PeerCandidate) -> bool {
        let key = candidate.key();
        if self.by_key.contains_key(&key) {
            return false;
        }
        if let Some(instance) = instance {
            self.instances.insert(instance, key);
        }
        self.order.push(key);
        self.by_key.insert(key, candidate);
        true
    }

    /// Forget the candidate an mDNS instance contributed, if it won the merge
    pub fn remove_instance(&mut self, instance: &str) -> Option<PeerCandidate> {
        let key = self.instances.remove(instance)?;
        self.order.retain(|k| *k != key);
        self.by_key.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn into_vec(mut self) -> Vec<PeerCandidate> {
        self.order.iter().filter_map(|key| self.by_key.remove(key)).collect()
    }

    /// Apply a channel report, returning the event it produced
    pub(crate) fn apply(&mut self, report: Report) -> Option<DiscoveryEvent> {
        match report {
            Report::Resolved { instance, candidate } => {
                if self.insert_from(instance, candidate.clone()) {
                    Some(DiscoveryEvent::Found(candidate))
                } else {
                    debug!("Ignoring duplicate report for {}:{}", candidate.host, candidate.port);
                    None
                }
            }
            Report::Removed { instance } => self.remove_instance(&instance).map(DiscoveryEvent::Lost),
        }
    }
}

/// Prober for aggregators
#[derive(Debug, Clone)]
pub struct Discovery {
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Probe both channels and return the merged candidates
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_bridge::config::DiscoveryConfig;
    /// use telemetry_bridge::discovery::Discovery;
    ///
    /// # async fn run() {
    /// let discovery = Discovery::new(DiscoveryConfig::default());
    /// for peer in discovery.probe(discovery.config().timeout()).await {
    ///     println!("{} at {}", peer.name, peer.url());
    /// }
    /// # }
    /// ```
    pub async fn probe(&self, timeout: Duration) -> Vec<PeerCandidate> {
        let (mut events, handle) = self.probe_stream(timeout);
        while events.recv().await.is_some() {}
        handle.await.unwrap_or_else(|e| {
            warn!("Discovery task failed: {}", e);
            Vec::new()
        })
    }

    /// Probe both channels, streaming events as they arrive
    ///
    /// # Returns
    ///
    /// An event receiver and a handle resolving to the final merged set once
    /// the deadline has passed. Dropping the receiver does not stop the probe.
    pub fn probe_stream(&self, timeout: Duration) -> (mpsc::Receiver<DiscoveryEvent>, JoinHandle<Vec<PeerCandidate>>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (report_tx, mut report_rx) = mpsc::channel::<Report>(64);

        if self.config.mdns_enabled {
            let config = self.config.clone();
            let tx = report_tx.clone();
            tokio::spawn(async move { mdns::browse(&config, timeout, tx).await });
        }
        if self.config.udp_enabled {
            let config = self.config.clone();
            let tx = report_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = udp::probe(&config, timeout, tx).await {
                    warn!("UDP discovery unavailable: {}", e);
                }
            });
        }
        drop(report_tx);

        let handle = tokio::spawn(async move {
            let mut set = CandidateSet::new();
            while let Some(report) = report_rx.recv().await {
                if let Some(event) = set.apply(report) {
                    let _ = events_tx.send(event).await;
                }
            }
            info!("Discovery finished with {} candidate(s)", set.len());
            set.into_vec()
        });

        (events_rx, handle)
    }

    /// Probe every `interval` and publish each result set
    pub fn spawn_periodic_sweep(&self, interval: Duration) -> PeriodicSweep {
        let (tx, _) = broadcast::channel(16);
        let discovery = self.clone();
        let publisher = tx.clone();
        let probe_timeout = self.config.timeout().min(interval);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let peers = discovery.probe(probe_timeout).await;
                debug!("Sweep found {} candidate(s)", peers.len());
                let _ = publisher.send(peers);
            }
        });

        PeriodicSweep { tx, handle }
    }
}

/// Running periodic sweep
#[derive(Debug)]
pub struct PeriodicSweep {
    tx: broadcast::Sender<Vec<PeerCandidate>>,
    handle: JoinHandle<()>,
}

impl PeriodicSweep {
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<PeerCandidate>> {
        self.tx.subscribe()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for PeriodicSweep {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Best guess at this host's LAN address
///
/// Uses the address the OS would route outbound traffic from; no packet is
/// sent. Falls back to loopback.
pub fn local_ip() -> IpAddr {
    let routed = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified());

    routed.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
