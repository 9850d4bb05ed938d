//! UDP broadcast discovery: prober and responder

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::{PeerCandidate, PeerSource, Report};
use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::protocol::{udp as wire, ServerAnnouncement};

const MAX_DATAGRAM: usize = 1024;

/// Broadcast the probe string and report every valid reply until the deadline
pub(crate) async fn probe(config: &DiscoveryConfig, timeout: Duration, reports: mpsc::Sender<Report>) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;

    let probe = wire::probe_message(&config.app_tag);
    for address in &config.broadcast_addresses {
        let Ok(ip) = address.parse::<IpAddr>() else {
            warn!("Skipping invalid broadcast address '{}'", address);
            continue;
        };
        if let Err(e) = socket.send_to(probe.as_bytes(), (ip, config.udp_port)).await {
            warn!("Discovery probe to {}:{} failed: {}", ip, config.udp_port, e);
        }
    }

    let mut buf = [0u8; MAX_DATAGRAM];
    while let Ok(received) = timeout_at(deadline, socket.recv_from(&mut buf)).await {
        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                debug!("Discovery receive error: {}", e);
                continue;
            }
        };

        let text = String::from_utf8_lossy(&buf[..len]);
        let Some(announcement) = wire::parse_response(&config.app_tag, &text) else {
            debug!("Ignoring non-discovery datagram from {}", from);
            continue;
        };

        let candidate = PeerCandidate {
            name: announcement.name,
            host: from.ip(),
            port: announcement.port,
            source: PeerSource::UdpBroadcast,
            version: announcement.version,
        };
        if reports.send(Report::Resolved { instance: None, candidate }).await.is_err() {
            break;
        }
    }

    Ok(())
}

/// Answers discovery probes on behalf of an aggregator
#[derive(Debug)]
pub struct DiscoveryResponder {
    socket: UdpSocket,
    app_tag: String,
    reply: String,
}

impl DiscoveryResponder {
    /// Bind the responder socket
    ///
    /// # Arguments
    ///
    /// * `addr` - Usually `0.0.0.0:<udp_port>`
    /// * `app_tag` - Prefix of the probe and reply strings
    /// * `announcement` - Port, name and version sent back to probers
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be bound
    pub async fn bind(addr: SocketAddr, app_tag: &str, announcement: ServerAnnouncement) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let reply = wire::format_response(app_tag, &announcement);
        info!("Discovery responder listening on {}", socket.local_addr()?);
        Ok(Self { socket, app_tag: app_tag.to_string(), reply })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Answer probes until the task is dropped
    pub async fn run(self) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!("Responder receive error: {}", e);
                    continue;
                }
            };

            let text = String::from_utf8_lossy(&buf[..len]);
            if !wire::is_probe(&self.app_tag, &text) {
                continue;
            }

            debug!("Answering discovery probe from {}", from);
            if let Err(e) = self.socket.send_to(self.reply.as_bytes(), from).await {
                warn!("Failed to answer probe from {}: {}", from, e);
            }
        }
    }
}
