//! mDNS browsing and advertising

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use super::{PeerCandidate, PeerSource, Report};
use crate::config::DiscoveryConfig;
use crate::error::{BridgeError, Result};

/// TXT property carrying the protocol version
pub const TXT_VERSION: &str = "version";

/// TXT property carrying the aggregator's device id
pub const TXT_ID: &str = "id";

/// TXT property carrying the display name
pub const TXT_NAME: &str = "name";

fn mdns_error(context: &str, err: mdns_sd::Error) -> BridgeError {
    BridgeError::Discovery(format!("{}: {}", context, err))
}

/// Browse until the deadline, reporting resolved and removed instances
pub(crate) async fn browse(config: &DiscoveryConfig, timeout: Duration, reports: mpsc::Sender<Report>) {
    let daemon = match ServiceDaemon::new() {
        Ok(daemon) => daemon,
        Err(e) => {
            warn!("mDNS discovery unavailable: {}", e);
            return;
        }
    };
    let receiver = match daemon.browse(&config.service_type) {
        Ok(receiver) => receiver,
        Err(e) => {
            warn!("mDNS browse for {} failed: {}", config.service_type, e);
            let _ = daemon.shutdown();
            return;
        }
    };

    let timer = time::sleep(timeout);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = &mut timer => break,
            event = receiver.recv_async() => {
                let report = match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        debug!(
                            "mDNS resolved {} at {:?}:{}",
                            info.get_fullname(),
                            info.get_addresses(),
                            info.get_port()
                        );
                        candidate_from(&info, &config.service_type).map(|candidate| Report::Resolved {
                            instance: Some(info.get_fullname().to_string()),
                            candidate,
                        })
                    }
                    Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                        debug!("mDNS removed {}", fullname);
                        Some(Report::Removed { instance: fullname })
                    }
                    Ok(_) => None,
                    Err(e) => {
                        warn!("mDNS receive failed: {}", e);
                        break;
                    }
                };

                if let Some(report) = report {
                    if reports.send(report).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    let _ = daemon.stop_browse(&config.service_type);
    let _ = daemon.shutdown();
}

fn candidate_from(info: &ServiceInfo, service_type: &str) -> Option<PeerCandidate> {
    let addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    let host = preferred_addr(&addresses)?;

    let name = info
        .get_property_val_str(TXT_NAME)
        .map(str::to_string)
        .unwrap_or_else(|| instance_name(info.get_fullname(), service_type));

    Some(PeerCandidate {
        name,
        host,
        port: info.get_port(),
        source: PeerSource::Mdns,
        version: info.get_property_val_str(TXT_VERSION).map(str::to_string),
    })
}

/// `Desk PC._telemetrybridge._tcp.local.` -> `Desk PC`
fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

/// Pick the address most likely reachable on the LAN
///
/// Private ranges first, then anything that is not loopback or a
/// VPN/CGNAT range, then any non-loopback address.
pub fn preferred_addr(addrs: &[IpAddr]) -> Option<IpAddr> {
    let is_private_lan = |addr: &IpAddr| match addr {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    };
    let is_tunnel = |addr: &IpAddr| match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            (o[0] == 198 && (o[1] == 18 || o[1] == 19)) || (o[0] == 100 && (64..=127).contains(&o[1]))
        }
        IpAddr::V6(_) => false,
    };

    addrs
        .iter()
        .find(|a| is_private_lan(a))
        .or_else(|| addrs.iter().find(|a| !a.is_loopback() && !is_tunnel(a)))
        .or_else(|| addrs.iter().find(|a| !a.is_loopback()))
        .copied()
}

/// Registers the aggregator's ingestion endpoint over mDNS
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl std::fmt::Debug for MdnsAdvertiser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdnsAdvertiser").field("fullname", &self.fullname).finish_non_exhaustive()
    }
}

impl MdnsAdvertiser {
    /// Register the service
    ///
    /// # Arguments
    ///
    /// * `service_type` - e.g. `_telemetrybridge._tcp.local.`
    /// * `name` - Instance and display name
    /// * `server_id` - Published as the `id` TXT property
    /// * `port` - Ingestion port
    /// * `addresses` - Addresses to publish
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Discovery` if the daemon cannot start or the
    /// registration is rejected
    pub fn register(
        service_type: &str,
        name: &str,
        server_id: &str,
        port: u16,
        addresses: &[IpAddr],
    ) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| mdns_error("failed to start mDNS daemon", e))?;

        let mut props = HashMap::new();
        props.insert(TXT_VERSION.to_string(), crate::protocol::PROTOCOL_VERSION.to_string());
        props.insert(TXT_ID.to_string(), server_id.to_string());
        props.insert(TXT_NAME.to_string(), name.to_string());

        let instance = name.replace('.', "-");
        let host_label = format!("{}.local.", instance.replace(' ', "-").to_lowercase());
        let info = ServiceInfo::new(service_type, &instance, &host_label, addresses, port, props)
            .map_err(|e| mdns_error("invalid mDNS service info", e))?;
        let fullname = info.get_fullname().to_string();

        daemon.register(info).map_err(|e| mdns_error("mDNS register failed", e))?;
        info!("Advertising {} on port {} via mDNS", fullname, port);

        Ok(Self { daemon, fullname })
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    /// Withdraw the registration and stop the daemon
    pub fn shutdown(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!("mDNS unregister failed: {}", e);
        }
        let _ = self.daemon.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_preferred_addr_prefers_private_lan() {
        let addrs = [ip("127.0.0.1"), ip("198.18.0.4"), ip("192.168.1.20")];
        assert_eq!(preferred_addr(&addrs), Some(ip("192.168.1.20")));
    }

    #[test]
    fn test_preferred_addr_skips_tunnels() {
        let addrs = [ip("100.100.1.1"), ip("203.0.113.7")];
        assert_eq!(preferred_addr(&addrs), Some(ip("203.0.113.7")));
    }

    #[test]
    fn test_preferred_addr_falls_back_to_any_non_loopback() {
        assert_eq!(preferred_addr(&[ip("100.100.1.1")]), Some(ip("100.100.1.1")));
        assert_eq!(preferred_addr(&[ip("127.0.0.1")]), None);
        assert_eq!(preferred_addr(&[]), None);
    }

    #[test]
    fn test_instance_name() {
        let service = "_telemetrybridge._tcp.local.";
        assert_eq!(instance_name("Desk PC._telemetrybridge._tcp.local.", service), "Desk PC");
        assert_eq!(instance_name("odd-name", service), "odd-name");
    }
}
