//! # Pairing Module
//!
//! Turns an unknown peer into a trusted one with a short-lived code.
//!
//! This module handles:
//! - Issuing a [`PairingTicket`] with a 6-digit code (one outstanding at a time)
//! - Expiring the ticket after the pairing timeout
//! - Matching a presented code and persisting the requester as a [`TrustedPeer`]
//! - Rendering the ticket as a terminal QR code
//! - The `pairing_request`/`pairing_response` WebSocket exchange
//!
//! Codes are single-use: a successful match consumes the ticket.

pub mod endpoint;
pub mod qr;
pub mod trust_store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

pub use endpoint::{complete_pairing, request_pairing, serve_pairing};
pub use qr::render_qr;
pub use trust_store::{TrustStore, TrustedPeer};

use crate::config::PairingConfig;
use crate::error::{PairingError, Result};
use crate::protocol::{now_millis, PROTOCOL_VERSION};

/// Number of decimal digits in a pairing code
pub const CODE_DIGITS: usize = 6;

/// Everything a peer needs to reach and pair with this device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingTicket {
    pub device_id: String,
    pub device_name: String,
    pub device_model: String,
    pub ip_address: String,
    pub transport_port: u16,
    pub pairing_code: String,
    pub issued_at: i64,
    pub app_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    WaitingForPeer,
    Paired { peer_id: String },
    Expired,
}

/// Outcome of [`PairingManager::accept_request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingResult {
    pub success: bool,
    pub reason: Option<PairingError>,
    /// Connection metadata of this device, present on success
    pub ticket: Option<PairingTicket>,
}

impl PairingResult {
    fn failed(reason: PairingError) -> Self {
        Self { success: false, reason: Some(reason), ticket: None }
    }

    /// Human readable outcome for the wire response
    pub fn message(&self) -> String {
        match &self.reason {
            Some(reason) => reason.to_string(),
            None => "paired".to_string(),
        }
    }
}

struct Outstanding {
    issue_id: u64,
    ticket: PairingTicket,
    issued: Instant,
    timeout_task: JoinHandle<()>,
}

struct Shared {
    outstanding: Mutex<Option<Outstanding>>,
    state: watch::Sender<PairingState>,
}

impl Shared {
    fn outstanding(&self) -> MutexGuard<'_, Option<Outstanding>> {
        self.outstanding.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Issues tickets and checks presented codes. Cheap to clone.
#[derive(Clone)]
pub struct PairingManager {
    device_name: String,
    device_model: String,
    ip_address: String,
    transport_port: u16,
    timeout: Duration,
    trust: Arc<TrustStore>,
    shared: Arc<Shared>,
    next_issue: Arc<AtomicU64>,
}

impl std::fmt::Debug for PairingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingManager")
            .field("device_name", &self.device_name)
            .field("transport_port", &self.transport_port)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PairingManager {
    /// Create a manager
    ///
    /// # Arguments
    ///
    /// * `config` - Pairing section of the configuration
    /// * `trust` - Store that receives peers on a successful match
    /// * `ip_address` - Address advertised in tickets
    pub fn new(config: &PairingConfig, trust: Arc<TrustStore>, ip_address: String) -> Self {
        let (state, _) = watch::channel(PairingState::Idle);
        Self {
            device_name: config.device_name.clone(),
            device_model: config.device_model.clone(),
            ip_address,
            transport_port: config.port,
            timeout: config.timeout(),
            trust,
            shared: Arc::new(Shared { outstanding: Mutex::new(None), state }),
            next_issue: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to pairing state changes
    pub fn state(&self) -> watch::Receiver<PairingState> {
        self.shared.state.subscribe()
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// The ticket currently waiting for a peer, if any
    pub fn outstanding_ticket(&self) -> Option<PairingTicket> {
        self.shared.outstanding().as_ref().map(|o| o.ticket.clone())
    }

    /// Issue a fresh ticket, replacing any outstanding one
    ///
    /// Must be called from within a Tokio runtime; the expiry timer is a
    /// spawned task.
    ///
    /// # Errors
    ///
    /// Returns error if the device id cannot be persisted
    pub fn generate_ticket(&self) -> Result<PairingTicket> {
        let ticket = PairingTicket {
            device_id: self.trust.device_id()?,
            device_name: self.device_name.clone(),
            device_model: self.device_model.clone(),
            ip_address: self.ip_address.clone(),
            transport_port: self.transport_port,
            pairing_code: generate_code(),
            issued_at: now_millis(),
            app_version: PROTOCOL_VERSION.to_string(),
        };

        let issue_id = self.next_issue.fetch_add(1, Ordering::SeqCst) + 1;
        let timeout_task = tokio::spawn(expire_after(self.shared.clone(), issue_id, self.timeout));

        let previous = self.shared.outstanding().replace(Outstanding {
            issue_id,
            ticket: ticket.clone(),
            issued: Instant::now(),
            timeout_task,
        });
        if let Some(previous) = previous {
            previous.timeout_task.abort();
            info!("Replaced outstanding pairing ticket");
        }

        self.shared.state.send_replace(PairingState::WaitingForPeer);
        info!("Issued pairing ticket, valid for {:?}", self.timeout);
        Ok(ticket)
    }

    /// Drop the outstanding ticket without pairing
    pub fn cancel(&self) {
        if let Some(outstanding) = self.shared.outstanding().take() {
            outstanding.timeout_task.abort();
            self.shared.state.send_replace(PairingState::Idle);
        }
    }

    /// Check a presented code against the outstanding ticket
    ///
    /// On a match the requester is persisted as trusted and the ticket is
    /// consumed. A mismatch leaves the ticket in place.
    pub fn accept_request(&self, code: &str, requester_id: &str, requester_name: &str) -> PairingResult {
        let mut guard = self.shared.outstanding();

        let outstanding = match guard.as_ref() {
            Some(outstanding) => outstanding,
            None => {
                let reason = if *self.shared.state.borrow() == PairingState::Expired {
                    PairingError::Expired
                } else {
                    PairingError::NoTicket
                };
                return PairingResult::failed(reason);
            }
        };

        // The timer may not have fired yet
        if outstanding.issued.elapsed() >= self.timeout {
            if let Some(expired) = guard.take() {
                expired.timeout_task.abort();
            }
            self.shared.state.send_replace(PairingState::Expired);
            return PairingResult::failed(PairingError::Expired);
        }

        if requester_id.is_empty() {
            return PairingResult::failed(PairingError::Malformed("empty requester id".to_string()));
        }

        if !codes_match(&outstanding.ticket.pairing_code, code) {
            warn!("Pairing attempt from {} with wrong code", requester_id);
            return PairingResult::failed(PairingError::CodeMismatch);
        }

        let peer = TrustedPeer {
            peer_id: requester_id.to_string(),
            peer_name: requester_name.to_string(),
            paired_at: now_millis(),
        };
        if let Err(e) = self.trust.trust(peer) {
            warn!("Failed to persist trusted peer {}: {}", requester_id, e);
            return PairingResult::failed(PairingError::Rejected(e.to_string()));
        }

        let Some(consumed) = guard.take() else {
            return PairingResult::failed(PairingError::NoTicket);
        };
        consumed.timeout_task.abort();

        self.shared.state.send_replace(PairingState::Paired { peer_id: requester_id.to_string() });
        info!("Paired with {} ({})", requester_name, requester_id);

        PairingResult { success: true, reason: None, ticket: Some(consumed.ticket) }
    }
}

async fn expire_after(shared: Arc<Shared>, issue_id: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    let expired = {
        let mut guard = shared.outstanding();
        if guard.as_ref().map(|o| o.issue_id) == Some(issue_id) {
            guard.take();
            true
        } else {
            false
        }
    };

    if expired {
        shared.state.send_replace(PairingState::Expired);
        info!("Pairing ticket expired");
    }
}

/// Uniformly random 6-digit code, zero padded
fn generate_code() -> String {
    let n: u32 = OsRng.gen_range(0..1_000_000);
    format!("{:0width$}", n, width = CODE_DIGITS)
}

/// Compare without an early exit on the first differing digit
fn codes_match(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
