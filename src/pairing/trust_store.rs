//! Trusted peers and the local device identity
//!
//! Backed by one JSON file (`trusted_peers.json`) that is rewritten
//! atomically on every change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::persist;

/// A peer that presented the right pairing code once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedPeer {
    pub peer_id: String,
    pub peer_name: String,
    pub paired_at: i64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustFile {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    peers: BTreeMap<String, TrustedPeer>,
}

#[derive(Debug)]
pub struct TrustStore {
    path: PathBuf,
    state: Mutex<TrustFile>,
}

impl TrustStore {
    /// Load the store at `path`; a missing file is an empty store
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state: TrustFile = persist::read_json(&path)?.unwrap_or_default();
        Ok(Self { path, state: Mutex::new(state) })
    }

    fn state(&self) -> MutexGuard<'_, TrustFile> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_trusted(&self, peer_id: &str) -> bool {
        !peer_id.is_empty() && self.state().peers.contains_key(peer_id)
    }

    /// Apply `change` to a copy of the state, persist the copy, then adopt it.
    /// A failed write leaves the in-memory state untouched.
    fn commit<R>(&self, change: impl FnOnce(&mut TrustFile) -> Option<R>) -> Result<Option<R>> {
        let mut state = self.state();
        let mut next = state.clone();
        let Some(outcome) = change(&mut next) else {
            return Ok(None);
        };
        persist::write_json_atomic(&self.path, &next)?;
        *state = next;
        Ok(Some(outcome))
    }

    /// Add or replace a trusted peer and persist
    pub fn trust(&self, peer: TrustedPeer) -> Result<()> {
        info!("Trusting peer {} ({})", peer.peer_id, peer.peer_name);
        self.commit(|next| {
            next.peers.insert(peer.peer_id.clone(), peer);
            Some(())
        })?;
        Ok(())
    }

    /// Returns `false` if the peer was not trusted
    pub fn remove(&self, peer_id: &str) -> Result<bool> {
        let removed = self.commit(|next| next.peers.remove(peer_id).map(|_| ()))?;
        Ok(removed.is_some())
    }

    /// Forget every peer. The device id is kept.
    pub fn clear(&self) -> Result<()> {
        self.commit(|next| {
            next.peers.clear();
            Some(())
        })?;
        Ok(())
    }

    pub fn list(&self) -> Vec<TrustedPeer> {
        self.state().peers.values().cloned().collect()
    }

    /// Stable id of this installation, created and persisted on first call
    pub fn device_id(&self) -> Result<String> {
        if let Some(id) = self.state().device_id.clone() {
            return Ok(id);
        }

        let created = self.commit(|next| {
            if next.device_id.is_some() {
                return None;
            }
            let id = Uuid::new_v4().to_string();
            next.device_id = Some(id.clone());
            Some(id)
        })?;

        match created {
            Some(id) => {
                info!("Generated device id {}", id);
                Ok(id)
            }
            // another caller created it between the two locks
            None => self.device_id(),
        }
    }
}
