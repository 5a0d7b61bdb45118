//! Recent peer registry: remembers who we talked to for reconnection.
//!
//! Stores `{id, name, last_seen}` per peer in `<data_dir>/peers.json`.
//! Updated when a peer identifies itself and when it says goodbye.
//! On startup the coordinator dials every remembered peer.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

use crate::utils::atomic_write::atomic_write;
use crate::utils::time::now_millis;

/// Information stored for each recent peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub id: String,
    /// Display name the peer last advertised.
    pub name: String,
    /// Unix milliseconds of the last handshake.
    pub last_seen: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    peers: HashMap<String, PeerRecord>,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    /// `None` keeps the registry in memory only.
    path: Option<PathBuf>,
    peers: HashMap<String, PeerRecord>,
}

impl PeerRegistry {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the registry from `path` (or start empty).
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let peers = if path.exists() {
            Self::read_from_file(&path)
        } else {
            HashMap::new()
        };
        Self {
            path: Some(path),
            peers,
        }
    }

    fn read_from_file(path: &Path) -> HashMap<String, PeerRecord> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse_content(&content),
            Err(e) => {
                warn!(
                    event = "peer_registry_read_failure",
                    error = %e,
                    "Failed to read peer registry"
                );
                HashMap::new()
            }
        }
    }

    fn parse_content(content: &str) -> HashMap<String, PeerRecord> {
        match serde_json::from_str::<RegistryFile>(content) {
            Ok(file) => {
                debug!(
                    event = "peer_registry_loaded",
                    peers = file.peers.len(),
                    "Peer registry loaded"
                );
                file.peers
            }
            Err(e) => {
                error!(
                    event = "peer_registry_parse_failure",
                    error = %e,
                    "Failed to parse peer registry, starting fresh"
                );
                HashMap::new()
            }
        }
    }

    /// Persist the registry to disk.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = RegistryFile {
            peers: self.peers.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        atomic_write(path, content.as_bytes())
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!(event = "peer_registry_save_failure", error = %e, "Failed to save peer registry");
        }
    }

    /// Record a handshake from `id`.
    pub fn peer_seen(&mut self, id: &str, name: &str) {
        let record = PeerRecord {
            id: id.to_string(),
            name: name.to_string(),
            last_seen: now_millis(),
        };
        self.peers.insert(id.to_string(), record);
        self.persist();
    }

    /// Forget `id` (it left on purpose). Returns whether it was known.
    pub fn remove(&mut self, id: &str) -> bool {
        let removed = self.peers.remove(id).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    /// Peers worth dialing again, most recently seen first.
    pub fn reconnect_candidates(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));
        peers
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.persist();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        {
            let mut reg = PeerRegistry::load(&path);
            reg.peer_seen("ALICE1", "Alice");
            reg.peer_seen("BRUCE2", "Bruce");
            assert!(reg.remove("BRUCE2"));
        }
        let reg = PeerRegistry::load(&path);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("ALICE1").unwrap().name, "Alice");
    }

    #[test]
    fn candidates_are_newest_first() {
        let mut reg = PeerRegistry::in_memory();
        reg.peer_seen("ALICE1", "Alice");
        reg.peer_seen("BRUCE2", "Bruce");
        if let Some(r) = reg.peers.get_mut("ALICE1") {
            r.last_seen = 1;
        }
        let ids: Vec<String> = reg.reconnect_candidates().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["BRUCE2".to_string(), "ALICE1".to_string()]);
    }

    #[test]
    fn garbage_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        std::fs::write(&path, "not json").unwrap();
        let reg = PeerRegistry::load(&path);
        assert!(reg.is_empty());
    }

    #[test]
    fn repeated_handshake_updates_name() {
        let mut reg = PeerRegistry::in_memory();
        reg.peer_seen("ALICE1", "Alice");
        reg.peer_seen("ALICE1", "Alice (laptop)");
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("ALICE1").unwrap().name, "Alice (laptop)");
        assert!(!reg.remove("ZZZZZZ"));
    }
}
