//! Centralized configuration for the transfer core.
//!
//! Tunable constants live here so they can be reviewed in one place.
//! Wire-format constants (frame type bytes) stay in `protocol`.
//! [`TransferSettings`] holds the user-adjustable subset, loaded from
//! `settings.toml` in the data directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::error::CoreError;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (64 KiB).
///
/// The backpressure watermarks below are tuned against this unit: the gap
/// between them holds eight default chunks.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Smallest chunk size accepted from settings.
pub const MIN_CHUNK_SIZE: usize = 1024;

/// Largest chunk size accepted from settings. Matches the SCTP max message
/// size the WebRTC adapter negotiates.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Minimum spacing between progress events for one transfer.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

// ── Backpressure ─────────────────────────────────────────────────────────────

/// Outbound queue depth at which the sender pauses.
pub const BUFFER_HIGH_WATERMARK: usize = 1024 * 1024;

/// Queue depth the transport must drain below before a paused sender resumes.
pub const BUFFER_LOW_WATERMARK: usize = 512 * 1024;

// ── Session / Identity ───────────────────────────────────────────────────────

/// Poll interval while the session layer stays disconnected.
pub const RECONNECT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Delay before re-opening a session the transport closed underneath us.
pub const SESSION_RESTART_DELAY: Duration = Duration::from_secs(3);

/// Retries of the same identity after a collision before minting a new one.
pub const IDENTITY_RETRY_LIMIT: u32 = 2;

/// Pause between identity retries.
pub const IDENTITY_RETRY_DELAY: Duration = Duration::from_millis(1500);

/// Fresh identities tried after the preferred one is exhausted.
pub const IDENTITY_REGENERATE_LIMIT: u32 = 3;

/// Length of a peer id.
pub const PEER_ID_LENGTH: usize = 6;

/// Characters a peer id is drawn from (no `O`/`0` to avoid confusion).
pub const PEER_ID_ALPHABET: &str = "ABCDEFGHIJKLMNPQRSTUVWXYZ123456789";

// ── WebRTC ───────────────────────────────────────────────────────────────────

/// Label of the data channel carrying the protocol.
pub const DATA_CHANNEL_LABEL: &str = "nwshare";

/// Largest SCTP message either side may send: one maximal chunk frame.
pub const SCTP_MAX_MESSAGE_SIZE: u32 = (MAX_CHUNK_SIZE + 1024) as u32;

/// Offer loopback host candidates (needed for same-machine links).
pub const SCTP_USE_LOOPBACK: bool = true;

/// Upper bound on ICE candidate gathering.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on one offer/answer exchange through the signaler.
pub const SIGNALING_TIMEOUT: Duration = Duration::from_secs(30);

// ── Peers ────────────────────────────────────────────────────────────────────

/// Default cap on concurrently open peer links.
pub const DEFAULT_MAX_PEERS: usize = 5;

/// Time a BYE gets to leave the queue before the link is closed.
pub const BYE_GRACE_PERIOD: Duration = Duration::from_millis(100);

// ── Storage ──────────────────────────────────────────────────────────────────

/// Lifetime of a received file in the local store.
pub const STORED_FILE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Sender name recorded when the peer never sent a HANDSHAKE.
pub const UNKNOWN_PEER_NAME: &str = "Unknown Peer";

// ── Settings ─────────────────────────────────────────────────────────────────

/// User-adjustable settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Bytes per CHUNK message.
    pub chunk_size: usize,
    /// Maximum concurrently open peer links.
    pub max_peers: usize,
    /// Export received files to the download directory on completion.
    pub auto_download: bool,
    /// Name advertised in HANDSHAKE and CHAT messages.
    pub display_name: String,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_peers: DEFAULT_MAX_PEERS,
            auto_download: false,
            display_name: "Anonymous".into(),
        }
    }
}

impl TransferSettings {
    /// Load settings from a TOML file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the core cannot operate with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(CoreError::InvalidSettings(format!(
                "chunk_size {} outside {}..={}",
                self.chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        if self.max_peers == 0 {
            return Err(CoreError::InvalidSettings("max_peers must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermarks_bracket_default_chunks() {
        assert!(BUFFER_LOW_WATERMARK < BUFFER_HIGH_WATERMARK);
        assert_eq!((BUFFER_HIGH_WATERMARK - BUFFER_LOW_WATERMARK) / DEFAULT_CHUNK_SIZE, 8);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let settings: TransferSettings = toml::from_str("chunk_size = 16384").unwrap();
        assert_eq!(settings.chunk_size, 16384);
        assert_eq!(settings.max_peers, DEFAULT_MAX_PEERS);
        settings.validate().unwrap();
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut settings = TransferSettings { chunk_size: 10, ..Default::default() };
        assert!(settings.validate().is_err());
        settings.chunk_size = DEFAULT_CHUNK_SIZE;
        settings.max_peers = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = TransferSettings::load(&dir.path().join("settings.toml")).unwrap();
        assert_eq!(settings, TransferSettings::default());
    }
}
