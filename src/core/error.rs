//! Error taxonomy of the transfer core.
//!
//! Every fallible core operation returns [`CoreError`]. Observers receive the
//! coarser [`ErrorKind`] together with a human-readable detail string.

use serde::Serialize;
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("identity '{id}' is unavailable or invalid")]
    IdentityConflict { id: String },

    #[error("transient session error: {0}")]
    TransientSession(String),

    #[error("peer '{peer_id}' is unavailable")]
    PeerUnavailable { peer_id: String },

    #[error("send to '{peer_id}' failed: {reason}")]
    ChannelSend { peer_id: String, reason: String },

    #[error("link to '{peer_id}' is closed")]
    LinkClosed { peer_id: String },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("chunk producer failed: {0}")]
    Producer(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("connection manager is not initialized")]
    NotInitialized,

    #[error("peer limit reached ({max} links)")]
    PeerLimit { max: usize },

    #[error("invalid peer id '{0}'")]
    InvalidPeerId(String),

    #[error("cannot connect to self")]
    SelfConnect,

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

/// Coarse error classes published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    IdentityConflict,
    TransientSession,
    PeerUnavailable,
    ChannelSendFailure,
    MalformedSequence,
    MalformedFrame,
    Storage,
    Other,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::IdentityConflict { .. } => ErrorKind::IdentityConflict,
            CoreError::TransientSession(_) => ErrorKind::TransientSession,
            CoreError::PeerUnavailable { .. } => ErrorKind::PeerUnavailable,
            CoreError::ChannelSend { .. } | CoreError::LinkClosed { .. } => {
                ErrorKind::ChannelSendFailure
            }
            CoreError::MalformedFrame(_) => ErrorKind::MalformedFrame,
            CoreError::Storage(_) => ErrorKind::Storage,
            CoreError::Producer(_)
            | CoreError::NotInitialized
            | CoreError::PeerLimit { .. }
            | CoreError::InvalidPeerId(_)
            | CoreError::SelfConnect
            | CoreError::InvalidSettings(_) => ErrorKind::Other,
        }
    }

    /// Whether the error invalidates the local identity.
    pub fn is_identity_conflict(&self) -> bool {
        matches!(self, CoreError::IdentityConflict { .. })
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(e: anyhow::Error) -> Self {
        CoreError::Storage(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_failures_share_a_kind() {
        let closed = CoreError::LinkClosed { peer_id: "ABCDEF".into() };
        let failed = CoreError::ChannelSend {
            peer_id: "ABCDEF".into(),
            reason: "queue full".into(),
        };
        assert_eq!(closed.kind(), ErrorKind::ChannelSendFailure);
        assert_eq!(failed.kind(), ErrorKind::ChannelSendFailure);
    }

    #[test]
    fn identity_conflict_is_flagged() {
        let err = CoreError::IdentityConflict { id: "ABCDEF".into() };
        assert!(err.is_identity_conflict());
        assert_eq!(err.kind(), ErrorKind::IdentityConflict);
        assert!(!CoreError::SelfConnect.is_identity_conflict());
    }

    #[test]
    fn anyhow_errors_become_storage_errors() {
        let err: CoreError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.to_string().contains("disk full"));
    }
}
