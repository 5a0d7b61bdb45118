//! Transport seam and connection lifecycle.
//!
//! The core never talks to a concrete network stack. A [`Transport`] opens a
//! [`Session`] bound to a local identity; the session dials and accepts
//! [`DataLink`]s, which are ordered, reliable message channels with an
//! observable outbound queue. Signaling and NAT traversal live behind these
//! traits.

pub mod gate;
pub mod manager;
pub mod memory;
pub mod webrtc;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};

pub use gate::BackpressureGate;
pub use manager::{ConnectionEvent, ConnectionManager, LinkState};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("id '{0}' is already taken")]
    UnavailableId(String),
    #[error("id '{0}' is invalid")]
    InvalidId(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("peer '{0}' is unavailable")]
    PeerUnavailable(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("link is not open")]
    NotOpen,
    #[error("{0}")]
    Send(String),
}

/// Asynchronous notifications from an open session.
pub enum SessionEvent {
    /// A remote peer dialed us.
    IncomingLink(Arc<dyn DataLink>),
    /// Lost contact with the signaling layer; existing links may survive.
    Disconnected,
    /// The session is gone for good.
    Closed,
    Error(SessionError),
}

/// Lifecycle notifications for one link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Open,
    Message(Bytes),
    Close,
    Error(String),
    /// The underlying connection state degraded (ICE failed, disconnected or closed).
    Degraded,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session bound to `self_id`. Resolves once the session is usable.
    async fn open(
        &self,
        self_id: &str,
    ) -> Result<(Arc<dyn Session>, mpsc::UnboundedReceiver<SessionEvent>), SessionError>;
}

#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> &str;

    /// True while the session has lost its signaling connection.
    fn is_disconnected(&self) -> bool;

    async fn reconnect(&self) -> Result<(), SessionError>;

    /// Start an outbound link. The returned link is CONNECTING until it emits [`LinkEvent::Open`].
    async fn dial(&self, remote_id: &str) -> Result<Arc<dyn DataLink>, SessionError>;

    async fn destroy(&self);
}

#[async_trait]
pub trait DataLink: Send + Sync {
    fn peer_id(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send(&self, frame: Bytes) -> Result<(), LinkError>;

    /// Bytes queued for sending but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    async fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Notified (via `notify_waiters`) whenever the queue drains below the low threshold.
    fn drain_signal(&self) -> Arc<Notify>;

    /// Hand over the event stream. Only the first caller gets it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>>;

    async fn close(&self);
}
