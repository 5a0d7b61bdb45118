//! Connection Manager.
//!
//! Owns the local identity, the transport session and the table of peer
//! links (at most one live link per remote id). Transport notifications are
//! turned into [`ConnectionEvent`]s on an [`EventBus`]; any number of
//! observers can subscribe.
//!
//! Each link carries a generation number. Events from a link that was
//! replaced or discarded no longer match the table entry and are ignored.

use bytes::Bytes;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::{DataLink, LinkEvent, Session, SessionError, SessionEvent, Transport};
use crate::core::config::{RECONNECT_POLL_INTERVAL, SESSION_RESTART_DELAY};
use crate::core::error::{CoreError, CoreResult, ErrorKind};
use crate::core::events::EventBus;
use crate::core::protocol::ProtocolMessage;
use crate::utils::identity::is_valid_peer_id;
use crate::utils::sos::SignalOfStop;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected {
        peer_id: String,
    },
    Disconnected {
        peer_id: String,
    },
    Message {
        peer_id: String,
        message: ProtocolMessage,
    },
    Error {
        peer_id: Option<String>,
        kind: ErrorKind,
        detail: String,
    },
}

struct PeerLink {
    generation: u64,
    link: Arc<dyn DataLink>,
    state: LinkState,
    dialed_by_us: bool,
    closed: SignalOfStop,
}

impl PeerLink {
    fn is_live(&self) -> bool {
        match self.state {
            LinkState::Connecting => true,
            LinkState::Open => self.link.is_open(),
            LinkState::Closed => false,
        }
    }
}

/// An open link plus a signal that fires when the manager drops it.
#[derive(Clone)]
pub struct LinkHandle {
    pub link: Arc<dyn DataLink>,
    pub closed: SignalOfStop,
}

struct ActiveSession {
    id: String,
    session: Arc<dyn Session>,
    stop: SignalOfStop,
}

struct Inner {
    transport: Arc<dyn Transport>,
    max_peers: usize,
    reconnect_poll: Duration,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
    local_id: Mutex<Option<String>>,
    links: Mutex<HashMap<String, PeerLink>>,
    generations: AtomicU64,
    reconnecting: AtomicBool,
    events: EventBus<ConnectionEvent>,
}

/// Cloneable handle; clones share the same link table.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn classify_open_error(id: &str, err: SessionError) -> CoreError {
    match err {
        SessionError::UnavailableId(_) | SessionError::InvalidId(_) => {
            CoreError::IdentityConflict { id: id.to_string() }
        }
        other => CoreError::TransientSession(other.to_string()),
    }
}

/// Decide whether a newly arrived link replaces the tracked one.
///
/// When both peers dial each other at once, the link dialed by the
/// lexicographically smaller id survives on both sides. A repeated dial
/// from the remote replaces its older link; a repeated local dial does not.
fn prefer_new(local: &str, remote: &str, existing_ours: bool, new_ours: bool) -> bool {
    if existing_ours == new_ours {
        return !new_ours;
    }
    let our_dial_wins = local < remote;
    new_ours == our_dial_wins
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, max_peers: usize) -> Self {
        Self::with_reconnect_poll(transport, max_peers, RECONNECT_POLL_INTERVAL)
    }

    /// Like [`new`](Self::new) with a custom interval between session
    /// reconnect attempts.
    pub fn with_reconnect_poll(
        transport: Arc<dyn Transport>,
        max_peers: usize,
        reconnect_poll: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                max_peers,
                reconnect_poll,
                session: tokio::sync::Mutex::new(None),
                local_id: Mutex::new(None),
                links: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                events: EventBus::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Identity of the open session, if any.
    pub fn self_id(&self) -> Option<String> {
        lock(&self.inner.local_id).clone()
    }

    pub fn max_peers(&self) -> usize {
        self.inner.max_peers
    }

    fn publish(&self, event: ConnectionEvent) {
        self.inner.events.publish(event);
    }

    fn publish_error(&self, peer_id: Option<&str>, kind: ErrorKind, detail: impl Into<String>) {
        self.publish(ConnectionEvent::Error {
            peer_id: peer_id.map(str::to_string),
            kind,
            detail: detail.into(),
        });
    }

    // ── Session lifecycle ────────────────────────────────────────────────────

    /// Open the session under `self_id`. A no-op when already open under the
    /// same id; a session under another id is torn down first.
    pub async fn initialize(&self, self_id: &str) -> CoreResult<()> {
        let mut slot = self.inner.session.lock().await;
        if let Some(active) = slot.as_ref()
            && active.id == self_id
        {
            debug!(event = "session_already_open", id = self_id, "Session already open");
            return Ok(());
        }
        self.open_locked(&mut slot, self_id).await
    }

    /// Re-open the session after the transport closed it, unless the session
    /// owning `stop` has since been replaced or torn down.
    async fn restart_session(&self, self_id: &str, stop: &SignalOfStop) -> CoreResult<()> {
        let mut slot = self.inner.session.lock().await;
        let current = slot.as_ref().is_some_and(|a| a.stop.same_as(stop));
        if !current || stop.cancelled() {
            debug!(event = "session_restart_skipped", id = self_id, "Session was replaced");
            return Ok(());
        }
        self.open_locked(&mut slot, self_id).await
    }

    async fn open_locked(&self, slot: &mut Option<ActiveSession>, self_id: &str) -> CoreResult<()> {
        if let Some(old) = slot.take() {
            self.teardown(old).await;
        }

        let (session, events) = self
            .inner
            .transport
            .open(self_id)
            .await
            .map_err(|e| {
                warn!(event = "session_open_failure", id = self_id, error = %e, "Session open failed");
                classify_open_error(self_id, e)
            })?;

        let stop = SignalOfStop::new();
        *lock(&self.inner.local_id) = Some(self_id.to_string());
        tokio::spawn(session_loop(
            Arc::downgrade(&self.inner),
            session.clone(),
            events,
            stop.clone(),
        ));
        *slot = Some(ActiveSession {
            id: self_id.to_string(),
            session,
            stop,
        });
        info!(event = "session_open", id = self_id, "Session open");
        Ok(())
    }

    async fn teardown(&self, old: ActiveSession) {
        old.stop.cancel();
        self.close_all_links().await;
        old.session.destroy().await;
        *lock(&self.inner.local_id) = None;
        info!(event = "session_closed", id = %old.id, "Session torn down");
    }

    /// Close every link and the session. Safe to call repeatedly.
    pub async fn close(&self) {
        let old = self.inner.session.lock().await.take();
        match old {
            Some(old) => self.teardown(old).await,
            None => self.close_all_links().await,
        }
    }

    async fn close_all_links(&self) {
        let drained: Vec<(String, PeerLink)> = lock(&self.inner.links).drain().collect();
        for (peer_id, entry) in drained {
            entry.closed.cancel();
            entry.link.close().await;
            if entry.state == LinkState::Open {
                self.publish(ConnectionEvent::Disconnected { peer_id });
            }
        }
    }

    async fn on_session_event(
        &self,
        event: SessionEvent,
        session: &Arc<dyn Session>,
        stop: &SignalOfStop,
    ) -> ControlFlow<()> {
        match event {
            SessionEvent::IncomingLink(link) => {
                info!(event = "link_incoming", peer = link.peer_id(), "Incoming link");
                self.adopt(link, false);
            }
            SessionEvent::Disconnected => {
                warn!(event = "session_disconnected", id = session.id(), "Signaling lost, reconnecting");
                self.recover(session.clone(), stop.clone());
            }
            SessionEvent::Closed => {
                if stop.cancelled() {
                    return ControlFlow::Break(());
                }
                warn!(
                    event = "session_lost",
                    id = session.id(),
                    delay_ms = SESSION_RESTART_DELAY.as_millis() as u64,
                    "Session closed by transport, scheduling restart"
                );
                self.schedule_restart(session.id().to_string(), stop.clone());
                return ControlFlow::Break(());
            }
            SessionEvent::Error(err) => self.on_session_error(err, session, stop).await,
        }
        ControlFlow::Continue(())
    }

    async fn on_session_error(&self, err: SessionError, session: &Arc<dyn Session>, stop: &SignalOfStop) {
        match err {
            SessionError::UnavailableId(_) | SessionError::InvalidId(_) => {
                error!(event = "identity_conflict", id = session.id(), error = %err, "Identity rejected");
                self.publish_error(None, ErrorKind::IdentityConflict, err.to_string());
            }
            SessionError::PeerUnavailable(peer_id) => {
                warn!(event = "peer_unavailable", peer = %peer_id, "Peer unavailable");
                let pending = {
                    let mut links = lock(&self.inner.links);
                    let connecting = links
                        .get(&peer_id)
                        .is_some_and(|e| e.state == LinkState::Connecting);
                    if connecting { links.remove(&peer_id) } else { None }
                };
                if let Some(entry) = pending {
                    entry.closed.cancel();
                    entry.link.close().await;
                }
                self.publish_error(
                    Some(&peer_id),
                    ErrorKind::PeerUnavailable,
                    format!("peer '{peer_id}' is unavailable"),
                );
            }
            SessionError::Network(_) | SessionError::Other(_) => {
                warn!(event = "session_error", id = session.id(), error = %err, "Transient session error");
                self.recover(session.clone(), stop.clone());
            }
        }
    }

    /// Reconnect the session, then keep polling while it stays disconnected.
    fn recover(&self, session: Arc<dyn Session>, stop: SignalOfStop) {
        if self.inner.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.reconnect_poll;
        tokio::spawn(async move {
            if let Err(e) = session.reconnect().await {
                warn!(event = "session_reconnect_failure", error = %e, "Reconnect failed");
            }
            while session.is_disconnected() {
                tokio::select! {
                    _ = stop.wait() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !session.is_disconnected() {
                    break;
                }
                info!(event = "session_reconnect_attempt", id = session.id(), "Retrying session reconnect");
                if let Err(e) = session.reconnect().await {
                    warn!(event = "session_reconnect_failure", error = %e, "Reconnect failed");
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.reconnecting.store(false, Ordering::Release);
            }
            debug!(event = "session_reconnect_done", id = session.id(), "Reconnect poll finished");
        });
    }

    fn schedule_restart(&self, id: String, stop: SignalOfStop) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.wait() => return,
                _ = tokio::time::sleep(SESSION_RESTART_DELAY) => {}
            }
            let Some(inner) = weak.upgrade() else { return };
            let manager = ConnectionManager { inner };
            info!(event = "session_restart", id = %id, "Restarting session");
            if let Err(e) = manager.restart_session(&id, &stop).await {
                error!(event = "session_restart_failure", id = %id, error = %e, "Session restart failed");
                manager.publish_error(None, e.kind(), e.to_string());
            }
        });
    }

    // ── Links ────────────────────────────────────────────────────────────────

    /// Dial `remote_id`. A no-op while a live link exists; a stale entry is
    /// discarded before dialing again.
    pub async fn connect(&self, remote_id: &str) -> CoreResult<()> {
        if !is_valid_peer_id(remote_id) {
            return Err(CoreError::InvalidPeerId(remote_id.to_string()));
        }
        let (session, local_id) = {
            let slot = self.inner.session.lock().await;
            match slot.as_ref() {
                Some(active) => (active.session.clone(), active.id.clone()),
                None => return Err(CoreError::NotInitialized),
            }
        };
        if remote_id == local_id {
            return Err(CoreError::SelfConnect);
        }

        let stale = {
            let mut links = lock(&self.inner.links);
            let stale = match links.get(remote_id).map(PeerLink::is_live) {
                Some(true) => {
                    debug!(event = "connect_noop", peer = remote_id, "Link already live");
                    return Ok(());
                }
                Some(false) => links.remove(remote_id),
                None => None,
            };
            let live = links.values().filter(|l| l.is_live()).count();
            if live >= self.inner.max_peers {
                return Err(CoreError::PeerLimit {
                    max: self.inner.max_peers,
                });
            }
            stale
        };
        if let Some(old) = stale {
            debug!(event = "stale_link_discarded", peer = remote_id, "Discarding stale link");
            self.retire(remote_id, old);
        }

        info!(event = "link_dial", peer = remote_id, "Dialing peer");
        let link = session.dial(remote_id).await.map_err(|e| match e {
            SessionError::PeerUnavailable(peer_id) => {
                warn!(event = "peer_unavailable", peer = %peer_id, "Peer unavailable");
                self.publish_error(
                    Some(&peer_id),
                    ErrorKind::PeerUnavailable,
                    format!("peer '{peer_id}' is unavailable"),
                );
                CoreError::PeerUnavailable { peer_id }
            }
            other => CoreError::TransientSession(other.to_string()),
        })?;
        self.adopt(link, true);
        Ok(())
    }

    /// Start tracking `link`. Returns false when the link was discarded.
    fn adopt(&self, link: Arc<dyn DataLink>, dialed_by_us: bool) -> bool {
        let peer_id = link.peer_id().to_string();
        let Some(events) = link.take_events() else {
            warn!(event = "link_events_unavailable", peer = %peer_id, "Link events already taken");
            return false;
        };
        let local_id = self.self_id().unwrap_or_default();
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);

        let displaced = {
            let mut links = lock(&self.inner.links);
            let existing = links.get(&peer_id).map(|e| (e.is_live(), e.dialed_by_us));
            let keep_existing = match existing {
                Some((true, existing_ours)) => {
                    !prefer_new(&local_id, &peer_id, existing_ours, dialed_by_us)
                }
                Some((false, _)) => false,
                None => {
                    let live = links.values().filter(|l| l.is_live()).count();
                    if !dialed_by_us && live >= self.inner.max_peers {
                        warn!(event = "link_rejected_limit", peer = %peer_id, "Peer limit reached, refusing link");
                        drop(links);
                        tokio::spawn(async move { link.close().await });
                        return false;
                    }
                    false
                }
            };
            if keep_existing {
                drop(links);
                debug!(event = "link_duplicate_dropped", peer = %peer_id, "Keeping existing link");
                tokio::spawn(async move { link.close().await });
                return false;
            }
            let displaced = links.remove(&peer_id);
            links.insert(
                peer_id.clone(),
                PeerLink {
                    generation,
                    link: link.clone(),
                    state: LinkState::Connecting,
                    dialed_by_us,
                    closed: SignalOfStop::new(),
                },
            );
            displaced
        };
        if let Some(old) = displaced {
            debug!(event = "link_replaced", peer = %peer_id, "Replacing link");
            self.retire(&peer_id, old);
        }

        tokio::spawn(link_pump(
            Arc::downgrade(&self.inner),
            peer_id,
            generation,
            link,
            events,
        ));
        true
    }

    /// Drop a link that is no longer in the table.
    fn retire(&self, peer_id: &str, old: PeerLink) {
        old.closed.cancel();
        let link = old.link;
        tokio::spawn(async move { link.close().await });
        if old.state == LinkState::Open {
            self.publish(ConnectionEvent::Disconnected {
                peer_id: peer_id.to_string(),
            });
        }
    }

    fn on_link_open(&self, peer_id: &str, generation: u64) {
        let opened = {
            let mut links = lock(&self.inner.links);
            match links.get_mut(peer_id) {
                Some(entry) if entry.generation == generation && entry.state == LinkState::Connecting => {
                    entry.state = LinkState::Open;
                    true
                }
                _ => false,
            }
        };
        if opened {
            info!(event = "link_open", peer = peer_id, "Link open");
            self.publish(ConnectionEvent::Connected {
                peer_id: peer_id.to_string(),
            });
        }
    }

    fn on_link_message(&self, peer_id: &str, generation: u64, frame: Bytes) {
        let current = lock(&self.inner.links)
            .get(peer_id)
            .is_some_and(|e| e.generation == generation);
        if !current {
            trace!(event = "stale_frame_dropped", peer = peer_id, "Frame from replaced link dropped");
            return;
        }
        match ProtocolMessage::decode(frame) {
            Ok(message) => {
                trace!(event = "frame_received", peer = peer_id, kind = message.kind(), "Frame received");
                self.publish(ConnectionEvent::Message {
                    peer_id: peer_id.to_string(),
                    message,
                });
            }
            Err(e) => {
                warn!(event = "frame_decode_failure", peer = peer_id, error = %e, "Undecodable frame");
                self.publish_error(Some(peer_id), e.kind(), e.to_string());
            }
        }
    }

    async fn on_link_closed(&self, peer_id: &str, generation: u64, reason: Option<String>) {
        let removed = {
            let mut links = lock(&self.inner.links);
            let current = links.get(peer_id).is_some_and(|e| e.generation == generation);
            if current { links.remove(peer_id) } else { None }
        };
        let Some(entry) = removed else {
            trace!(event = "stale_close_ignored", peer = peer_id, "Close from untracked link ignored");
            return;
        };
        entry.closed.cancel();
        entry.link.close().await;
        if let Some(reason) = reason {
            warn!(event = "link_failure", peer = peer_id, reason = %reason, "Link failed");
            self.publish_error(Some(peer_id), ErrorKind::PeerUnavailable, reason);
        }
        if entry.state == LinkState::Open {
            info!(event = "link_closed", peer = peer_id, "Link closed");
            self.publish(ConnectionEvent::Disconnected {
                peer_id: peer_id.to_string(),
            });
        }
    }

    /// Close the link to `peer_id`. Returns whether a link was tracked.
    pub async fn disconnect_peer(&self, peer_id: &str) -> bool {
        let removed = lock(&self.inner.links).remove(peer_id);
        let Some(entry) = removed else {
            return false;
        };
        entry.closed.cancel();
        entry.link.close().await;
        info!(event = "link_disconnect", peer = peer_id, "Disconnected peer");
        if entry.state == LinkState::Open {
            self.publish(ConnectionEvent::Disconnected {
                peer_id: peer_id.to_string(),
            });
        }
        true
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    fn open_link(&self, peer_id: &str) -> Option<Arc<dyn DataLink>> {
        lock(&self.inner.links)
            .get(peer_id)
            .filter(|e| e.state == LinkState::Open && e.link.is_open())
            .map(|e| e.link.clone())
    }

    /// Handle on an OPEN link, for flow control.
    pub fn link_handle(&self, peer_id: &str) -> Option<LinkHandle> {
        lock(&self.inner.links)
            .get(peer_id)
            .filter(|e| e.state == LinkState::Open && e.link.is_open())
            .map(|e| LinkHandle {
                link: e.link.clone(),
                closed: e.closed.clone(),
            })
    }

    /// Deliver `message` over the OPEN link to `peer_id`.
    ///
    /// Returns `Ok(false)` when no such link exists; the message is dropped.
    pub async fn send(&self, peer_id: &str, message: &ProtocolMessage) -> CoreResult<bool> {
        let Some(link) = self.open_link(peer_id) else {
            trace!(event = "send_dropped", peer = peer_id, kind = message.kind(), "No open link");
            return Ok(false);
        };
        let frame = message.encode()?;
        link.send(frame).await.map_err(|e| CoreError::ChannelSend {
            peer_id: peer_id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(true)
    }

    /// Deliver `message` over every OPEN link. Returns how many links took it.
    pub async fn broadcast(&self, message: &ProtocolMessage) -> CoreResult<usize> {
        let frame = message.encode()?;
        let targets: Vec<Arc<dyn DataLink>> = lock(&self.inner.links)
            .values()
            .filter(|e| e.state == LinkState::Open && e.link.is_open())
            .map(|e| e.link.clone())
            .collect();
        let mut delivered = 0;
        for link in targets {
            match link.send(frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(event = "broadcast_send_failure", peer = link.peer_id(), error = %e, "Broadcast send failed");
                }
            }
        }
        Ok(delivered)
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// Peers with an OPEN link, sorted.
    pub fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = lock(&self.inner.links)
            .iter()
            .filter(|(_, e)| e.state == LinkState::Open)
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn link_state(&self, peer_id: &str) -> Option<LinkState> {
        lock(&self.inner.links).get(peer_id).map(|e| e.state)
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.link_state(peer_id) == Some(LinkState::Open)
    }
}

async fn session_loop(
    inner: Weak<Inner>,
    session: Arc<dyn Session>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    stop: SignalOfStop,
) {
    loop {
        let event = tokio::select! {
            _ = stop.wait() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else { break };
        let manager = ConnectionManager { inner };
        if manager.on_session_event(event, &session, &stop).await.is_break() {
            break;
        }
    }
    debug!(event = "session_loop_exit", id = session.id(), "Session loop stopped");
}

async fn link_pump(
    inner: Weak<Inner>,
    peer_id: String,
    generation: u64,
    link: Arc<dyn DataLink>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    if link.is_open()
        && let Some(inner) = inner.upgrade()
    {
        ConnectionManager { inner }.on_link_open(&peer_id, generation);
    }
    let mut reason = None;
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        let manager = ConnectionManager { inner };
        match event {
            LinkEvent::Open => manager.on_link_open(&peer_id, generation),
            LinkEvent::Message(frame) => manager.on_link_message(&peer_id, generation, frame),
            LinkEvent::Close => break,
            LinkEvent::Error(e) => {
                reason = Some(e);
                break;
            }
            LinkEvent::Degraded => {
                reason = Some("connection degraded".to_string());
                break;
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        ConnectionManager { inner }
            .on_link_closed(&peer_id, generation, reason)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory::MemoryNetwork;
    use crate::core::protocol::ChatMessage;

    fn manager(net: &MemoryNetwork, max_peers: usize) -> ConnectionManager {
        ConnectionManager::new(Arc::new(net.clone()), max_peers)
    }

    async fn expect_event(
        rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
        mut pred: impl FnMut(&ConnectionEvent) -> bool,
    ) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.expect("bus open");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event in time")
    }

    async fn connected_pair(net: &MemoryNetwork) -> (ConnectionManager, ConnectionManager) {
        let a = manager(net, 5);
        let b = manager(net, 5);
        a.initialize("ALICE1").await.unwrap();
        b.initialize("BRUCE2").await.unwrap();
        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();
        a.connect("BRUCE2").await.unwrap();
        expect_event(&mut a_rx, |e| matches!(e, ConnectionEvent::Connected { .. })).await;
        expect_event(&mut b_rx, |e| matches!(e, ConnectionEvent::Connected { .. })).await;
        (a, b)
    }

    fn chat(text: &str) -> ProtocolMessage {
        ProtocolMessage::Chat(ChatMessage {
            id: "m".into(),
            text: text.into(),
            timestamp: 0,
            sender_name: None,
        })
    }

    #[test]
    fn simultaneous_dial_tie_break_agrees_on_both_sides() {
        // ALICE1 < BRUCE2, so ALICE1's dial wins everywhere.
        assert!(!prefer_new("ALICE1", "BRUCE2", true, false));
        assert!(prefer_new("BRUCE2", "ALICE1", true, false));
        assert!(!prefer_new("BRUCE2", "ALICE1", false, true));
        assert!(prefer_new("ALICE1", "BRUCE2", false, true));
        // Repeated dials.
        assert!(prefer_new("ALICE1", "BRUCE2", false, false));
        assert!(!prefer_new("ALICE1", "BRUCE2", true, true));
    }

    #[tokio::test]
    async fn initialize_is_idempotent_for_same_id() {
        let net = MemoryNetwork::new();
        let m = manager(&net, 5);
        m.initialize("ALICE1").await.unwrap();
        m.initialize("ALICE1").await.unwrap();
        assert_eq!(net.open_attempts("ALICE1"), 1);

        m.initialize("CHARL3").await.unwrap();
        assert!(!net.is_registered("ALICE1"));
        assert_eq!(m.self_id().as_deref(), Some("CHARL3"));
    }

    #[tokio::test]
    async fn taken_identity_is_a_conflict() {
        let net = MemoryNetwork::new();
        net.reserve_id("ALICE1");
        let m = manager(&net, 5);
        let err = m.initialize("ALICE1").await.unwrap_err();
        assert!(err.is_identity_conflict());
        assert!(m.self_id().is_none());
    }

    #[tokio::test]
    async fn connect_validates_before_dialing() {
        let net = MemoryNetwork::new();
        let m = manager(&net, 5);
        assert!(matches!(m.connect("BRUCE2").await, Err(CoreError::NotInitialized)));
        m.initialize("ALICE1").await.unwrap();
        assert!(matches!(m.connect("bad").await, Err(CoreError::InvalidPeerId(_))));
        assert!(matches!(m.connect("ALICE1").await, Err(CoreError::SelfConnect)));
    }

    #[tokio::test]
    async fn unknown_peer_is_reported_unavailable() {
        let net = MemoryNetwork::new();
        let m = manager(&net, 5);
        m.initialize("ALICE1").await.unwrap();
        let mut rx = m.subscribe();
        let err = m.connect("ZZZZZZ").await.unwrap_err();
        assert!(matches!(err, CoreError::PeerUnavailable { .. }));
        let event = expect_event(&mut rx, |e| matches!(e, ConnectionEvent::Error { .. })).await;
        let ConnectionEvent::Error { peer_id, kind, .. } = event else { unreachable!() };
        assert_eq!(peer_id.as_deref(), Some("ZZZZZZ"));
        assert_eq!(kind, ErrorKind::PeerUnavailable);
        assert!(m.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn connect_opens_both_sides_and_repeat_is_noop() {
        let net = MemoryNetwork::new();
        let (a, b) = connected_pair(&net).await;
        assert_eq!(a.connected_peers(), vec!["BRUCE2".to_string()]);
        assert_eq!(b.connected_peers(), vec!["ALICE1".to_string()]);

        let pipe_before = net.pipe("ALICE1", "BRUCE2").unwrap();
        pipe_before.capture();
        a.connect("BRUCE2").await.unwrap();
        assert!(a.send("BRUCE2", &chat("still here")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pipe_before.captured().len(), 1);
    }

    #[tokio::test]
    async fn peer_limit_applies_to_new_links() {
        let net = MemoryNetwork::new();
        let a = manager(&net, 1);
        let b = manager(&net, 5);
        let c = manager(&net, 5);
        a.initialize("ALICE1").await.unwrap();
        b.initialize("BRUCE2").await.unwrap();
        c.initialize("CHARL3").await.unwrap();
        a.connect("BRUCE2").await.unwrap();
        let err = a.connect("CHARL3").await.unwrap_err();
        assert!(matches!(err, CoreError::PeerLimit { max: 1 }));
    }

    #[tokio::test]
    async fn send_and_broadcast_reach_open_links_only() {
        let net = MemoryNetwork::new();
        let (a, b) = connected_pair(&net).await;
        let mut b_rx = b.subscribe();

        assert!(a.send("BRUCE2", &chat("hi")).await.unwrap());
        let event = expect_event(&mut b_rx, |e| matches!(e, ConnectionEvent::Message { .. })).await;
        let ConnectionEvent::Message { peer_id, message } = event else { unreachable!() };
        assert_eq!(peer_id, "ALICE1");
        assert_eq!(message, chat("hi"));

        assert!(!a.send("DELTA4", &chat("nobody")).await.unwrap());
        assert_eq!(a.broadcast(&ProtocolMessage::Bye).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_send_is_a_channel_error() {
        let net = MemoryNetwork::new();
        let (a, _b) = connected_pair(&net).await;
        net.pipe("ALICE1", "BRUCE2").unwrap().fail_next_sends(1);
        let err = a.send("BRUCE2", &chat("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelSendFailure);
        assert!(a.is_connected("BRUCE2"));
    }

    #[tokio::test]
    async fn severed_link_disconnects_both_sides() {
        let net = MemoryNetwork::new();
        let (a, b) = connected_pair(&net).await;
        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();
        let a_handle = a.link_handle("BRUCE2").unwrap();

        net.pipe("ALICE1", "BRUCE2").unwrap().sever();
        expect_event(&mut a_rx, |e| matches!(e, ConnectionEvent::Disconnected { .. })).await;
        expect_event(&mut b_rx, |e| matches!(e, ConnectionEvent::Disconnected { .. })).await;
        assert!(a_handle.closed.cancelled());
        assert!(a.link_state("BRUCE2").is_none());
        assert!(!a.send("BRUCE2", &chat("late")).await.unwrap());

        // A fresh connect after the close creates a new link.
        a.connect("BRUCE2").await.unwrap();
        expect_event(&mut a_rx, |e| matches!(e, ConnectionEvent::Connected { .. })).await;
    }

    #[tokio::test]
    async fn disconnect_peer_fires_event_once() {
        let net = MemoryNetwork::new();
        let (a, _b) = connected_pair(&net).await;
        let mut rx = a.subscribe();
        assert!(a.disconnect_peer("BRUCE2").await);
        assert!(!a.disconnect_peer("BRUCE2").await);
        expect_event(&mut rx, |e| matches!(e, ConnectionEvent::Disconnected { .. })).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, ConnectionEvent::Disconnected { .. }));
        }
    }

    #[tokio::test]
    async fn session_disconnect_triggers_reconnect() {
        let net = MemoryNetwork::new();
        let m = manager(&net, 5);
        m.initialize("ALICE1").await.unwrap();
        net.disconnect_session("ALICE1");
        tokio::time::timeout(Duration::from_secs(1), async {
            while net.reconnect_attempts("ALICE1") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reconnect attempted");
    }

    #[tokio::test]
    async fn network_error_triggers_reconnect() {
        let net = MemoryNetwork::new();
        let m = manager(&net, 5);
        m.initialize("ALICE1").await.unwrap();
        net.inject_session_error("ALICE1", SessionError::Network("socket reset".into()));
        tokio::time::timeout(Duration::from_secs(1), async {
            while net.reconnect_attempts("ALICE1") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reconnect attempted");
    }

    #[tokio::test]
    async fn blocked_reconnect_polls_until_it_clears() {
        let net = MemoryNetwork::new();
        let poll = Duration::from_millis(40);
        let m = ConnectionManager::with_reconnect_poll(Arc::new(net.clone()), 5, poll);
        m.initialize("ALICE1").await.unwrap();
        net.block_reconnect("ALICE1", true);
        net.disconnect_session("ALICE1");

        tokio::time::timeout(Duration::from_secs(1), async {
            while net.reconnect_attempts("ALICE1") < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reconnect retried on the poll interval");

        net.block_reconnect("ALICE1", false);
        tokio::time::sleep(poll * 3).await;
        let settled = net.reconnect_attempts("ALICE1");
        tokio::time::sleep(poll * 4).await;
        assert_eq!(net.reconnect_attempts("ALICE1"), settled);
    }

    #[tokio::test]
    async fn closed_session_restarts_under_same_id() {
        let net = MemoryNetwork::new();
        let m = manager(&net, 5);
        m.initialize("ALICE1").await.unwrap();
        net.close_session("ALICE1");
        assert!(!net.is_registered("ALICE1"));
        tokio::time::timeout(SESSION_RESTART_DELAY + Duration::from_secs(2), async {
            while !net.is_registered("ALICE1") {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("session restarted");
        assert_eq!(m.self_id().as_deref(), Some("ALICE1"));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_unregisters() {
        let net = MemoryNetwork::new();
        let (a, _b) = connected_pair(&net).await;
        a.close().await;
        a.close().await;
        assert!(!net.is_registered("ALICE1"));
        assert!(a.connected_peers().is_empty());
        assert!(a.self_id().is_none());
    }

    #[tokio::test]
    async fn simultaneous_dial_settles_on_one_link() {
        let net = MemoryNetwork::new();
        let a = manager(&net, 5);
        let b = manager(&net, 5);
        a.initialize("ALICE1").await.unwrap();
        b.initialize("BRUCE2").await.unwrap();
        let (ra, rb) = tokio::join!(a.connect("BRUCE2"), b.connect("ALICE1"));
        ra.unwrap();
        rb.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(a.connected_peers(), vec!["BRUCE2".to_string()]);
        assert_eq!(b.connected_peers(), vec!["ALICE1".to_string()]);
        let mut b_rx = b.subscribe();
        assert!(a.send("BRUCE2", &chat("one link")).await.unwrap());
        expect_event(&mut b_rx, |e| matches!(e, ConnectionEvent::Message { .. })).await;
    }
}
