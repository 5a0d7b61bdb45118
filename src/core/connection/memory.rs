//! In-process transport.
//!
//! Every session registers in a shared [`MemoryNetwork`]; dialing creates a
//! pair of [`MemoryLink`] ends joined by two one-way pipes. Each pipe has a
//! pump task that moves frames to the far end, decrementing the sender's
//! buffered amount as it goes, so backpressure behaves like a real data
//! channel. Tests reach into the network to pause pipes, inject failures,
//! drop sessions and read the peak queue depth.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, trace};

use super::{DataLink, LinkError, LinkEvent, Session, SessionError, SessionEvent, Transport};
use crate::utils::sos::SignalOfStop;

// ── Network ──────────────────────────────────────────────────────────────────

struct SessionSlot {
    serial: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
    disconnected: Arc<AtomicBool>,
    reconnects: Arc<AtomicUsize>,
}

#[derive(Default)]
struct NetworkState {
    sessions: HashMap<String, SessionSlot>,
    reserved: HashSet<String>,
    blocked_reconnect: HashSet<String>,
    open_attempts: HashMap<String, usize>,
    pipes: HashMap<(String, String), Arc<Pipe>>,
}

/// Shared switchboard for in-process sessions. Clones refer to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    serials: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut NetworkState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Mark `id` as taken by someone outside this process.
    pub fn reserve_id(&self, id: &str) {
        self.with_state(|s| s.reserved.insert(id.to_string()));
    }

    /// Number of times a session was requested for `id`, successful or not.
    pub fn open_attempts(&self, id: &str) -> usize {
        self.with_state(|s| s.open_attempts.get(id).copied().unwrap_or(0))
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.with_state(|s| s.sessions.contains_key(id))
    }

    /// Drop the signaling connection of `id`; links stay up.
    pub fn disconnect_session(&self, id: &str) {
        self.with_state(|s| {
            if let Some(slot) = s.sessions.get(id) {
                slot.disconnected.store(true, Ordering::Release);
                let _ = slot.events.send(SessionEvent::Disconnected);
            }
        });
    }

    /// Make `reconnect` fail for `id` until unblocked.
    pub fn block_reconnect(&self, id: &str, blocked: bool) {
        self.with_state(|s| {
            if blocked {
                s.blocked_reconnect.insert(id.to_string());
            } else {
                s.blocked_reconnect.remove(id);
            }
        });
    }

    pub fn reconnect_attempts(&self, id: &str) -> usize {
        self.with_state(|s| {
            s.sessions
                .get(id)
                .map(|slot| slot.reconnects.load(Ordering::Acquire))
                .unwrap_or(0)
        })
    }

    /// Close the session of `id` from the network side.
    pub fn close_session(&self, id: &str) {
        self.with_state(|s| {
            if let Some(slot) = s.sessions.remove(id) {
                let _ = slot.events.send(SessionEvent::Closed);
            }
        });
    }

    pub fn inject_session_error(&self, id: &str, error: SessionError) {
        self.with_state(|s| {
            if let Some(slot) = s.sessions.get(id) {
                let _ = slot.events.send(SessionEvent::Error(error));
            }
        });
    }

    /// Controls for the most recent pipe carrying frames from `from` to `to`.
    pub fn pipe(&self, from: &str, to: &str) -> Option<PipeControl> {
        self.with_state(|s| {
            s.pipes
                .get(&(from.to_string(), to.to_string()))
                .cloned()
                .map(|pipe| PipeControl { pipe })
        })
    }

    fn connect(&self, local: &str, remote: &str) -> Result<Arc<MemoryLink>, SessionError> {
        let remote_events = self
            .with_state(|s| s.sessions.get(remote).map(|slot| slot.events.clone()))
            .ok_or_else(|| SessionError::PeerUnavailable(remote.to_string()))?;

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let pair = Arc::new(LinkPair {
            open: AtomicBool::new(false),
            closed: SignalOfStop::new(),
            ends: [local_tx.clone(), remote_tx.clone()],
        });

        let outbound = Pipe::spawn(pair.clone(), remote_tx);
        let inbound = Pipe::spawn(pair.clone(), local_tx);
        self.with_state(|s| {
            s.pipes
                .insert((local.to_string(), remote.to_string()), outbound.clone());
            s.pipes
                .insert((remote.to_string(), local.to_string()), inbound.clone());
        });

        let local_end = Arc::new(MemoryLink {
            peer_id: remote.to_string(),
            pair: pair.clone(),
            outbound: outbound.clone(),
            events: Mutex::new(Some(local_rx)),
        });
        let remote_end = Arc::new(MemoryLink {
            peer_id: local.to_string(),
            pair: pair.clone(),
            outbound: inbound,
            events: Mutex::new(Some(remote_rx)),
        });

        if remote_events
            .send(SessionEvent::IncomingLink(remote_end))
            .is_err()
        {
            return Err(SessionError::PeerUnavailable(remote.to_string()));
        }

        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if pair.closed.cancelled() {
                return;
            }
            pair.open.store(true, Ordering::Release);
            for end in &pair.ends {
                let _ = end.send(LinkEvent::Open);
            }
        });

        debug!(event = "memory_link_dialed", from = local, to = remote, "Memory link created");
        Ok(local_end)
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn open(
        &self,
        self_id: &str,
    ) -> Result<(Arc<dyn Session>, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        if self_id.is_empty() {
            return Err(SessionError::InvalidId(self_id.to_string()));
        }
        let serial = self.serials.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let disconnected = Arc::new(AtomicBool::new(false));
        let reconnects = Arc::new(AtomicUsize::new(0));

        self.with_state(|s| {
            *s.open_attempts.entry(self_id.to_string()).or_default() += 1;
            if s.reserved.contains(self_id) || s.sessions.contains_key(self_id) {
                return Err(SessionError::UnavailableId(self_id.to_string()));
            }
            s.sessions.insert(
                self_id.to_string(),
                SessionSlot {
                    serial,
                    events: tx,
                    disconnected: disconnected.clone(),
                    reconnects: reconnects.clone(),
                },
            );
            Ok(())
        })?;

        let session: Arc<dyn Session> = Arc::new(MemorySession {
            id: self_id.to_string(),
            serial,
            network: self.clone(),
            disconnected,
            reconnects,
        });
        Ok((session, rx))
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

struct MemorySession {
    id: String,
    serial: u64,
    network: MemoryNetwork,
    disconnected: Arc<AtomicBool>,
    reconnects: Arc<AtomicUsize>,
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    async fn reconnect(&self) -> Result<(), SessionError> {
        self.reconnects.fetch_add(1, Ordering::AcqRel);
        let blocked = self
            .network
            .with_state(|s| s.blocked_reconnect.contains(&self.id));
        if blocked {
            return Err(SessionError::Network("signaling unreachable".into()));
        }
        self.disconnected.store(false, Ordering::Release);
        Ok(())
    }

    async fn dial(&self, remote_id: &str) -> Result<Arc<dyn DataLink>, SessionError> {
        let link: Arc<dyn DataLink> = self.network.connect(&self.id, remote_id)?;
        Ok(link)
    }

    async fn destroy(&self) {
        self.network.with_state(|s| {
            if s.sessions.get(&self.id).is_some_and(|slot| slot.serial == self.serial) {
                s.sessions.remove(&self.id);
            }
        });
    }
}

// ── Links ────────────────────────────────────────────────────────────────────

struct LinkPair {
    open: AtomicBool,
    closed: SignalOfStop,
    ends: [mpsc::UnboundedSender<LinkEvent>; 2],
}

impl LinkPair {
    fn close(&self) {
        if self.closed.cancelled() {
            return;
        }
        self.open.store(false, Ordering::Release);
        self.closed.cancel();
        for end in &self.ends {
            let _ = end.send(LinkEvent::Close);
        }
    }
}

/// One direction of a link: a queue, a pump, and the sender-side accounting.
struct Pipe {
    queue: mpsc::UnboundedSender<Bytes>,
    pair: Arc<LinkPair>,
    buffered: AtomicUsize,
    peak: AtomicUsize,
    low_threshold: AtomicUsize,
    drain: Arc<Notify>,
    paused: watch::Sender<bool>,
    delay: Mutex<Duration>,
    failures: AtomicUsize,
    capture: Mutex<Option<Vec<Bytes>>>,
}

impl Pipe {
    fn spawn(pair: Arc<LinkPair>, deliver_to: mpsc::UnboundedSender<LinkEvent>) -> Arc<Self> {
        let (queue, rx) = mpsc::unbounded_channel();
        let (paused, _) = watch::channel(false);
        let pipe = Arc::new(Self {
            queue,
            pair,
            buffered: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            drain: Arc::new(Notify::new()),
            paused,
            delay: Mutex::new(Duration::ZERO),
            failures: AtomicUsize::new(0),
            capture: Mutex::new(None),
        });
        tokio::spawn(pump(pipe.clone(), rx, deliver_to));
        pipe
    }

    fn delay(&self) -> Duration {
        self.delay.lock().map(|d| *d).unwrap_or_default()
    }

    fn release(&self, len: usize) {
        let prev = self.buffered.fetch_sub(len, Ordering::AcqRel);
        let now = prev.saturating_sub(len);
        let low = self.low_threshold.load(Ordering::Acquire);
        if prev > low && now <= low {
            self.drain.notify_waiters();
        }
    }
}

async fn pump(
    pipe: Arc<Pipe>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    deliver_to: mpsc::UnboundedSender<LinkEvent>,
) {
    let closed = pipe.pair.closed.clone();
    let mut paused = pipe.paused.subscribe();
    loop {
        let frame = tokio::select! {
            _ = closed.wait() => break,
            frame = rx.recv() => match frame {
                Some(f) => f,
                None => break,
            },
        };
        tokio::select! {
            _ = closed.wait() => break,
            resumed = async { paused.wait_for(|p| !*p).await.is_ok() } => if !resumed { break },
        }
        let delay = pipe.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if closed.cancelled() {
            break;
        }
        let len = frame.len();
        if let Ok(mut capture) = pipe.capture.lock()
            && let Some(frames) = capture.as_mut()
        {
            frames.push(frame.clone());
        }
        pipe.release(len);
        let _ = deliver_to.send(LinkEvent::Message(frame));
    }
    trace!(event = "memory_pump_stopped", "Memory pipe pump stopped");
}

/// Test-side handle on one direction of a link.
#[derive(Clone)]
pub struct PipeControl {
    pipe: Arc<Pipe>,
}

impl PipeControl {
    /// Stop delivering frames; sends keep queueing.
    pub fn pause(&self) {
        self.pipe.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.pipe.paused.send_replace(false);
    }

    /// Sleep this long before delivering each frame.
    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.pipe.delay.lock() {
            *d = delay;
        }
    }

    /// Make the next `count` sends fail.
    pub fn fail_next_sends(&self, count: usize) {
        self.pipe.failures.store(count, Ordering::Release);
    }

    pub fn buffered(&self) -> usize {
        self.pipe.buffered.load(Ordering::Acquire)
    }

    pub fn peak_buffered(&self) -> usize {
        self.pipe.peak.load(Ordering::Acquire)
    }

    /// Start recording delivered frames.
    pub fn capture(&self) {
        if let Ok(mut c) = self.pipe.capture.lock() {
            *c = Some(Vec::new());
        }
    }

    pub fn captured(&self) -> Vec<Bytes> {
        self.pipe
            .capture
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .unwrap_or_default()
    }

    /// Tear the link down as if the remote vanished.
    pub fn sever(&self) {
        self.pipe.pair.close();
    }
}

pub struct MemoryLink {
    peer_id: String,
    pair: Arc<LinkPair>,
    outbound: Arc<Pipe>,
    events: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

#[async_trait]
impl DataLink for MemoryLink {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn is_open(&self) -> bool {
        self.pair.open.load(Ordering::Acquire)
    }

    async fn send(&self, frame: Bytes) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::NotOpen);
        }
        let injected = self
            .outbound
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(LinkError::Send("injected send failure".into()));
        }
        let len = frame.len();
        let now = self.outbound.buffered.fetch_add(len, Ordering::AcqRel) + len;
        self.outbound.peak.fetch_max(now, Ordering::AcqRel);
        self.outbound
            .queue
            .send(frame)
            .map_err(|_| LinkError::NotOpen)
    }

    async fn buffered_amount(&self) -> usize {
        self.outbound.buffered.load(Ordering::Acquire)
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.outbound.low_threshold.store(threshold, Ordering::Release);
    }

    fn drain_signal(&self) -> Arc<Notify> {
        self.outbound.drain.clone()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events.lock().ok().and_then(|mut e| e.take())
    }

    async fn close(&self) {
        self.pair.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    async fn open_pair(
        net: &MemoryNetwork,
    ) -> (Arc<dyn DataLink>, Arc<dyn DataLink>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (alice, _alice_events) = net.open("ALICE1").await.unwrap();
        let (_bruce, mut bruce_events) = net.open("BRUCE2").await.unwrap();
        let dialed = alice.dial("BRUCE2").await.unwrap();
        let Some(SessionEvent::IncomingLink(accepted)) = bruce_events.recv().await else {
            panic!("expected incoming link");
        };
        (dialed, accepted, bruce_events)
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let net = MemoryNetwork::new();
        let _first = net.open("ALICE1").await.unwrap();
        let err = net.open("ALICE1").await.err().unwrap();
        assert_eq!(err, SessionError::UnavailableId("ALICE1".into()));
        net.reserve_id("BRUCE2");
        assert!(net.open("BRUCE2").await.is_err());
        assert_eq!(net.open_attempts("BRUCE2"), 1);
    }

    #[tokio::test]
    async fn dialing_unknown_peer_fails() {
        let net = MemoryNetwork::new();
        let (alice, _rx) = net.open("ALICE1").await.unwrap();
        let err = alice.dial("ZZZZZZ").await.err().unwrap();
        assert_eq!(err, SessionError::PeerUnavailable("ZZZZZZ".into()));
    }

    #[tokio::test]
    async fn frames_flow_and_drain_accounting_settles() {
        let net = MemoryNetwork::new();
        let (dialed, accepted, _keep) = open_pair(&net).await;
        let mut a_events = dialed.take_events().unwrap();
        let mut b_events = accepted.take_events().unwrap();
        assert!(matches!(next_event(&mut a_events).await, LinkEvent::Open));
        assert!(matches!(next_event(&mut b_events).await, LinkEvent::Open));

        dialed.send(Bytes::from_static(b"hello")).await.unwrap();
        match next_event(&mut b_events).await {
            LinkEvent::Message(m) => assert_eq!(&m[..], b"hello"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(dialed.buffered_amount().await, 0);
        assert_eq!(net.pipe("ALICE1", "BRUCE2").unwrap().peak_buffered(), 5);
    }

    #[tokio::test]
    async fn paused_pipe_accumulates_and_signals_drain() {
        let net = MemoryNetwork::new();
        let (dialed, accepted, _keep) = open_pair(&net).await;
        let mut a_events = dialed.take_events().unwrap();
        let _b_events = accepted.take_events().unwrap();
        assert!(matches!(next_event(&mut a_events).await, LinkEvent::Open));

        let pipe = net.pipe("ALICE1", "BRUCE2").unwrap();
        pipe.pause();
        dialed.set_buffered_amount_low_threshold(10).await;
        for _ in 0..4 {
            dialed.send(Bytes::from(vec![0u8; 8])).await.unwrap();
        }
        assert_eq!(dialed.buffered_amount().await, 32);

        let drain = dialed.drain_signal();
        let notified = drain.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        pipe.resume();
        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .expect("drain signal");
        assert!(dialed.buffered_amount().await <= 10);
    }

    #[tokio::test]
    async fn injected_failure_and_close() {
        let net = MemoryNetwork::new();
        let (dialed, accepted, _keep) = open_pair(&net).await;
        let mut a_events = dialed.take_events().unwrap();
        let mut b_events = accepted.take_events().unwrap();
        assert!(matches!(next_event(&mut a_events).await, LinkEvent::Open));
        assert!(matches!(next_event(&mut b_events).await, LinkEvent::Open));

        net.pipe("ALICE1", "BRUCE2").unwrap().fail_next_sends(1);
        assert!(dialed.send(Bytes::from_static(b"x")).await.is_err());
        assert!(dialed.send(Bytes::from_static(b"y")).await.is_ok());

        accepted.close().await;
        assert!(!dialed.is_open());
        assert_eq!(dialed.send(Bytes::from_static(b"z")).await, Err(LinkError::NotOpen));
        loop {
            if matches!(next_event(&mut a_events).await, LinkEvent::Close) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn destroy_only_removes_own_registration() {
        let net = MemoryNetwork::new();
        let (first, _rx1) = net.open("ALICE1").await.unwrap();
        net.close_session("ALICE1");
        let (_second, _rx2) = net.open("ALICE1").await.unwrap();
        first.destroy().await;
        assert!(net.is_registered("ALICE1"));
    }
}
