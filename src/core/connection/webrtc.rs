//! WebRTC transport built on `webrtc` data channels.
//!
//! Each link is one peer connection carrying a single ordered, reliable data
//! channel labelled `nwshare`. The channel's `bufferedamountlow` callback
//! drives the backpressure gate, and peer-connection failure is reported as
//! link degradation. Offer/answer exchange goes through a [`Signaler`];
//! [`LoopbackSignaler`] wires up peers living in the same process.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::{SctpMaxMessageSize, SettingEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{DataLink, LinkError, LinkEvent, Session, SessionError, SessionEvent, Transport};
use crate::core::config::{
    DATA_CHANNEL_LABEL, ICE_GATHER_TIMEOUT, SCTP_MAX_MESSAGE_SIZE, SCTP_USE_LOOPBACK,
    SIGNALING_TIMEOUT,
};
use crate::utils::sos::SignalOfStop;

fn rtc_error(e: webrtc::Error) -> SessionError {
    SessionError::Other(e.to_string())
}

// ── Signaling ────────────────────────────────────────────────────────────────

/// An SDP offer addressed to a registered id, with a slot for the answer.
pub struct IncomingOffer {
    pub from: String,
    pub sdp: String,
    pub reply: oneshot::Sender<String>,
}

/// Out-of-band offer/answer exchange.
#[async_trait]
pub trait Signaler: Send + Sync {
    /// Claim `id`. Offers addressed to it arrive on the returned channel.
    async fn register(&self, id: &str) -> Result<mpsc::UnboundedReceiver<IncomingOffer>, SessionError>;

    async fn unregister(&self, id: &str);

    /// Deliver `offer_sdp` to `to` and wait for the answer SDP.
    async fn exchange(&self, from: &str, to: &str, offer_sdp: String) -> Result<String, SessionError>;
}

/// Signaler for peers in one process.
#[derive(Clone, Default)]
pub struct LoopbackSignaler {
    peers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<IncomingOffer>>>>,
}

impl LoopbackSignaler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Signaler for LoopbackSignaler {
    async fn register(&self, id: &str) -> Result<mpsc::UnboundedReceiver<IncomingOffer>, SessionError> {
        let mut peers = self
            .peers
            .lock()
            .map_err(|_| SessionError::Other("signaler poisoned".into()))?;
        if peers.get(id).is_some_and(|tx| !tx.is_closed()) {
            return Err(SessionError::UnavailableId(id.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        peers.insert(id.to_string(), tx);
        Ok(rx)
    }

    async fn unregister(&self, id: &str) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(id);
        }
    }

    async fn exchange(&self, from: &str, to: &str, offer_sdp: String) -> Result<String, SessionError> {
        let target = self
            .peers
            .lock()
            .ok()
            .and_then(|p| p.get(to).cloned())
            .ok_or_else(|| SessionError::PeerUnavailable(to.to_string()))?;
        let (reply, answer) = oneshot::channel();
        target
            .send(IncomingOffer {
                from: from.to_string(),
                sdp: offer_sdp,
                reply,
            })
            .map_err(|_| SessionError::PeerUnavailable(to.to_string()))?;
        timeout(SIGNALING_TIMEOUT, answer)
            .await
            .map_err(|_| SessionError::Network(format!("no answer from '{to}'")))?
            .map_err(|_| SessionError::PeerUnavailable(to.to_string()))
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

pub struct WebRtcTransport {
    signaler: Arc<dyn Signaler>,
    ice_servers: Vec<String>,
}

impl WebRtcTransport {
    /// Host candidates only; enough for peers on one machine or LAN.
    pub fn new(signaler: Arc<dyn Signaler>) -> Self {
        Self {
            signaler,
            ice_servers: Vec::new(),
        }
    }

    pub fn with_ice_servers(mut self, urls: Vec<String>) -> Self {
        self.ice_servers = urls;
        self
    }
}

fn build_api() -> Result<API, SessionError> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me).map_err(rtc_error)?;

    let mut se = SettingEngine::default();
    se.set_sctp_max_message_size_can_send(SctpMaxMessageSize::Bounded(SCTP_MAX_MESSAGE_SIZE));
    se.set_include_loopback_candidate(SCTP_USE_LOOPBACK);

    Ok(APIBuilder::new()
        .with_setting_engine(se)
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

/// Advertise the raised receive limit; the default SDP caps messages at 64 KiB.
fn inject_max_message_size(mut desc: RTCSessionDescription) -> RTCSessionDescription {
    if !desc.sdp.contains("a=max-message-size:") {
        desc.sdp
            .push_str(&format!("a=max-message-size:{SCTP_MAX_MESSAGE_SIZE}\r\n"));
    }
    desc
}

/// Wait for ICE gathering to finish and return the complete local description.
async fn gather_local_description(pc: &Arc<RTCPeerConnection>) -> Result<String, SessionError> {
    if pc.ice_gathering_state() != RTCIceGatheringState::Complete {
        let (tx, rx) = oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                if state == RTCIceGathererState::Complete
                    && let Ok(mut guard) = tx.lock()
                    && let Some(tx) = guard.take()
                {
                    let _ = tx.send(());
                }
            })
        }));

        // Re-check after registering so a completion in between is not missed.
        if pc.ice_gathering_state() != RTCIceGatheringState::Complete {
            timeout(ICE_GATHER_TIMEOUT, rx)
                .await
                .map_err(|_| SessionError::Network("ICE gathering timeout".into()))?
                .map_err(|_| SessionError::Other("ICE gathering aborted".into()))?;
        }
    }
    let desc = pc
        .local_description()
        .await
        .ok_or_else(|| SessionError::Other("no local description after ICE gathering".into()))?;
    serde_json::to_string(&inject_max_message_size(desc)).map_err(|e| SessionError::Other(e.to_string()))
}

fn parse_description(sdp: &str) -> Result<RTCSessionDescription, SessionError> {
    serde_json::from_str(sdp).map_err(|e| SessionError::Other(format!("bad SDP: {e}")))
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn open(
        &self,
        self_id: &str,
    ) -> Result<(Arc<dyn Session>, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let offers = self.signaler.register(self_id).await?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(WebRtcSession {
            id: self_id.to_string(),
            api: build_api()?,
            signaler: self.signaler.clone(),
            ice_servers: self.ice_servers.clone(),
            events,
            stop: SignalOfStop::new(),
        });
        tokio::spawn(accept_loop(session.clone(), offers));
        info!(event = "webrtc_session_open", id = self_id, "WebRTC session registered");
        let session: Arc<dyn Session> = session;
        Ok((session, events_rx))
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

struct WebRtcSession {
    id: String,
    api: API,
    signaler: Arc<dyn Signaler>,
    ice_servers: Vec<String>,
    events: mpsc::UnboundedSender<SessionEvent>,
    stop: SignalOfStop,
}

impl WebRtcSession {
    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, SessionError> {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let pc = self
            .api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(rtc_error)?;
        Ok(Arc::new(pc))
    }

    /// Answer one offer; the data channel shows up later through `on_data_channel`.
    async fn accept(&self, offer: IncomingOffer) -> Result<(), SessionError> {
        let pc = self.new_peer_connection().await?;
        let events = self.events.clone();
        let remote = offer.from.clone();
        let weak_pc = Arc::downgrade(&pc);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = events.clone();
            let remote = remote.clone();
            let weak_pc = weak_pc.clone();
            Box::pin(async move {
                let Some(pc) = weak_pc.upgrade() else { return };
                let link: Arc<dyn DataLink> = WebRtcLink::attach(remote, pc, dc).await;
                let _ = events.send(SessionEvent::IncomingLink(link));
            })
        }));

        pc.set_remote_description(parse_description(&offer.sdp)?)
            .await
            .map_err(rtc_error)?;
        let answer = pc.create_answer(None).await.map_err(rtc_error)?;
        pc.set_local_description(answer).await.map_err(rtc_error)?;
        let sdp = gather_local_description(&pc).await?;
        offer
            .reply
            .send(sdp)
            .map_err(|_| SessionError::Other("offerer went away".into()))
    }
}

async fn accept_loop(session: Arc<WebRtcSession>, mut offers: mpsc::UnboundedReceiver<IncomingOffer>) {
    loop {
        let offer = tokio::select! {
            _ = session.stop.wait() => break,
            offer = offers.recv() => match offer {
                Some(offer) => offer,
                None => break,
            },
        };
        let from = offer.from.clone();
        debug!(event = "webrtc_offer_received", from = %from, "Answering offer");
        if let Err(e) = session.accept(offer).await {
            warn!(event = "webrtc_answer_failure", from = %from, error = %e, "Could not answer offer");
        }
    }
    debug!(event = "webrtc_accept_loop_exit", id = %session.id, "Accept loop stopped");
}

#[async_trait]
impl Session for WebRtcSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_disconnected(&self) -> bool {
        false
    }

    async fn reconnect(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn dial(&self, remote_id: &str) -> Result<Arc<dyn DataLink>, SessionError> {
        let pc = self.new_peer_connection().await?;
        let dc = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(rtc_error)?;
        let link: Arc<dyn DataLink> = WebRtcLink::attach(remote_id.to_string(), pc.clone(), dc).await;

        let offer = pc.create_offer(None).await.map_err(rtc_error)?;
        pc.set_local_description(offer).await.map_err(rtc_error)?;
        let offer_sdp = gather_local_description(&pc).await?;
        let answer_sdp = match self.signaler.exchange(&self.id, remote_id, offer_sdp).await {
            Ok(sdp) => sdp,
            Err(e) => {
                let _ = pc.close().await;
                return Err(e);
            }
        };
        pc.set_remote_description(parse_description(&answer_sdp)?)
            .await
            .map_err(rtc_error)?;
        debug!(event = "webrtc_dialed", peer = remote_id, "Offer answered");
        Ok(link)
    }

    async fn destroy(&self) {
        self.stop.cancel();
        self.signaler.unregister(&self.id).await;
    }
}

// ── Link ─────────────────────────────────────────────────────────────────────

pub struct WebRtcLink {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    drain: Arc<Notify>,
    events: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

impl WebRtcLink {
    async fn attach(peer_id: String, pc: Arc<RTCPeerConnection>, dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let drain = Arc::new(Notify::new());

        let open_tx = tx.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                let _ = open_tx.send(LinkEvent::Open);
            })
        }));

        let msg_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = msg_tx.clone();
            Box::pin(async move {
                let _ = tx.send(LinkEvent::Message(msg.data));
            })
        }));

        let close_tx = tx.clone();
        dc.on_close(Box::new(move || {
            let tx = close_tx.clone();
            Box::pin(async move {
                let _ = tx.send(LinkEvent::Close);
            })
        }));

        let err_tx = tx.clone();
        dc.on_error(Box::new(move |e: webrtc::Error| {
            let tx = err_tx.clone();
            Box::pin(async move {
                let _ = tx.send(LinkEvent::Error(e.to_string()));
            })
        }));

        let low = drain.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let low = low.clone();
            Box::pin(async move {
                low.notify_waiters();
            })
        }))
        .await;

        let state_tx = tx;
        let state_peer = peer_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            let peer = state_peer.clone();
            Box::pin(async move {
                if matches!(
                    state,
                    RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                ) {
                    debug!(event = "webrtc_state_degraded", peer = %peer, ?state, "Peer connection degraded");
                    let _ = tx.send(LinkEvent::Degraded);
                }
            })
        }));

        Arc::new(Self {
            peer_id,
            pc,
            dc,
            drain,
            events: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl DataLink for WebRtcLink {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, frame: Bytes) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::NotOpen);
        }
        self.dc
            .send(&frame)
            .await
            .map(|_| ())
            .map_err(|e| LinkError::Send(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    fn drain_signal(&self) -> Arc<Notify> {
        self.drain.clone()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events.lock().ok().and_then(|mut e| e.take())
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(event = "webrtc_dc_close_failure", peer = %self.peer_id, error = %e, "Data channel close failed");
        }
        if let Err(e) = self.pc.close().await {
            debug!(event = "webrtc_pc_close_failure", peer = %self.peer_id, error = %e, "Peer connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::{ConnectionEvent, ConnectionManager};
    use crate::core::protocol::{ChatMessage, ProtocolMessage};
    use std::time::Duration;

    #[tokio::test]
    async fn loopback_signaler_rejects_duplicate_ids() {
        let signaler = LoopbackSignaler::new();
        let _rx = signaler.register("ALICE1").await.unwrap();
        let err = signaler.register("ALICE1").await.unwrap_err();
        assert_eq!(err, SessionError::UnavailableId("ALICE1".into()));
        signaler.unregister("ALICE1").await;
        assert!(signaler.register("ALICE1").await.is_ok());
    }

    #[tokio::test]
    async fn loopback_signaler_relays_offer_and_answer() {
        let signaler = LoopbackSignaler::new();
        let mut offers = signaler.register("BRUCE2").await.unwrap();
        tokio::spawn(async move {
            if let Some(offer) = offers.recv().await {
                assert_eq!(offer.from, "ALICE1");
                let _ = offer.reply.send(format!("answer-to-{}", offer.sdp));
            }
        });
        let answer = signaler.exchange("ALICE1", "BRUCE2", "offer".into()).await.unwrap();
        assert_eq!(answer, "answer-to-offer");

        let err = signaler.exchange("ALICE1", "ZZZZZZ", "offer".into()).await.unwrap_err();
        assert_eq!(err, SessionError::PeerUnavailable("ZZZZZZ".into()));
    }

    #[tokio::test]
    #[ignore = "needs local UDP networking for ICE"]
    async fn chat_over_real_data_channel() {
        let signaler: Arc<dyn Signaler> = Arc::new(LoopbackSignaler::new());
        let a = ConnectionManager::new(Arc::new(WebRtcTransport::new(signaler.clone())), 5);
        let b = ConnectionManager::new(Arc::new(WebRtcTransport::new(signaler)), 5);
        a.initialize("ALICE1").await.unwrap();
        b.initialize("BRUCE2").await.unwrap();
        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();
        a.connect("BRUCE2").await.unwrap();

        timeout(Duration::from_secs(20), async {
            while let Some(e) = a_rx.recv().await {
                if matches!(e, ConnectionEvent::Connected { .. }) {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let msg = ProtocolMessage::Chat(ChatMessage {
            id: "1".into(),
            text: "over sctp".into(),
            timestamp: 0,
            sender_name: None,
        });
        assert!(a.send("BRUCE2", &msg).await.unwrap());
        let received = timeout(Duration::from_secs(10), async {
            loop {
                if let Some(ConnectionEvent::Message { message, .. }) = b_rx.recv().await {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received, msg);
        a.close().await;
        b.close().await;
    }
}
