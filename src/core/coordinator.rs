//! Transfer Coordinator.
//!
//! Sits on top of the [`ConnectionManager`] and owns every transfer record.
//!
//! Outbound, each file becomes its own task: the [`ChunkProducer`] slices the
//! file, the [`BackpressureGate`] paces the link and the manager carries
//! `METADATA, CHUNK*, END`. Inbound, a single dispatch loop consumes the
//! manager's events in order and feeds the [`AssemblyTable`]; a finished
//! assembly is handed to the [`FileStore`].
//!
//! ```text
//!   send(file, peer) ─► outbound task ─► producer ─► gate ─► manager.send
//!   manager events  ─► dispatch loop ─► assembly table ─► file store
//!                                    └─► CoreEvent bus (observers)
//! ```

use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::core::config::{
    BYE_GRACE_PERIOD, IDENTITY_REGENERATE_LIMIT, IDENTITY_RETRY_DELAY, IDENTITY_RETRY_LIMIT,
    TransferSettings, UNKNOWN_PEER_NAME,
};
use crate::core::connection::{BackpressureGate, ConnectionEvent, ConnectionManager};
use crate::core::error::{CoreError, CoreResult, ErrorKind};
use crate::core::events::{CoreEvent, EventBus};
use crate::core::peer_registry::PeerRegistry;
use crate::core::persistence::{FileStore, StoredFile, export_file};
use crate::core::pipeline::{AssemblyTable, BeginOutcome, ChunkProducer, FileSource, TransferMetadata};
use crate::core::protocol::{ChatMessage, PeerInfo, ProtocolMessage};
use crate::core::transfer::{
    Direction, ProgressThrottle, TransferRecord, TransferStatus, progress_percent,
};
use crate::utils::identity::generate_peer_id;
use crate::utils::sos::SignalOfStop;
use crate::utils::time::now_millis;

/// MIME type used when sniffing finds nothing.
pub const DEFAULT_MIME: &str = "application/octet-stream";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Outgoing file ────────────────────────────────────────────────────────────

/// A file queued for sending, with the descriptor announced in METADATA.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub source: FileSource,
}

impl OutgoingFile {
    /// Describe a file on disk. The MIME type is sniffed from its magic bytes.
    pub fn from_path(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path)
            .map_err(|e| CoreError::Producer(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(CoreError::Producer(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime = infer::get_from_path(path)
            .ok()
            .flatten()
            .map(|t| t.mime_type())
            .unwrap_or(DEFAULT_MIME)
            .to_string();
        Ok(Self {
            name,
            size: meta.len(),
            mime,
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        let mime = infer::get(&data)
            .map(|t| t.mime_type())
            .unwrap_or(DEFAULT_MIME)
            .to_string();
        Self {
            name: name.into(),
            size: data.len() as u64,
            mime,
            source: FileSource::Memory(data),
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = mime.into();
        self
    }
}

// ── Coordinator state ────────────────────────────────────────────────────────

struct Outbound {
    peer_id: String,
    stop: SignalOfStop,
}

#[derive(Default)]
struct Inbound {
    table: AssemblyTable,
    throttles: HashMap<Uuid, ProgressThrottle>,
}

struct Inner {
    manager: ConnectionManager,
    gate: BackpressureGate,
    store: Arc<dyn FileStore>,
    registry: Mutex<PeerRegistry>,
    settings: TransferSettings,
    events: EventBus<CoreEvent>,
    /// Active records only; terminal records are removed.
    transfers: Mutex<HashMap<Uuid, TransferRecord>>,
    outbound: Mutex<HashMap<Uuid, Outbound>>,
    inbound: Mutex<Inbound>,
    /// HANDSHAKE info per connected peer.
    peers: Mutex<HashMap<String, PeerInfo>>,
    download_dir: Mutex<Option<PathBuf>>,
    dropped_frames: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.dispatcher).take() {
            task.abort();
        }
    }
}

/// Cloneable handle; clones share the same transfers.
#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<Inner>,
}

impl TransferCoordinator {
    /// Build a coordinator and start consuming `manager`'s events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        manager: ConnectionManager,
        store: Arc<dyn FileStore>,
        registry: PeerRegistry,
        settings: TransferSettings,
    ) -> Self {
        let events = manager.subscribe();
        let inner = Arc::new(Inner {
            gate: BackpressureGate::new(manager.clone()),
            manager,
            store,
            registry: Mutex::new(registry),
            settings,
            events: EventBus::new(),
            transfers: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(Inbound::default()),
            peers: Mutex::new(HashMap::new()),
            download_dir: Mutex::new(None),
            dropped_frames: AtomicU64::new(0),
            dispatcher: Mutex::new(None),
        });
        let task = tokio::spawn(dispatch_loop(Arc::downgrade(&inner), events));
        *lock(&inner.dispatcher) = Some(task);
        Self { inner }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> Arc<dyn FileStore> {
        self.inner.store.clone()
    }

    /// Where received files are copied when `auto_download` is on.
    pub fn set_download_dir(&self, dir: impl Into<PathBuf>) {
        *lock(&self.inner.download_dir) = Some(dir.into());
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn active_transfers(&self) -> Vec<TransferRecord> {
        lock(&self.inner.transfers).values().cloned().collect()
    }

    pub fn transfer(&self, id: &Uuid) -> Option<TransferRecord> {
        lock(&self.inner.transfers).get(id).cloned()
    }

    /// Incoming transfers between METADATA and END.
    pub fn pending_assemblies(&self) -> usize {
        lock(&self.inner.inbound).table.len()
    }

    /// CHUNK and END frames that matched no assembly.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn peer_info(&self, peer_id: &str) -> Option<PeerInfo> {
        lock(&self.inner.peers).get(peer_id).cloned()
    }

    fn local_info(&self) -> Option<PeerInfo> {
        Some(PeerInfo {
            id: self.inner.manager.self_id()?,
            name: self.inner.settings.display_name.clone(),
            os: std::env::consts::OS.to_string(),
            connected_at: now_millis(),
        })
    }

    // ── Record bookkeeping ───────────────────────────────────────────────────

    fn publish(&self, event: CoreEvent) {
        self.inner.events.publish(event);
    }

    fn set_status(&self, id: Uuid, status: TransferStatus) {
        if let Some(record) = lock(&self.inner.transfers).get_mut(&id) {
            record.status = status;
        }
    }

    fn advance(&self, id: Uuid, percent: u8) {
        if let Some(record) = lock(&self.inner.transfers).get_mut(&id) {
            record.advance(percent);
        }
    }

    fn publish_progress(&self, id: Uuid, percent: u8) {
        self.publish(CoreEvent::TransferProgress {
            transfer_id: id,
            percent,
        });
    }

    fn complete_transfer(&self, id: Uuid) {
        let Some(mut record) = lock(&self.inner.transfers).remove(&id) else {
            return;
        };
        record.status = TransferStatus::Completed;
        self.publish(CoreEvent::TransferComplete {
            transfer_id: id,
            record,
        });
    }

    fn fail_transfer(&self, id: Uuid, reason: String) {
        let Some(mut record) = lock(&self.inner.transfers).remove(&id) else {
            return;
        };
        record.status = TransferStatus::Failed;
        error!(
            event = "transfer_failed",
            transfer_id = %id,
            peer = %record.peer_id,
            direction = ?record.direction,
            progress = record.progress,
            reason = %reason,
            "Transfer failed"
        );
        self.publish(CoreEvent::TransferFailed {
            transfer_id: id,
            reason,
            record,
        });
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Start sending `file` to `peer_id`. Returns the new transfer id at once;
    /// the outcome arrives as `TransferComplete` or `TransferFailed`.
    pub fn send(&self, file: OutgoingFile, peer_id: &str) -> Uuid {
        self.start_outbound(file, peer_id, None)
    }

    /// One independent transfer per peer. More than one peer shares a group id.
    pub fn send_to_peers(&self, file: &OutgoingFile, peers: &[String]) -> Vec<Uuid> {
        let group = (peers.len() > 1).then(Uuid::new_v4);
        peers
            .iter()
            .map(|peer| self.start_outbound(file.clone(), peer, group))
            .collect()
    }

    fn start_outbound(&self, file: OutgoingFile, peer_id: &str, group: Option<Uuid>) -> Uuid {
        let id = Uuid::new_v4();
        let mut record = TransferRecord::new(
            id,
            Direction::Outgoing,
            peer_id,
            &file.name,
            file.size,
            &file.mime,
        );
        record.group_id = group;

        let stop = SignalOfStop::new();
        lock(&self.inner.outbound).insert(
            id,
            Outbound {
                peer_id: peer_id.to_string(),
                stop: stop.clone(),
            },
        );
        lock(&self.inner.transfers).insert(id, record.clone());
        info!(
            event = "transfer_queued",
            transfer_id = %id,
            peer = peer_id,
            file = %file.name,
            size = file.size,
            "Outgoing transfer queued"
        );
        self.publish(CoreEvent::TransferStarted(record));

        let this = self.clone();
        let peer = peer_id.to_string();
        tokio::spawn(async move { this.run_outbound(id, peer, file, stop).await });
        id
    }

    async fn run_outbound(self, id: Uuid, peer_id: String, file: OutgoingFile, stop: SignalOfStop) {
        let started = Instant::now();
        let result = tokio::select! {
            r = self.stream_file(id, &peer_id, file) => r,
            _ = stop.wait() => Err(CoreError::LinkClosed { peer_id: peer_id.clone() }),
        };
        lock(&self.inner.outbound).remove(&id);
        match result {
            Ok(sent) => {
                info!(
                    event = "transfer_sent",
                    transfer_id = %id,
                    peer = %peer_id,
                    bytes = sent,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Transfer sent"
                );
                self.complete_transfer(id);
            }
            Err(e) => self.fail_transfer(id, e.to_string()),
        }
    }

    /// METADATA, every chunk through the gate, then END. Returns bytes sent.
    async fn stream_file(&self, id: Uuid, peer_id: &str, file: OutgoingFile) -> CoreResult<u64> {
        let mut producer = ChunkProducer::spawn();
        let size = producer
            .init(file.source, self.inner.settings.chunk_size, 0)
            .await?;
        if size != file.size {
            warn!(
                event = "file_size_changed",
                transfer_id = %id,
                expected = file.size,
                actual = size,
                "File size changed since it was queued"
            );
        }

        self.deliver(
            peer_id,
            &ProtocolMessage::Metadata {
                transfer_id: id,
                file_name: file.name,
                file_size: size,
                file_type: file.mime,
            },
        )
        .await?;
        self.set_status(id, TransferStatus::InProgress);

        let mut throttle = ProgressThrottle::default();
        let mut sent = 0u64;
        while let Some(chunk) = producer.next().await? {
            self.inner.gate.wait_for_capacity(peer_id).await?;
            let len = chunk.data.len() as u64;
            self.deliver(
                peer_id,
                &ProtocolMessage::Chunk {
                    transfer_id: id,
                    data: chunk.data,
                },
            )
            .await?;
            sent = chunk.offset + len;
            trace!(event = "chunk_sent", transfer_id = %id, offset = chunk.offset, len, "Chunk sent");

            let percent = progress_percent(sent, size);
            self.advance(id, percent);
            if let Some(p) = throttle.update(percent, sent >= size) {
                self.publish_progress(id, p);
            }
        }

        self.inner.gate.wait_for_capacity(peer_id).await?;
        self.deliver(peer_id, &ProtocolMessage::End { transfer_id: id })
            .await?;
        if size == 0 {
            self.advance(id, 100);
            self.publish_progress(id, 100);
        }
        Ok(sent)
    }

    /// Like `manager.send`, but a missing link is an error.
    async fn deliver(&self, peer_id: &str, message: &ProtocolMessage) -> CoreResult<()> {
        if self.inner.manager.send(peer_id, message).await? {
            Ok(())
        } else {
            Err(CoreError::LinkClosed {
                peer_id: peer_id.to_string(),
            })
        }
    }

    // ── Chat and leave ───────────────────────────────────────────────────────

    /// Broadcast a chat line to every open link.
    pub async fn send_chat(&self, text: impl Into<String>) -> CoreResult<ChatMessage> {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            timestamp: now_millis(),
            sender_name: Some(self.inner.settings.display_name.clone()),
        };
        let delivered = self
            .inner
            .manager
            .broadcast(&ProtocolMessage::Chat(message.clone()))
            .await?;
        debug!(event = "chat_sent", id = %message.id, delivered, "Chat sent");
        Ok(message)
    }

    /// Say BYE and close the link to `peer`, or to everyone with `None`.
    ///
    /// Leaving one peer also forgets it; leaving everyone keeps the registry
    /// so the next session can restore the same links.
    pub async fn leave(&self, peer: Option<&str>) {
        let manager = &self.inner.manager;
        match peer {
            Some(peer_id) => {
                if let Err(e) = manager.send(peer_id, &ProtocolMessage::Bye).await {
                    warn!(event = "bye_send_failure", peer = peer_id, error = %e, "Failed to send BYE");
                }
                tokio::time::sleep(BYE_GRACE_PERIOD).await;
                manager.disconnect_peer(peer_id).await;
                lock(&self.inner.registry).remove(peer_id);
                info!(event = "peer_left_local", peer = peer_id, "Left peer");
            }
            None => {
                match manager.broadcast(&ProtocolMessage::Bye).await {
                    Ok(n) => debug!(event = "bye_broadcast", delivered = n, "BYE broadcast"),
                    Err(e) => warn!(event = "bye_send_failure", error = %e, "Failed to broadcast BYE"),
                }
                tokio::time::sleep(BYE_GRACE_PERIOD).await;
                for peer_id in manager.connected_peers() {
                    manager.disconnect_peer(&peer_id).await;
                }
                info!(event = "left_all", "Left every peer");
            }
        }
    }

    /// Dial every recently seen peer that is not connected. Returns how many
    /// dials were started.
    pub async fn restore_peers(&self) -> usize {
        let candidates = lock(&self.inner.registry).reconnect_candidates();
        let mut dialed = 0;
        for candidate in candidates {
            if self.inner.manager.is_connected(&candidate.id) {
                continue;
            }
            match self.inner.manager.connect(&candidate.id).await {
                Ok(()) => dialed += 1,
                Err(e) => warn!(
                    event = "restore_peer_failure",
                    peer = %candidate.id,
                    error = %e,
                    "Could not restore peer"
                ),
            }
        }
        info!(event = "peers_restored", dialed, "Restored recent peers");
        dialed
    }

    /// Cancel outbound transfers, close the manager, and fail whatever was
    /// still in flight in either direction.
    pub async fn shutdown(&self) {
        for (_, outbound) in lock(&self.inner.outbound).iter() {
            outbound.stop.cancel();
        }
        self.inner.manager.close().await;
        if let Some(task) = lock(&self.inner.dispatcher).take() {
            task.abort();
        }

        // The dispatcher is gone, so the close's Disconnected events are never handled.
        let discarded = {
            let mut inbound = lock(&self.inner.inbound);
            let pending = inbound.table.len();
            inbound.table = AssemblyTable::new();
            inbound.throttles.clear();
            pending
        };
        let unfinished: Vec<Uuid> = lock(&self.inner.transfers).keys().copied().collect();
        for id in &unfinished {
            self.fail_transfer(*id, "coordinator shut down".to_string());
        }
        lock(&self.inner.peers).clear();
        info!(
            event = "coordinator_shutdown",
            discarded,
            failed = unfinished.len(),
            "Coordinator shut down"
        );
    }

    // ── Inbound dispatch ─────────────────────────────────────────────────────

    async fn dispatch(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { peer_id } => self.on_link_open(peer_id).await,
            ConnectionEvent::Disconnected { peer_id } => self.on_link_closed(peer_id),
            ConnectionEvent::Message { peer_id, message } => {
                debug!(event = "message_dispatch", peer = %peer_id, kind = message.kind(), "Dispatching message");
                self.on_message(&peer_id, message).await;
            }
            ConnectionEvent::Error {
                peer_id,
                kind,
                detail,
            } => {
                debug!(event = "connection_error", peer = ?peer_id, kind = ?kind, detail = %detail, "Connection error");
                self.publish(CoreEvent::ProtocolError { kind, detail });
            }
        }
    }

    async fn on_link_open(&self, peer_id: String) {
        self.publish(CoreEvent::ConnectionChanged {
            peer_id: peer_id.clone(),
            open: true,
        });
        let Some(peer_info) = self.local_info() else {
            return;
        };
        match self
            .inner
            .manager
            .send(&peer_id, &ProtocolMessage::Handshake { peer_info })
            .await
        {
            Ok(true) => debug!(event = "handshake_sent", peer = %peer_id, "Handshake sent"),
            Ok(false) => debug!(event = "handshake_skipped", peer = %peer_id, "Link gone before handshake"),
            Err(e) => warn!(event = "handshake_send_failure", peer = %peer_id, error = %e, "Failed to send handshake"),
        }
    }

    fn on_link_closed(&self, peer_id: String) {
        for outbound in lock(&self.inner.outbound).values() {
            if outbound.peer_id == peer_id {
                outbound.stop.cancel();
            }
        }

        let discarded = {
            let mut inbound = lock(&self.inner.inbound);
            let ids = inbound.table.discard_peer(&peer_id);
            for id in &ids {
                inbound.throttles.remove(id);
            }
            ids
        };
        if !discarded.is_empty() {
            warn!(
                event = "assemblies_discarded",
                peer = %peer_id,
                count = discarded.len(),
                "Link closed mid-transfer"
            );
        }
        for id in discarded {
            self.fail_transfer(id, format!("link to '{peer_id}' closed"));
        }

        lock(&self.inner.peers).remove(&peer_id);
        self.publish(CoreEvent::ConnectionChanged {
            peer_id,
            open: false,
        });
    }

    async fn on_message(&self, peer_id: &str, message: ProtocolMessage) {
        match message {
            ProtocolMessage::Handshake { peer_info } => self.on_handshake(peer_id, peer_info),
            ProtocolMessage::Metadata {
                transfer_id,
                file_name,
                file_size,
                file_type,
            } => self.on_metadata(
                peer_id,
                transfer_id,
                TransferMetadata {
                    file_name,
                    file_size,
                    file_type,
                },
            ),
            ProtocolMessage::Chunk { transfer_id, data } => {
                self.on_chunk(peer_id, transfer_id, data)
            }
            ProtocolMessage::End { transfer_id } => self.on_end(peer_id, transfer_id).await,
            ProtocolMessage::Chat(message) => {
                self.publish(CoreEvent::ChatReceived {
                    peer_id: peer_id.to_string(),
                    message,
                });
            }
            ProtocolMessage::Bye => self.on_bye(peer_id).await,
        }
    }

    fn on_handshake(&self, peer_id: &str, info: PeerInfo) {
        if info.id != peer_id {
            warn!(
                event = "handshake_id_mismatch",
                peer = peer_id,
                claimed = %info.id,
                "Handshake id differs from link id"
            );
        }
        // The link id is authoritative.
        let info = PeerInfo {
            id: peer_id.to_string(),
            ..info
        };
        lock(&self.inner.registry).peer_seen(peer_id, &info.name);
        lock(&self.inner.peers).insert(peer_id.to_string(), info.clone());
        info!(event = "peer_identified", peer = peer_id, name = %info.name, os = %info.os, "Peer identified");
        self.publish(CoreEvent::PeerIdentified(info));
    }

    fn on_metadata(&self, peer_id: &str, id: Uuid, metadata: TransferMetadata) {
        let mut record = TransferRecord::new(
            id,
            Direction::Incoming,
            peer_id,
            &metadata.file_name,
            metadata.file_size,
            &metadata.file_type,
        );
        record.status = TransferStatus::InProgress;

        let outcome = {
            let mut inbound = lock(&self.inner.inbound);
            let outcome = inbound.table.begin(id, peer_id, metadata);
            if !matches!(outcome, BeginOutcome::Refused { .. }) {
                inbound.throttles.insert(id, ProgressThrottle::default());
            }
            outcome
        };
        match outcome {
            BeginOutcome::Started => {}
            BeginOutcome::Restarted => {
                warn!(event = "duplicate_metadata", transfer_id = %id, peer = peer_id, "METADATA repeated; restarting assembly");
            }
            BeginOutcome::Refused { owner } => {
                warn!(
                    event = "duplicate_metadata",
                    transfer_id = %id,
                    peer = peer_id,
                    owner = %owner,
                    "METADATA reuses an id owned by another peer; ignored"
                );
                self.drop_frame("METADATA", peer_id, id);
                return;
            }
        }
        info!(
            event = "transfer_incoming",
            transfer_id = %id,
            peer = peer_id,
            file = %record.file_name,
            size = record.file_size,
            "Incoming transfer"
        );
        lock(&self.inner.transfers).insert(id, record.clone());
        self.publish(CoreEvent::TransferStarted(record));
    }

    fn on_chunk(&self, peer_id: &str, id: Uuid, data: Bytes) {
        let len = data.len();
        let appended = {
            let mut inbound = lock(&self.inner.inbound);
            let Inbound { table, throttles } = &mut *inbound;
            table.append(&id, peer_id, data).map(|progress| {
                let percent = progress_percent(progress.received, progress.declared);
                let emit = throttles
                    .entry(id)
                    .or_default()
                    .update(percent, false);
                (percent, emit)
            })
        };
        let Some((percent, emit)) = appended else {
            self.drop_frame("CHUNK", peer_id, id);
            return;
        };
        trace!(event = "chunk_received", transfer_id = %id, len, percent, "Chunk received");
        self.advance(id, percent);
        if let Some(p) = emit {
            self.publish_progress(id, p);
        }
    }

    async fn on_end(&self, peer_id: &str, id: Uuid) {
        let finished = {
            let mut inbound = lock(&self.inner.inbound);
            let throttle = inbound.throttles.remove(&id);
            inbound
                .table
                .finish(&id, peer_id)
                .map(|done| (done, throttle.unwrap_or_default()))
        };
        let Some((done, mut throttle)) = finished else {
            self.drop_frame("END", peer_id, id);
            return;
        };

        let received = done.data.len() as u64;
        if received != done.metadata.file_size {
            warn!(
                event = "size_mismatch",
                transfer_id = %id,
                declared = done.metadata.file_size,
                received,
                "Received size differs from METADATA"
            );
        }
        let percent = progress_percent(received, done.metadata.file_size);
        self.advance(id, percent);
        if let Some(p) = throttle.update(percent, true) {
            self.publish_progress(id, p);
        }

        let sender_name = lock(&self.inner.peers)
            .get(peer_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| UNKNOWN_PEER_NAME.to_string());
        let stored = StoredFile::new(
            id,
            &done.metadata.file_name,
            received,
            &done.metadata.file_type,
            sender_name,
            peer_id,
            now_millis(),
        );

        let store = self.inner.store.clone();
        let data = done.data.clone();
        let record = stored.clone();
        let saved = tokio::task::spawn_blocking(move || store.save(&record, &data)).await;
        let outcome = match saved {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(e) => Err(e.to_string()),
        };
        match outcome {
            Ok(()) => {
                info!(
                    event = "transfer_received",
                    transfer_id = %id,
                    peer = peer_id,
                    bytes = received,
                    elapsed_ms = done.elapsed.as_millis() as u64,
                    "Transfer received"
                );
                self.auto_export(stored, done.data).await;
                self.complete_transfer(id);
            }
            Err(detail) => {
                self.publish(CoreEvent::ProtocolError {
                    kind: ErrorKind::Storage,
                    detail: detail.clone(),
                });
                self.fail_transfer(id, detail);
            }
        }
    }

    async fn auto_export(&self, file: StoredFile, data: Bytes) {
        if !self.inner.settings.auto_download {
            return;
        }
        let Some(dir) = lock(&self.inner.download_dir).clone() else {
            return;
        };
        let id = file.id;
        let exported = tokio::task::spawn_blocking(move || export_file(&dir, &file, &data)).await;
        match exported {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(event = "auto_download_failure", id = %id, error = %e, "Auto download failed"),
            Err(e) => warn!(event = "auto_download_failure", id = %id, error = %e, "Auto download task failed"),
        }
    }

    async fn on_bye(&self, peer_id: &str) {
        info!(event = "peer_bye", peer = peer_id, "Peer said goodbye");
        lock(&self.inner.registry).remove(peer_id);
        self.publish(CoreEvent::PeerLeft {
            peer_id: peer_id.to_string(),
        });
        self.inner.manager.disconnect_peer(peer_id).await;
    }

    fn drop_frame(&self, kind: &'static str, peer_id: &str, id: Uuid) {
        self.inner.dropped_frames.fetch_add(1, Ordering::Relaxed);
        trace!(event = "frame_dropped", kind, peer = peer_id, transfer_id = %id, "No assembly for frame");
    }
}

async fn dispatch_loop(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        TransferCoordinator { inner }.dispatch(event).await;
    }
    trace!(event = "dispatch_stopped", "Coordinator dispatch loop stopped");
}

// ── Identity ─────────────────────────────────────────────────────────────────

/// Open `manager`'s session under `preferred` (or a fresh id), retrying on
/// identity collisions. Returns the id in use.
pub async fn establish_identity(
    manager: &ConnectionManager,
    preferred: Option<&str>,
) -> CoreResult<String> {
    establish_identity_with_delay(manager, preferred, IDENTITY_RETRY_DELAY).await
}

async fn establish_identity_with_delay(
    manager: &ConnectionManager,
    preferred: Option<&str>,
    retry_delay: Duration,
) -> CoreResult<String> {
    let mut candidate = preferred
        .map(str::to_string)
        .unwrap_or_else(generate_peer_id);

    for round in 0..=IDENTITY_REGENERATE_LIMIT {
        if round > 0 {
            candidate = generate_peer_id();
            info!(event = "identity_regenerated", id = %candidate, "Trying a fresh identity");
        }
        for attempt in 0..=IDENTITY_RETRY_LIMIT {
            match manager.initialize(&candidate).await {
                Ok(()) => return Ok(candidate),
                Err(e) if e.is_identity_conflict() => {
                    warn!(event = "identity_conflict", id = %candidate, attempt, "Identity unavailable");
                    if attempt < IDENTITY_RETRY_LIMIT {
                        tokio::time::sleep(retry_delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
    Err(CoreError::IdentityConflict { id: candidate })
}
