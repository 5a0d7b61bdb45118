//! `nwshare demo`: one sender and N receivers in a single process.
//!
//! Every peer gets its own `ConnectionManager` and `TransferCoordinator` over
//! a shared transport, so the whole stack runs exactly as it would between
//! machines. Receivers write into the real file store; each stored artifact
//! is checked against the source's SHA3-256 digest.

use anyhow::{Context, Result, anyhow, bail};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use nwshare::core::config::{SIGNALING_TIMEOUT, TransferSettings};
use nwshare::core::connection::memory::MemoryNetwork;
use nwshare::core::connection::webrtc::{LoopbackSignaler, WebRtcTransport};
use nwshare::core::connection::{ConnectionManager, Transport};
use nwshare::core::coordinator::{OutgoingFile, TransferCoordinator, establish_identity};
use nwshare::core::events::CoreEvent;
use nwshare::core::peer_registry::PeerRegistry;
use nwshare::core::persistence::{FileStore, MemoryStore};
use nwshare::utils::hash::sha3_hex;

struct DemoPeer {
    id: String,
    coordinator: TransferCoordinator,
    events: mpsc::UnboundedReceiver<CoreEvent>,
}

async fn spawn_peer(
    transport: Arc<dyn Transport>,
    store: Arc<dyn FileStore>,
    registry: PeerRegistry,
    settings: TransferSettings,
) -> Result<DemoPeer> {
    let manager = ConnectionManager::new(transport, settings.max_peers);
    let id = establish_identity(&manager, None).await?;
    let coordinator = TransferCoordinator::new(manager, store, registry, settings);
    let events = coordinator.subscribe();
    Ok(DemoPeer {
        id,
        coordinator,
        events,
    })
}

pub async fn run(
    file: &Path,
    receivers: usize,
    webrtc: bool,
    settings: TransferSettings,
    store: Arc<dyn FileStore>,
    downloads: PathBuf,
    peers_file: PathBuf,
) -> Result<()> {
    if receivers == 0 {
        bail!("--peers must be at least 1");
    }
    if receivers > settings.max_peers {
        bail!(
            "--peers {receivers} exceeds max_peers {}",
            settings.max_peers
        );
    }
    let outgoing = OutgoingFile::from_path(file)?;
    let source = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let digest = sha3_hex(&source);

    let transport: Arc<dyn Transport> = if webrtc {
        Arc::new(WebRtcTransport::new(Arc::new(LoopbackSignaler::new())))
    } else {
        Arc::new(MemoryNetwork::new())
    };

    // The sender records every receiver it meets in the on-disk registry.
    let mut sender = spawn_peer(
        transport.clone(),
        Arc::new(MemoryStore::new()),
        PeerRegistry::load(peers_file),
        settings.clone(),
    )
    .await?;
    let mut peers = Vec::with_capacity(receivers);
    for _ in 0..receivers {
        let peer = spawn_peer(
            transport.clone(),
            store.clone(),
            PeerRegistry::in_memory(),
            settings.clone(),
        )
        .await?;
        if settings.auto_download {
            peer.coordinator.set_download_dir(&downloads);
        }
        peers.push(peer);
    }
    info!(
        event = "demo_start",
        sender = %sender.id,
        receivers = receivers,
        transport = if webrtc { "webrtc" } else { "memory" },
        "Demo peers up"
    );

    // ── Connect ──
    let receiver_ids: Vec<String> = peers.iter().map(|p| p.id.clone()).collect();
    for id in &receiver_ids {
        sender.coordinator.manager().connect(id).await?;
    }
    let mut identified = HashSet::new();
    timeout(SIGNALING_TIMEOUT, async {
        while identified.len() < receivers {
            match sender.events.recv().await {
                Some(CoreEvent::PeerIdentified(info)) => {
                    println!("connected to {} ({})", info.id, info.name);
                    identified.insert(info.id);
                }
                Some(_) => {}
                None => break,
            }
        }
    })
    .await
    .map_err(|_| anyhow!("peers did not connect within {SIGNALING_TIMEOUT:?}"))?;

    // ── Send ──
    println!(
        "sending {} ({} bytes, {}) to {} peer(s)",
        outgoing.name, outgoing.size, outgoing.mime, receivers
    );
    let ids = sender.coordinator.send_to_peers(&outgoing, &receiver_ids);
    let targets: HashMap<Uuid, String> = ids.iter().copied().zip(receiver_ids.clone()).collect();

    let mut pending: HashSet<Uuid> = ids.iter().copied().collect();
    let mut failures = 0usize;
    while !pending.is_empty() {
        let Some(event) = sender.events.recv().await else {
            bail!("sender event stream closed");
        };
        match event {
            CoreEvent::TransferProgress {
                transfer_id,
                percent,
            } => {
                if let Some(peer) = targets.get(&transfer_id) {
                    println!("  -> {peer}: {percent:>3}%");
                }
            }
            CoreEvent::TransferComplete { transfer_id, .. } => {
                pending.remove(&transfer_id);
            }
            CoreEvent::TransferFailed {
                transfer_id,
                reason,
                ..
            } => {
                if pending.remove(&transfer_id) {
                    failures += 1;
                    warn!(event = "demo_send_failed", transfer_id = %transfer_id, reason = %reason, "Send failed");
                    println!("  -> {}: FAILED ({reason})", targets.get(&transfer_id).map(String::as_str).unwrap_or("?"));
                }
            }
            _ => {}
        }
    }

    // ── Verify ──
    for (peer, transfer_id) in peers.iter_mut().zip(&ids) {
        let outcome = timeout(SIGNALING_TIMEOUT, async {
            loop {
                match peer.events.recv().await {
                    Some(CoreEvent::TransferComplete { transfer_id: done, .. }) if done == *transfer_id => {
                        return true;
                    }
                    Some(CoreEvent::TransferFailed { transfer_id: done, .. }) if done == *transfer_id => {
                        return false;
                    }
                    Some(_) => {}
                    None => return false,
                }
            }
        })
        .await
        .unwrap_or(false);
        if !outcome {
            failures += 1;
            println!("{}: transfer {transfer_id} did not complete", peer.id);
            continue;
        }

        let loaded = store.load(transfer_id)?;
        match loaded {
            Some((stored, data)) if sha3_hex(&data) == digest => {
                println!(
                    "{}: stored {} ({} bytes) from {}, sha3 ok",
                    peer.id, stored.file_name, stored.file_size, stored.sender_name
                );
            }
            Some((_, data)) => {
                failures += 1;
                println!("{}: sha3 MISMATCH ({} bytes)", peer.id, data.len());
            }
            None => {
                failures += 1;
                println!("{}: nothing stored for {transfer_id}", peer.id);
            }
        }
    }

    // ── Teardown ──
    sender.coordinator.leave(None).await;
    sender.coordinator.shutdown().await;
    for peer in &peers {
        peer.coordinator.shutdown().await;
    }

    if failures > 0 {
        bail!("{failures} transfer(s) failed");
    }
    println!("sha3-256 {digest}");
    Ok(())
}
