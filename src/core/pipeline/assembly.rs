//! Incoming Assembly Table.
//!
//! Receiver-side accumulation of in-flight transfers, keyed by transfer id.
//! An entry exists from METADATA until END; CHUNK and END for an id with no
//! entry (or from a different peer) find nothing and are left to the caller
//! to drop. Segments are kept in arrival order and concatenated once.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// File descriptor announced by METADATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMetadata {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
}

#[derive(Debug)]
struct IncomingAssembly {
    pub peer_id: String,
    pub metadata: TransferMetadata,
    segments: Vec<Bytes>,
    received: u64,
    started_at: Instant,
}

/// Result of [`AssemblyTable::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    Started,
    /// The same peer announced the id again; its old entry was reset.
    Restarted,
    /// The id is being assembled for another peer, which keeps it.
    Refused { owner: String },
}

/// Running totals after an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendProgress {
    pub received: u64,
    pub declared: u64,
}

/// A finished artifact handed back by [`AssemblyTable::finish`].
#[derive(Debug)]
pub struct CompletedAssembly {
    pub peer_id: String,
    pub metadata: TransferMetadata,
    pub data: Bytes,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct AssemblyTable {
    entries: HashMap<Uuid, IncomingAssembly>,
}

impl AssemblyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accumulating `transfer_id` for `peer_id`. An entry owned by
    /// another peer is left untouched.
    pub fn begin(&mut self, transfer_id: Uuid, peer_id: &str, metadata: TransferMetadata) -> BeginOutcome {
        let outcome = match self.entries.get(&transfer_id) {
            Some(existing) if existing.peer_id != peer_id => {
                return BeginOutcome::Refused {
                    owner: existing.peer_id.clone(),
                };
            }
            Some(_) => BeginOutcome::Restarted,
            None => BeginOutcome::Started,
        };
        self.entries.insert(
            transfer_id,
            IncomingAssembly {
                peer_id: peer_id.to_string(),
                metadata,
                segments: Vec::new(),
                received: 0,
                started_at: Instant::now(),
            },
        );
        outcome
    }

    fn entry_mut(&mut self, transfer_id: &Uuid, peer_id: &str) -> Option<&mut IncomingAssembly> {
        self.entries
            .get_mut(transfer_id)
            .filter(|a| a.peer_id == peer_id)
    }

    /// Append a segment. `None` when no matching assembly exists.
    pub fn append(&mut self, transfer_id: &Uuid, peer_id: &str, data: Bytes) -> Option<AppendProgress> {
        let assembly = self.entry_mut(transfer_id, peer_id)?;
        assembly.received += data.len() as u64;
        assembly.segments.push(data);
        Some(AppendProgress {
            received: assembly.received,
            declared: assembly.metadata.file_size,
        })
    }

    /// Remove the assembly and join its segments. `None` when no matching assembly exists.
    pub fn finish(&mut self, transfer_id: &Uuid, peer_id: &str) -> Option<CompletedAssembly> {
        self.entry_mut(transfer_id, peer_id)?;
        let assembly = self.entries.remove(transfer_id)?;
        let data = match assembly.segments.len() {
            0 => Bytes::new(),
            1 => assembly.segments.into_iter().next().unwrap_or_default(),
            _ => {
                let mut buf = BytesMut::with_capacity(assembly.received as usize);
                for segment in &assembly.segments {
                    buf.extend_from_slice(segment);
                }
                buf.freeze()
            }
        };
        Some(CompletedAssembly {
            peer_id: assembly.peer_id,
            metadata: assembly.metadata,
            data,
            elapsed: assembly.started_at.elapsed(),
        })
    }

    /// Drop every assembly fed by `peer_id`; returns their ids.
    pub fn discard_peer(&mut self, peer_id: &str) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, a)| a.peer_id == peer_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.entries.remove(id);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(size: u64) -> TransferMetadata {
        TransferMetadata {
            file_name: "notes.txt".into(),
            file_size: size,
            file_type: "text/plain".into(),
        }
    }

    #[test]
    fn segments_join_in_arrival_order() {
        let mut table = AssemblyTable::new();
        let id = Uuid::new_v4();
        assert_eq!(table.begin(id, "ALICE1", meta(11)), BeginOutcome::Started);
        assert_eq!(
            table.append(&id, "ALICE1", Bytes::from_static(b"hello ")),
            Some(AppendProgress { received: 6, declared: 11 })
        );
        table.append(&id, "ALICE1", Bytes::from_static(b"world"));
        let done = table.finish(&id, "ALICE1").unwrap();
        assert_eq!(&done.data[..], b"hello world");
        assert_eq!(done.metadata, meta(11));
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_ids_find_nothing() {
        let mut table = AssemblyTable::new();
        let id = Uuid::new_v4();
        assert!(table.append(&id, "ALICE1", Bytes::from_static(b"x")).is_none());
        assert!(table.finish(&id, "ALICE1").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn other_peers_cannot_touch_an_assembly() {
        let mut table = AssemblyTable::new();
        let id = Uuid::new_v4();
        table.begin(id, "ALICE1", meta(3));
        assert!(table.append(&id, "BRUCE2", Bytes::from_static(b"zzz")).is_none());
        assert!(table.finish(&id, "BRUCE2").is_none());
        assert_eq!(table.finish(&id, "ALICE1").unwrap().data.len(), 0);
    }

    #[test]
    fn foreign_metadata_does_not_take_over_an_id() {
        let mut table = AssemblyTable::new();
        let id = Uuid::new_v4();
        table.begin(id, "ALICE1", meta(2));
        table.append(&id, "ALICE1", Bytes::from_static(b"ab"));
        assert_eq!(
            table.begin(id, "BRUCE2", meta(9)),
            BeginOutcome::Refused { owner: "ALICE1".into() }
        );
        let done = table.finish(&id, "ALICE1").unwrap();
        assert_eq!(&done.data[..], b"ab");
        assert_eq!(done.metadata, meta(2));
    }

    #[test]
    fn discard_peer_only_drops_its_entries() {
        let mut table = AssemblyTable::new();
        let a1 = Uuid::new_v4();
        let a2 = Uuid::new_v4();
        let b1 = Uuid::new_v4();
        table.begin(a1, "ALICE1", meta(1));
        table.begin(a2, "ALICE1", meta(1));
        table.begin(b1, "BRUCE2", meta(1));

        let mut dropped = table.discard_peer("ALICE1");
        dropped.sort();
        let mut expected = vec![a1, a2];
        expected.sort();
        assert_eq!(dropped, expected);
        assert_eq!(table.len(), 1);
        assert!(table.finish(&b1, "BRUCE2").is_some());
    }

    #[test]
    fn empty_transfer_completes_with_no_bytes() {
        let mut table = AssemblyTable::new();
        let id = Uuid::new_v4();
        table.begin(id, "ALICE1", meta(0));
        let done = table.finish(&id, "ALICE1").unwrap();
        assert!(done.data.is_empty());
    }

    #[test]
    fn duplicate_begin_reports_replacement() {
        let mut table = AssemblyTable::new();
        let id = Uuid::new_v4();
        table.begin(id, "ALICE1", meta(5));
        table.append(&id, "ALICE1", Bytes::from_static(b"ab"));
        assert_eq!(table.begin(id, "ALICE1", meta(5)), BeginOutcome::Restarted);
        assert_eq!(
            table.append(&id, "ALICE1", Bytes::from_static(b"c")),
            Some(AppendProgress { received: 1, declared: 5 })
        );
    }
}
