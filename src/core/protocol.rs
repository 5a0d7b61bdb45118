//! Wire protocol exchanged over an open peer link.
//!
//! Every message travels as one binary frame:
//!
//!   [1 byte: frame_type] [N bytes: payload]
//!
//! Frame types:
//!   0x01 = Control (JSON-encoded `ProtocolMessage`, tagged by `type`)
//!   0x02 = Chunk   (16 bytes transfer id + raw segment)
//!
//! Chunk payloads skip JSON entirely. There is no sequence number or
//! checksum: ordering and integrity come from the reliable, ordered link.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{CoreError, CoreResult};

pub const FRAME_CONTROL: u8 = 0x01;
pub const FRAME_CHUNK: u8 = 0x02;

/// Bytes a chunk frame adds on top of its payload.
pub const CHUNK_FRAME_OVERHEAD: usize = 1 + 16;

/// Identity advertised by a peer right after its link opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub os: String,
    /// Unix milliseconds.
    pub connected_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    /// Unix milliseconds.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ProtocolMessage {
    Handshake {
        peer_info: PeerInfo,
    },
    Metadata {
        transfer_id: Uuid,
        file_name: String,
        file_size: u64,
        file_type: String,
    },
    /// Carried in a binary chunk frame, never as JSON.
    #[serde(skip)]
    Chunk {
        transfer_id: Uuid,
        data: Bytes,
    },
    End {
        transfer_id: Uuid,
    },
    Chat(ChatMessage),
    Bye,
}

impl ProtocolMessage {
    /// Short tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Handshake { .. } => "HANDSHAKE",
            ProtocolMessage::Metadata { .. } => "METADATA",
            ProtocolMessage::Chunk { .. } => "CHUNK",
            ProtocolMessage::End { .. } => "END",
            ProtocolMessage::Chat(_) => "CHAT",
            ProtocolMessage::Bye => "BYE",
        }
    }

    pub fn encode(&self) -> CoreResult<Bytes> {
        match self {
            ProtocolMessage::Chunk { transfer_id, data } => {
                Ok(encode_chunk_frame(*transfer_id, data))
            }
            control => {
                let json = serde_json::to_vec(control)
                    .map_err(|e| CoreError::MalformedFrame(e.to_string()))?;
                let mut buf = BytesMut::with_capacity(1 + json.len());
                buf.put_u8(FRAME_CONTROL);
                buf.extend_from_slice(&json);
                Ok(buf.freeze())
            }
        }
    }

    /// Decode one frame. Chunk payloads are sliced out of `frame` without copying.
    pub fn decode(frame: Bytes) -> CoreResult<Self> {
        let Some(&frame_type) = frame.first() else {
            return Err(CoreError::MalformedFrame("empty frame".into()));
        };
        match frame_type {
            FRAME_CONTROL => serde_json::from_slice(&frame[1..])
                .map_err(|e| CoreError::MalformedFrame(e.to_string())),
            FRAME_CHUNK => {
                if frame.len() < CHUNK_FRAME_OVERHEAD {
                    return Err(CoreError::MalformedFrame(format!(
                        "chunk frame too short: {} bytes",
                        frame.len()
                    )));
                }
                let transfer_id = Uuid::from_slice(&frame[1..CHUNK_FRAME_OVERHEAD])
                    .map_err(|e| CoreError::MalformedFrame(e.to_string()))?;
                Ok(ProtocolMessage::Chunk {
                    transfer_id,
                    data: frame.slice(CHUNK_FRAME_OVERHEAD..),
                })
            }
            other => Err(CoreError::MalformedFrame(format!(
                "unknown frame type 0x{other:02x}"
            ))),
        }
    }
}

/// [0x02][16 bytes transfer id][payload]
fn encode_chunk_frame(transfer_id: Uuid, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHUNK_FRAME_OVERHEAD + payload.len());
    buf.put_u8(FRAME_CHUNK);
    buf.extend_from_slice(transfer_id.as_bytes());
    buf.extend_from_slice(payload);
    buf.freeze()
}
