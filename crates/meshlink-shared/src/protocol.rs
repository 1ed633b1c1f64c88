use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{MessageId, ParticipantId, TransferId};

// ---------------------------------------------------------------------------
// Signaling payloads (exchanged through the relay, opaque to the store)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum SignalKind {
    /// Session description offered by the initiator
    Offer(String),
    /// Session description answered by the responder
    Answer(String),
    /// Transport candidate (trickled after the offer/answer)
    Candidate(String),
}

impl SignalKind {
    pub fn name(&self) -> &'static str {
        match self {
            SignalKind::Offer(_) => "offer",
            SignalKind::Answer(_) => "answer",
            SignalKind::Candidate(_) => "candidate",
        }
    }
}

/// A handshake artifact for one link attempt.
///
/// `link_id` identifies the initiator's attempt and is echoed by the
/// responder, so signals from a torn-down attempt can be told apart from the
/// current one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalMessage {
    pub link_id: Uuid,
    pub kind: SignalKind,
}

impl SignalMessage {
    pub fn new(link_id: Uuid, kind: SignalKind) -> Self {
        Self { link_id, kind }
    }
}

// ---------------------------------------------------------------------------
// Peer-to-peer wire protocol (sent directly over established links)
// ---------------------------------------------------------------------------

/// All frames exchanged between connected peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    /// One chunk of a file transfer
    Chunk(ChunkFrame),

    /// Sender aborted a transfer
    TransferCancel(TransferCancel),

    /// Broadcast chat/structured message
    Message(Message),

    /// Delivery confirmation for a message that asked for one
    Confirmation(DeliveryConfirmation),

    /// Host-side roster of linked participants
    Roster(RosterUpdate),
}

/// A chunk together with the metadata of the transfer it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkFrame {
    pub transfer_id: TransferId,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub payload: Vec<u8>,
    /// Checksum of `payload`, when the sender has checksums enabled
    pub checksum: Option<String>,
    /// Checksum of the whole file, when the sender has checksums enabled
    pub file_checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferCancel {
    pub transfer_id: TransferId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MessageBody {
    Text(String),
    /// Serialized JSON document
    Json(String),
}

impl MessageBody {
    pub fn len(&self) -> usize {
        match self {
            MessageBody::Text(s) | MessageBody::Json(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub sender: ParticipantId,
    pub timestamp: DateTime<Utc>,
    pub body: MessageBody,
    pub requires_confirmation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryConfirmation {
    pub message_id: MessageId,
    pub recipient: ParticipantId,
    pub success: bool,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterUpdate {
    pub host: ParticipantId,
    pub participants: Vec<ParticipantId>,
}

impl PeerMessage {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Chunk(_) => "chunk",
            PeerMessage::TransferCancel(_) => "transfer-cancel",
            PeerMessage::Message(_) => "message",
            PeerMessage::Confirmation(_) => "confirmation",
            PeerMessage::Roster(_) => "roster",
        }
    }
}
