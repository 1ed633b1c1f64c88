//! Routes frames received from peers to the component that owns them.
//!
//! A [`PeerInbox`] sits behind the mesh's data notifications: chunk and
//! cancel frames go to the [`ReassemblyEngine`], messages to the
//! [`MessageReceiver`] and delivery confirmations back to the
//! [`Broadcaster`] that sent the message.

use std::fmt::Display;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use meshlink_shared::protocol::PeerMessage;
use meshlink_shared::types::TransferId;
use meshlink_shared::ParticipantId;

use crate::broadcast::{BroadcastResult, Broadcaster, MessageReceiver, ReceiveOutcome, ReceiverEvent};
use crate::reassembly::{FrameOutcome, ReassemblyEngine};

/// What one inbound frame amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum InboxEvent {
    Transfer(FrameOutcome),
    TransferCancelled {
        transfer_id: TransferId,
        /// Whether anything was buffered for it.
        dropped: bool,
    },
    Message(ReceiveOutcome),
    /// `None` when no broadcast was waiting on this confirmation.
    Confirmation(Option<BroadcastResult>),
    /// A well-formed frame this inbox has no use for.
    Unhandled { kind: &'static str },
    Invalid { reason: String },
}

pub struct PeerInbox {
    reassembly: ReassemblyEngine,
    receiver: MessageReceiver,
    broadcaster: Broadcaster,
}

impl PeerInbox {
    pub fn new(
        local: ParticipantId,
        require_confirmation: bool,
    ) -> (Self, mpsc::UnboundedReceiver<ReceiverEvent>) {
        let (receiver, events) = MessageReceiver::new(local);
        let inbox = Self {
            reassembly: ReassemblyEngine::new(),
            receiver,
            broadcaster: Broadcaster::new(require_confirmation),
        };
        (inbox, events)
    }

    pub fn broadcaster(&mut self) -> &mut Broadcaster {
        &mut self.broadcaster
    }

    pub fn reassembly(&mut self) -> &mut ReassemblyEngine {
        &mut self.reassembly
    }

    /// Handle bytes received from `from`. Replies (delivery confirmations)
    /// leave through `send_fn`.
    pub fn handle<F, E>(&mut self, from: &ParticipantId, data: &[u8], send_fn: F) -> InboxEvent
    where
        F: FnMut(&ParticipantId, Vec<u8>) -> std::result::Result<(), E>,
        E: Display,
    {
        let frame = match PeerMessage::from_bytes(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %from, len = data.len(), error = %e, "Undecodable frame");
                return InboxEvent::Invalid {
                    reason: format!("undecodable frame: {e}"),
                };
            }
        };

        match frame {
            PeerMessage::Chunk(chunk) => match self.reassembly.handle_frame(chunk) {
                Ok(outcome) => InboxEvent::Transfer(outcome),
                Err(e) => {
                    warn!(peer = %from, error = %e, "Rejected chunk");
                    InboxEvent::Invalid {
                        reason: e.to_string(),
                    }
                }
            },
            PeerMessage::TransferCancel(cancel) => InboxEvent::TransferCancelled {
                transfer_id: cancel.transfer_id,
                dropped: self.reassembly.handle_cancel(&cancel),
            },
            PeerMessage::Message(_) => {
                InboxEvent::Message(self.receiver.handle_incoming_data(from, data, send_fn))
            }
            PeerMessage::Confirmation(confirmation) => InboxEvent::Confirmation(
                self.broadcaster.handle_delivery_confirmation(&confirmation),
            ),
            other => {
                debug!(peer = %from, kind = other.kind(), "Frame not for the inbox");
                InboxEvent::Unhandled { kind: other.kind() }
            }
        }
    }
}
