//! One-to-many text and JSON messages with optional delivery confirmations.
//!
//! A delivery counts as successful when the local send call accepted it.
//! Recipients that also owe a confirmation stay pending until it arrives.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use meshlink_shared::constants::{CONFIRMATION_TIMEOUT_SECS, MAX_MESSAGE_SIZE};
use meshlink_shared::protocol::{DeliveryConfirmation, Message, MessageBody, PeerMessage};
use meshlink_shared::types::MessageId;
use meshlink_shared::ParticipantId;

use crate::error::{Result, TransferError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastResult {
    pub message_id: MessageId,
    pub total_recipients: usize,
    pub successful_deliveries: usize,
    pub failed_deliveries: usize,
    pub pending_confirmations: usize,
}

struct PendingBroadcast {
    result: BroadcastResult,
    awaiting: HashSet<ParticipantId>,
    sent_at: Instant,
}

/// Sending half. Keeps the aggregate of every broadcast still waiting for
/// confirmations, until they arrive or the confirmation timeout passes.
pub struct Broadcaster {
    require_confirmation: bool,
    confirmation_timeout: Duration,
    pending: HashMap<MessageId, PendingBroadcast>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Broadcaster {
    pub fn new(require_confirmation: bool) -> Self {
        Self {
            require_confirmation,
            confirmation_timeout: Duration::from_secs(CONFIRMATION_TIMEOUT_SECS),
            pending: HashMap::new(),
        }
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// Settle broadcasts whose confirmation timeout passed: recipients that
    /// never confirmed count as failed deliveries. Returns the final
    /// aggregates. Also runs before every new broadcast.
    pub fn expire_confirmations(&mut self) -> Vec<BroadcastResult> {
        let timeout = self.confirmation_timeout;
        let expired: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.sent_at.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut settled = Vec::with_capacity(expired.len());
        for id in expired {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            let mut result = pending.result;
            let missing = pending.awaiting.len();
            result.successful_deliveries -= missing;
            result.failed_deliveries += missing;
            result.pending_confirmations = 0;
            warn!(message = %id.0, missing, "Confirmations timed out");
            settled.push(result);
        }
        settled
    }

    pub fn broadcast_text_message<F, E>(
        &mut self,
        text: &str,
        recipients: &[ParticipantId],
        sender: &ParticipantId,
        send_fn: F,
    ) -> Result<BroadcastResult>
    where
        F: FnMut(&ParticipantId, Vec<u8>) -> std::result::Result<(), E>,
        E: Display,
    {
        self.broadcast(MessageBody::Text(text.to_string()), recipients, sender, send_fn)
    }

    /// Broadcast a structured document, sent as serialized JSON.
    pub fn broadcast_message<F, E>(
        &mut self,
        value: &serde_json::Value,
        recipients: &[ParticipantId],
        sender: &ParticipantId,
        send_fn: F,
    ) -> Result<BroadcastResult>
    where
        F: FnMut(&ParticipantId, Vec<u8>) -> std::result::Result<(), E>,
        E: Display,
    {
        let json = serde_json::to_string(value)?;
        self.broadcast(MessageBody::Json(json), recipients, sender, send_fn)
    }

    fn broadcast<F, E>(
        &mut self,
        body: MessageBody,
        recipients: &[ParticipantId],
        sender: &ParticipantId,
        mut send_fn: F,
    ) -> Result<BroadcastResult>
    where
        F: FnMut(&ParticipantId, Vec<u8>) -> std::result::Result<(), E>,
        E: Display,
    {
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(TransferError::Validation(format!(
                "message of {} bytes exceeds {MAX_MESSAGE_SIZE}",
                body.len()
            )));
        }
        self.expire_confirmations();

        let message = Message {
            id: MessageId::new(),
            sender: sender.clone(),
            timestamp: Utc::now(),
            body,
            requires_confirmation: self.require_confirmation,
        };
        let payload = PeerMessage::Message(message.clone()).to_bytes()?;

        let mut result = BroadcastResult {
            message_id: message.id,
            total_recipients: recipients.len(),
            successful_deliveries: 0,
            failed_deliveries: 0,
            pending_confirmations: 0,
        };
        let mut awaiting = HashSet::new();

        for recipient in recipients {
            match send_fn(recipient, payload.clone()) {
                Ok(()) => {
                    result.successful_deliveries += 1;
                    if message.requires_confirmation {
                        awaiting.insert(recipient.clone());
                    }
                }
                Err(e) => {
                    warn!(message = %message.id.0, peer = %recipient, "Delivery failed: {e}");
                    result.failed_deliveries += 1;
                }
            }
        }
        result.pending_confirmations = awaiting.len();

        info!(
            message = %message.id.0,
            recipients = result.total_recipients,
            delivered = result.successful_deliveries,
            failed = result.failed_deliveries,
            "Message broadcast"
        );

        if !awaiting.is_empty() {
            self.pending.insert(
                message.id,
                PendingBroadcast {
                    result: result.clone(),
                    awaiting,
                    sent_at: Instant::now(),
                },
            );
        }
        Ok(result)
    }

    /// Fold a recipient's confirmation into its broadcast's aggregate.
    ///
    /// Returns the updated aggregate, or `None` for messages (or recipients)
    /// nothing is waiting on. A negative confirmation turns the delivery into
    /// a failure. The broadcast is forgotten once nothing is pending.
    pub fn handle_delivery_confirmation(
        &mut self,
        confirmation: &DeliveryConfirmation,
    ) -> Option<BroadcastResult> {
        let pending = self.pending.get_mut(&confirmation.message_id)?;
        if !pending.awaiting.remove(&confirmation.recipient) {
            debug!(
                message = %confirmation.message_id.0,
                peer = %confirmation.recipient,
                "Unexpected confirmation"
            );
            return None;
        }

        let result = &mut pending.result;
        result.pending_confirmations = pending.awaiting.len();
        if !confirmation.success {
            result.successful_deliveries -= 1;
            result.failed_deliveries += 1;
        }
        let result = result.clone();

        if pending.awaiting.is_empty() {
            self.pending.remove(&confirmation.message_id);
        }
        Some(result)
    }

    /// Current aggregate of a broadcast still waiting for confirmations.
    pub fn result(&self, message_id: &MessageId) -> Option<&BroadcastResult> {
        self.pending.get(message_id).map(|p| &p.result)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    Received(Message),
    /// The payload was not a valid message. `raw` is kept for diagnostics.
    Invalid { raw: Vec<u8>, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    Received { from: ParticipantId, message: Message },
    Invalid { from: ParticipantId, reason: String },
}

/// Receiving half. Validates inbound messages and answers confirmation
/// requests.
pub struct MessageReceiver {
    local: ParticipantId,
    events: mpsc::UnboundedSender<ReceiverEvent>,
}

impl MessageReceiver {
    pub fn new(local: ParticipantId) -> (Self, mpsc::UnboundedReceiver<ReceiverEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { local, events }, rx)
    }

    pub fn handle_incoming_data<F, E>(
        &self,
        from: &ParticipantId,
        data: &[u8],
        mut send_fn: F,
    ) -> ReceiveOutcome
    where
        F: FnMut(&ParticipantId, Vec<u8>) -> std::result::Result<(), E>,
        E: Display,
    {
        let message = match Self::parse(data) {
            Ok(message) => message,
            Err(reason) => {
                warn!(peer = %from, len = data.len(), %reason, "Invalid message");
                let _ = self.events.send(ReceiverEvent::Invalid {
                    from: from.clone(),
                    reason: reason.clone(),
                });
                return ReceiveOutcome::Invalid {
                    raw: data.to_vec(),
                    reason,
                };
            }
        };

        debug!(peer = %from, message = %message.id.0, "Message received");
        if message.requires_confirmation {
            let confirmation = PeerMessage::Confirmation(DeliveryConfirmation {
                message_id: message.id,
                recipient: self.local.clone(),
                success: true,
                received_at: Utc::now(),
            });
            match confirmation.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = send_fn(from, bytes) {
                        warn!(peer = %from, message = %message.id.0, "Failed to confirm delivery: {e}");
                    }
                }
                Err(e) => warn!("Failed to encode confirmation: {e}"),
            }
        }

        let _ = self.events.send(ReceiverEvent::Received {
            from: from.clone(),
            message: message.clone(),
        });
        ReceiveOutcome::Received(message)
    }

    fn parse(data: &[u8]) -> std::result::Result<Message, String> {
        let frame = PeerMessage::from_bytes(data).map_err(|e| format!("undecodable frame: {e}"))?;
        let message = match frame {
            PeerMessage::Message(message) => message,
            other => return Err(format!("expected a message, got {}", other.kind())),
        };

        if message.sender.as_str().is_empty() {
            return Err("message without sender".into());
        }
        if message.body.len() > MAX_MESSAGE_SIZE {
            return Err(format!(
                "message of {} bytes exceeds {MAX_MESSAGE_SIZE}",
                message.body.len()
            ));
        }
        if let MessageBody::Json(json) = &message.body {
            serde_json::from_str::<serde_json::Value>(json)
                .map_err(|e| format!("malformed JSON body: {e}"))?;
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<ParticipantId> {
        names.iter().map(|n| ParticipantId::from(*n)).collect()
    }

    #[test]
    fn test_one_failed_send_of_three() {
        let mut broadcaster = Broadcaster::default();
        let recipients = ids(&["alice", "bob", "carol"]);
        let mut sent = Vec::new();

        let result = broadcaster
            .broadcast_text_message("hello", &recipients, &ParticipantId::from("host"), |to, bytes| {
                if to.as_str() == "bob" {
                    return Err("link closed");
                }
                sent.push((to.clone(), bytes));
                Ok(())
            })
            .unwrap();

        assert_eq!(result.total_recipients, 3);
        assert_eq!(result.successful_deliveries, 2);
        assert_eq!(result.failed_deliveries, 1);
        assert_eq!(result.pending_confirmations, 0);
        assert_eq!(sent.len(), 2);
        assert!(broadcaster.result(&result.message_id).is_none());
    }

    #[test]
    fn test_confirmations_settle_pending() {
        let mut broadcaster = Broadcaster::new(true);
        let recipients = ids(&["alice", "bob"]);
        let result = broadcaster
            .broadcast_text_message("ping", &recipients, &ParticipantId::from("host"), |_, _| {
                Ok::<_, TransferError>(())
            })
            .unwrap();
        assert_eq!(result.pending_confirmations, 2);

        let confirm = |who: &str, success: bool| DeliveryConfirmation {
            message_id: result.message_id,
            recipient: ParticipantId::from(who),
            success,
            received_at: Utc::now(),
        };

        let after_alice = broadcaster.handle_delivery_confirmation(&confirm("alice", true)).unwrap();
        assert_eq!(after_alice.pending_confirmations, 1);
        assert_eq!(after_alice.successful_deliveries, 2);

        // Repeated confirmation is not counted twice.
        assert!(broadcaster.handle_delivery_confirmation(&confirm("alice", true)).is_none());

        let after_bob = broadcaster.handle_delivery_confirmation(&confirm("bob", false)).unwrap();
        assert_eq!(after_bob.pending_confirmations, 0);
        assert_eq!(after_bob.successful_deliveries, 1);
        assert_eq!(after_bob.failed_deliveries, 1);
        assert!(broadcaster.result(&result.message_id).is_none());
    }

    #[test]
    fn test_unconfirmed_recipients_time_out() {
        let mut broadcaster = Broadcaster::new(true).with_confirmation_timeout(Duration::ZERO);
        let recipients = ids(&["alice", "bob", "carol"]);
        let result = broadcaster
            .broadcast_text_message("ping", &recipients, &ParticipantId::from("host"), |_, _| {
                Ok::<_, TransferError>(())
            })
            .unwrap();
        assert_eq!(result.pending_confirmations, 3);

        let settled = broadcaster.expire_confirmations();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].message_id, result.message_id);
        assert_eq!(settled[0].successful_deliveries, 0);
        assert_eq!(settled[0].failed_deliveries, 3);
        assert_eq!(settled[0].pending_confirmations, 0);
        assert!(broadcaster.result(&result.message_id).is_none());

        // A confirmation arriving afterwards is ignored.
        let late = DeliveryConfirmation {
            message_id: result.message_id,
            recipient: ParticipantId::from("alice"),
            success: true,
            received_at: Utc::now(),
        };
        assert!(broadcaster.handle_delivery_confirmation(&late).is_none());
        assert!(broadcaster.expire_confirmations().is_empty());
    }

    #[test]
    fn test_unknown_confirmation_is_ignored() {
        let mut broadcaster = Broadcaster::new(true);
        let confirmation = DeliveryConfirmation {
            message_id: MessageId::new(),
            recipient: ParticipantId::from("alice"),
            success: true,
            received_at: Utc::now(),
        };
        assert!(broadcaster.handle_delivery_confirmation(&confirmation).is_none());
    }

    #[test]
    fn test_oversized_message_is_refused() {
        let mut broadcaster = Broadcaster::default();
        let text = "x".repeat(MAX_MESSAGE_SIZE + 1);
        let mut calls = 0;
        let result = broadcaster.broadcast_text_message(
            &text,
            &ids(&["alice"]),
            &ParticipantId::from("host"),
            |_, _| {
                calls += 1;
                Ok::<_, TransferError>(())
            },
        );
        assert!(matches!(result, Err(TransferError::Validation(_))));
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_json_message_round_trip_with_confirmation() {
        let mut broadcaster = Broadcaster::new(true);
        let (receiver, mut events) = MessageReceiver::new(ParticipantId::from("alice"));
        let host = ParticipantId::from("host");
        let doc = serde_json::json!({ "kind": "cursor", "x": 4, "y": 2 });

        let mut wire = Vec::new();
        let result = broadcaster
            .broadcast_message(&doc, &ids(&["alice"]), &host, |_, bytes| {
                wire.push(bytes);
                Ok::<_, TransferError>(())
            })
            .unwrap();

        let mut replies = Vec::new();
        let outcome = receiver.handle_incoming_data(&host, &wire[0], |to, bytes| {
            replies.push((to.clone(), bytes));
            Ok::<_, TransferError>(())
        });

        let message = match outcome {
            ReceiveOutcome::Received(message) => message,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(message.id, result.message_id);
        match &message.body {
            MessageBody::Json(json) => {
                assert_eq!(serde_json::from_str::<serde_json::Value>(json).unwrap(), doc)
            }
            other => panic!("unexpected body {other:?}"),
        }
        assert!(matches!(
            events.try_recv().unwrap(),
            ReceiverEvent::Received { from, .. } if from == host
        ));

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, host);
        let confirmation = match PeerMessage::from_bytes(&replies[0].1).unwrap() {
            PeerMessage::Confirmation(c) => c,
            other => panic!("unexpected frame {}", other.kind()),
        };
        let settled = broadcaster.handle_delivery_confirmation(&confirmation).unwrap();
        assert_eq!(settled.pending_confirmations, 0);
        assert_eq!(settled.successful_deliveries, 1);
    }

    #[test]
    fn test_garbage_is_invalid() {
        let (receiver, mut events) = MessageReceiver::new(ParticipantId::from("alice"));
        let from = ParticipantId::from("bob");
        let raw = vec![0xde, 0xad, 0xbe, 0xef];

        let outcome = receiver.handle_incoming_data(&from, &raw, |_, _| Ok::<_, TransferError>(()));
        match outcome {
            ReceiveOutcome::Invalid { raw: kept, reason } => {
                assert_eq!(kept, raw);
                assert!(reason.starts_with("undecodable frame"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(events.try_recv().unwrap(), ReceiverEvent::Invalid { .. }));
    }

    #[test]
    fn test_schema_violations_are_invalid() {
        let (receiver, _events) = MessageReceiver::new(ParticipantId::from("alice"));
        let from = ParticipantId::from("bob");
        let mut sends = 0;
        let mut receive = |message: Message| {
            let bytes = PeerMessage::Message(message).to_bytes().unwrap();
            receiver.handle_incoming_data(&from, &bytes, |_, _| {
                sends += 1;
                Ok::<_, TransferError>(())
            })
        };

        let base = Message {
            id: MessageId::new(),
            sender: ParticipantId::from("bob"),
            timestamp: Utc::now(),
            body: MessageBody::Text("hi".into()),
            requires_confirmation: true,
        };

        let anonymous = Message {
            sender: ParticipantId::from(""),
            ..base.clone()
        };
        assert!(matches!(receive(anonymous), ReceiveOutcome::Invalid { .. }));

        let bad_json = Message {
            body: MessageBody::Json("{not json".into()),
            ..base.clone()
        };
        assert!(matches!(receive(bad_json), ReceiveOutcome::Invalid { .. }));

        assert!(matches!(receive(base), ReceiveOutcome::Received(_)));
        assert_eq!(sends, 1);
    }

    #[test]
    fn test_other_frames_are_not_messages() {
        let (receiver, _events) = MessageReceiver::new(ParticipantId::from("alice"));
        let bytes = PeerMessage::Roster(meshlink_shared::protocol::RosterUpdate {
            host: ParticipantId::from("host"),
            participants: vec![],
        })
        .to_bytes()
        .unwrap();
        assert!(matches!(
            receiver.handle_incoming_data(&ParticipantId::from("host"), &bytes, |_, _| {
                Ok::<_, TransferError>(())
            }),
            ReceiveOutcome::Invalid { reason, .. } if reason == "expected a message, got roster"
        ));
    }
}
