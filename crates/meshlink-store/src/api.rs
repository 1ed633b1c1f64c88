//! JSON bodies of the signaling relay endpoints, shared by the axum server
//! and the HTTP client so both sides agree on the shape.

use serde::{Deserialize, Serialize};

use meshlink_shared::protocol::SignalMessage;
use meshlink_shared::ParticipantId;

use crate::models::{OfferRecord, ParticipantInfo, PendingAnswer, SignalEnvelope};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureSessionRequest {
    pub host_id: ParticipantId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishOfferRequest {
    pub host_id: ParticipantId,
    pub offer: SignalMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferResponse {
    pub offer: Option<OfferRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAnswerRequest {
    pub joiner_id: ParticipantId,
    pub answer: SignalMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswersResponse {
    pub answers: Vec<PendingAnswer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterJoinerRequest {
    pub joiner_id: ParticipantId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinersResponse {
    pub joiners: Vec<ParticipantId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetJoinerOfferRequest {
    pub host_id: ParticipantId,
    pub offer: SignalMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSignalRequest {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub signal: SignalMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSignalResponse {
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsResponse {
    pub signals: Vec<SignalEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearSignalQuery {
    pub through: u64,
}

/// Body of heartbeat and leave requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRequest {
    pub participant_id: ParticipantId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedRequest {
    pub participant_id: ParticipantId,
    pub connected_to: Vec<ParticipantId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveResponse {
    pub removed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantsQuery {
    pub exclude: Option<ParticipantId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantsResponse {
    pub participants: Vec<ParticipantInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

/// Error body. `code` lets clients map the failure back to a
/// [`StoreError`](crate::StoreError) variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub retryable: bool,
    /// Participant cap, for `session_full`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

pub const CODE_SESSION_NOT_FOUND: &str = "session_not_found";
pub const CODE_PARTICIPANT_NOT_FOUND: &str = "participant_not_found";
pub const CODE_ACCESS_DENIED: &str = "access_denied";
pub const CODE_SESSION_FULL: &str = "session_full";
pub const CODE_INVALID: &str = "invalid";
pub const CODE_RATE_LIMITED: &str = "rate_limited";
pub const CODE_INTERNAL: &str = "internal";
