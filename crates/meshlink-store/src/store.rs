use async_trait::async_trait;

use meshlink_shared::protocol::SignalMessage;
use meshlink_shared::{ParticipantId, SessionId};

use crate::error::Result;
use crate::models::{
    OfferRecord, ParticipantInfo, PendingAnswer, Registration, SignalEnvelope,
};

/// Signaling operations shared by the in-memory store and remote relays.
///
/// Lookups against a session that does not exist return
/// [`StoreError::SessionNotFound`](crate::StoreError::SessionNotFound);
/// callers treat it as retryable. "Not yet available" is `Ok(None)` or an
/// empty list, never an error.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Create the session if missing and register `host_id` as its host.
    async fn ensure_session(&self, session: &SessionId, host_id: &ParticipantId) -> Result<()>;

    /// Register (or re-register) a participant, creating the session if
    /// needed.
    async fn join(&self, session: &SessionId, registration: Registration)
        -> Result<ParticipantInfo>;

    async fn publish_offer(
        &self,
        session: &SessionId,
        offer: SignalMessage,
        host_id: &ParticipantId,
    ) -> Result<()>;

    async fn fetch_offer(&self, session: &SessionId) -> Result<Option<OfferRecord>>;

    async fn submit_answer(
        &self,
        session: &SessionId,
        answer: SignalMessage,
        joiner_id: &ParticipantId,
    ) -> Result<()>;

    async fn poll_answers(&self, session: &SessionId) -> Result<Vec<PendingAnswer>>;

    async fn clear_answer(&self, session: &SessionId, joiner_id: &ParticipantId) -> Result<()>;

    /// Announce a joiner that waits for a dedicated offer.
    async fn register_joiner(&self, session: &SessionId, joiner_id: &ParticipantId)
        -> Result<()>;

    /// Joiners registered through [`register_joiner`](Self::register_joiner)
    /// that have no offer assigned yet.
    async fn pending_joiners(&self, session: &SessionId) -> Result<Vec<ParticipantId>>;

    async fn set_joiner_offer(
        &self,
        session: &SessionId,
        joiner_id: &ParticipantId,
        offer: SignalMessage,
        host_id: &ParticipantId,
    ) -> Result<()>;

    async fn joiner_offer(
        &self,
        session: &SessionId,
        joiner_id: &ParticipantId,
    ) -> Result<Option<OfferRecord>>;

    async fn clear_joiner_offer(&self, session: &SessionId, joiner_id: &ParticipantId)
        -> Result<()>;

    /// Queue a signal for `to`. Returns its sequence number.
    async fn publish_signal(
        &self,
        session: &SessionId,
        from: &ParticipantId,
        to: &ParticipantId,
        signal: SignalMessage,
    ) -> Result<u64>;

    /// All signals queued for `to`, ordered by sequence number.
    async fn poll_signals_for(&self, session: &SessionId, to: &ParticipantId)
        -> Result<Vec<SignalEnvelope>>;

    /// Drop the signals from `from` to `to` up to and including
    /// `through_seq`.
    async fn clear_signal(
        &self,
        session: &SessionId,
        from: &ParticipantId,
        to: &ParticipantId,
        through_seq: u64,
    ) -> Result<()>;

    /// Heartbeat.
    async fn touch_participant(&self, session: &SessionId, participant: &ParticipantId)
        -> Result<()>;

    async fn set_connected_to(
        &self,
        session: &SessionId,
        participant: &ParticipantId,
        counterparts: Vec<ParticipantId>,
    ) -> Result<()>;

    /// Leave. Returns whether the participant was registered; unknown
    /// participants and sessions are not an error.
    async fn remove_participant(&self, session: &SessionId, participant: &ParticipantId)
        -> Result<bool>;

    async fn list_participants(
        &self,
        session: &SessionId,
        exclude: Option<&ParticipantId>,
    ) -> Result<Vec<ParticipantInfo>>;
}
