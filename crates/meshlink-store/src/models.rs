use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use meshlink_shared::protocol::SignalMessage;
use meshlink_shared::{ParticipantId, Role, SessionId};

/// Roster entry of a session participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub display_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Counterparts this participant reported a connected link with.
    pub connected_to: Vec<ParticipantId>,
}

/// What a participant presents when joining a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registration {
    pub id: ParticipantId,
    pub display_name: String,
    pub role: Role,
    /// Encoded password hash from the connection string, if any.
    #[serde(default)]
    pub password_hash: Option<String>,
}

impl Registration {
    pub fn new(id: ParticipantId, role: Role) -> Self {
        Self {
            display_name: id.to_string(),
            id,
            role,
            password_hash: None,
        }
    }
}

/// An offer together with the host that published it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OfferRecord {
    pub host_id: ParticipantId,
    pub offer: SignalMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingAnswer {
    pub joiner_id: ParticipantId,
    pub answer: SignalMessage,
}

/// A queued signal from one participant to another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub seq: u64,
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub signal: SignalMessage,
    pub sent_at: DateTime<Utc>,
}

/// Outcome of one pruning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed_participants: Vec<(SessionId, ParticipantId)>,
    pub deleted_sessions: Vec<SessionId>,
}

/// A signaling session ("room").
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub host_id: Option<ParticipantId>,
    pub password_hash: Option<String>,
    pub participants: BTreeMap<ParticipantId, ParticipantInfo>,
    pub shared_offer: Option<OfferRecord>,
    pub answers: BTreeMap<ParticipantId, SignalMessage>,
    pub pending_joiners: BTreeSet<ParticipantId>,
    pub joiner_offers: BTreeMap<ParticipantId, OfferRecord>,
    pub signals: BTreeMap<(ParticipantId, ParticipantId), VecDeque<SignalEnvelope>>,
    pub next_seq: u64,
}

impl Session {
    pub fn new(id: SessionId, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            expires_at,
            host_id: None,
            password_hash: None,
            participants: BTreeMap::new(),
            shared_offer: None,
            answers: BTreeMap::new(),
            pending_joiners: BTreeSet::new(),
            joiner_offers: BTreeMap::new(),
            signals: BTreeMap::new(),
            next_seq: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Refresh `participant`'s last-seen time if it is registered.
    pub fn touch(&mut self, participant: &ParticipantId, now: DateTime<Utc>) -> bool {
        match self.participants.get_mut(participant) {
            Some(info) => {
                info.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Remove a participant and every artifact that mentions it.
    pub fn remove_participant(&mut self, participant: &ParticipantId) -> bool {
        let removed = self.participants.remove(participant).is_some();

        self.answers.remove(participant);
        self.pending_joiners.remove(participant);
        self.joiner_offers.remove(participant);
        self.signals
            .retain(|(from, to), _| from != participant && to != participant);
        for info in self.participants.values_mut() {
            info.connected_to.retain(|peer| peer != participant);
        }

        if self.host_id.as_ref() == Some(participant) {
            self.host_id = None;
            self.shared_offer = None;
            self.joiner_offers.clear();
        }

        removed
    }

    /// Participants whose last heartbeat is older than `cutoff`.
    pub fn stale_participants(&self, cutoff: DateTime<Utc>) -> Vec<ParticipantId> {
        self.participants
            .values()
            .filter(|info| info.last_seen < cutoff)
            .map(|info| info.id.clone())
            .collect()
    }
}
