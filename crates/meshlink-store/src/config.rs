use chrono::Duration;

use meshlink_shared::constants::{
    EMPTY_SESSION_GRACE_SECS, MAX_MESH_PEERS, PARTICIPANT_TIMEOUT_SECS, SESSION_TTL_SECS,
};

/// Expiry and capacity policy of a [`MemoryStore`](crate::MemoryStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Sessions expire this long after their last mutation.
    pub session_ttl: Duration,
    /// Participants without a heartbeat for longer than this are pruned.
    pub participant_timeout: Duration,
    /// Grace period granted to a session whose last participant is gone.
    pub empty_session_grace: Duration,
    /// Maximum participants per session (0 = unlimited).
    pub max_participants: usize,
    /// Queued signals kept per (sender, recipient) pair; oldest dropped first.
    pub max_queued_signals: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::seconds(SESSION_TTL_SECS),
            participant_timeout: Duration::seconds(PARTICIPANT_TIMEOUT_SECS),
            empty_session_grace: Duration::seconds(EMPTY_SESSION_GRACE_SECS),
            max_participants: MAX_MESH_PEERS + 1,
            max_queued_signals: 256,
        }
    }
}
