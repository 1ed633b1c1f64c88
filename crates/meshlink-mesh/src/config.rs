use std::time::Duration;

use meshlink_shared::constants::{
    HANDSHAKE_TIMEOUT_MS, HEARTBEAT_INTERVAL_MS, LEAVE_TIMEOUT_MS, MAX_HANDSHAKE_RETRIES, MAX_MESH_PEERS,
    OFFER_FETCH_ATTEMPTS, OFFER_FETCH_INTERVAL_MS, POLL_INTERVAL_MS, ROSTER_INTERVAL_MS,
};
use meshlink_shared::invite::ConnectionString;
use meshlink_shared::{ParticipantId, Role, SessionId};

use crate::retry::RetryPolicy;

/// How participants find each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapMode {
    /// Joiners only link to the host; the host hands out offers.
    Star,
    /// Everyone links to everyone through the per-pair signal queues.
    Mesh,
}

/// Orchestrator settings. [`MeshConfig::new`] fills in the default timings.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub session: SessionId,
    pub role: Role,
    pub mode: BootstrapMode,
    /// Generated when absent.
    pub participant_id: Option<ParticipantId>,
    pub display_name: Option<String>,
    pub password_hash: Option<String>,

    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub roster_interval: Duration,
    pub offer_fetch_interval: Duration,
    pub offer_fetch_attempts: u32,
    pub handshake_timeout: Duration,
    /// Extra attempts after the first handshake times out.
    pub max_handshake_retries: u32,
    /// Upper bound on links this participant initiates in mesh mode.
    pub max_peers: usize,
    /// Joiners fall back to the host's shared offer when no dedicated offer
    /// was assigned to them.
    pub shared_offer_fallback: bool,
    pub relay_retry: RetryPolicy,
    /// Upper bound on the relay call made when leaving.
    pub leave_timeout: Duration,
}

impl MeshConfig {
    pub fn new(session: SessionId, role: Role) -> Self {
        Self {
            session,
            role,
            mode: BootstrapMode::Star,
            participant_id: None,
            display_name: None,
            password_hash: None,
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            roster_interval: Duration::from_millis(ROSTER_INTERVAL_MS),
            offer_fetch_interval: Duration::from_millis(OFFER_FETCH_INTERVAL_MS),
            offer_fetch_attempts: OFFER_FETCH_ATTEMPTS,
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            max_handshake_retries: MAX_HANDSHAKE_RETRIES,
            max_peers: MAX_MESH_PEERS,
            shared_offer_fallback: true,
            relay_retry: RetryPolicy::default(),
            leave_timeout: Duration::from_millis(LEAVE_TIMEOUT_MS),
        }
    }

    /// Settings for joining the session named by an invite.
    pub fn from_connection_string(conn: &ConnectionString, role: Role) -> Self {
        let mut config = Self::new(conn.session_id.clone(), role);
        config.password_hash = conn.password_hash.clone();
        config
    }

    pub fn with_mode(mut self, mode: BootstrapMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_participant_id(mut self, id: ParticipantId) -> Self {
        self.participant_id = Some(id);
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::new(SessionId::parse("room-1").unwrap(), Role::Joiner);
        assert_eq!(config.mode, BootstrapMode::Star);
        assert_eq!(config.handshake_timeout, Duration::from_secs(12));
        assert_eq!(config.max_handshake_retries, 2);
        assert_eq!(config.offer_fetch_attempts, 15);
        assert_eq!(config.poll_interval, Duration::from_millis(1500));
    }

    #[test]
    fn test_from_connection_string() {
        let conn = ConnectionString::new(SessionId::parse("room-1").unwrap(), Some("hunter2"));
        let config = MeshConfig::from_connection_string(&conn, Role::Joiner)
            .with_mode(BootstrapMode::Mesh);
        assert_eq!(config.session.as_str(), "room-1");
        assert_eq!(config.password_hash, conn.password_hash);
        assert_eq!(config.mode, BootstrapMode::Mesh);
    }
}
