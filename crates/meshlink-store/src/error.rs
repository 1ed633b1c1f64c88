use meshlink_shared::{ParticipantId, SessionId};
use thiserror::Error;

/// Errors produced by signaling stores.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The session does not exist or expired while empty.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// The participant is not (or no longer) registered in the session.
    #[error("Participant {participant} not found in session {session}")]
    ParticipantNotFound {
        session: SessionId,
        participant: ParticipantId,
    },

    /// Password hash presented on join does not match the session's.
    #[error("Access to session {0} denied")]
    AccessDenied(SessionId),

    /// The session already holds the maximum number of participants.
    #[error("Session {session} is full ({max} participants)")]
    SessionFull { session: SessionId, max: usize },

    /// The store could not be reached (remote stores only).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Malformed request or response.
    #[error("Invalid request: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Whether the caller should treat the failure as transient and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::SessionNotFound(_)
                | StoreError::ParticipantNotFound { .. }
                | StoreError::Unavailable(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
