use thiserror::Error;

use meshlink_shared::ParticipantId;
use meshlink_store::StoreError;

use crate::link::LinkError;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Signaling error: {0}")]
    Store(#[from] StoreError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("No connected link to {0}")]
    NotConnected(ParticipantId),

    #[error("Orchestrator has stopped")]
    Stopped,

    #[error("Relay client error: {0}")]
    Relay(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
