//! The transport capability: point-to-point links that exchange signals
//! during the handshake and bytes once connected.
//!
//! A link reports everything that happens to it as [`LinkEvent`]s on the
//! channel it was created with. Events carry the link id so the orchestrator
//! can discard events from links it already tore down.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use meshlink_shared::protocol::SignalKind;
use meshlink_shared::{LinkRole, ParticipantId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Link is not connected")]
    NotConnected,

    #[error("Link is closed")]
    Closed,

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Lifecycle of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Created,
    Handshaking,
    Connected,
    Closed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub link_id: Uuid,
    pub role: LinkRole,
    pub local: ParticipantId,
    /// Counterpart, when already known (a host's spare link has none).
    pub remote: Option<ParticipantId>,
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    /// Local handshake artifact to deliver to the counterpart
    Signal(SignalKind),
    Connect,
    Data(Bytes),
    Close,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub link_id: Uuid,
    pub kind: LinkEventKind,
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// One direct link to a counterpart.
///
/// An initiator emits its offer as a `Signal` event right after creation; a
/// responder emits its answer once the remote offer was fed through
/// [`signal`](PeerLink::signal).
pub trait PeerLink: Send + Sync {
    fn id(&self) -> Uuid;

    fn role(&self) -> LinkRole;

    /// Feed a signal received from the counterpart.
    fn signal(&self, signal: SignalKind) -> Result<(), LinkError>;

    fn send(&self, data: Bytes) -> Result<(), LinkError>;

    /// Close the link. Idempotent.
    fn close(&self);
}

/// Factory for peer links.
pub trait PeerTransport: Send + Sync {
    fn create_link(
        &self,
        config: LinkConfig,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, LinkError>;
}
