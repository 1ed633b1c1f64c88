//! In-process [`PeerTransport`]: every link created through the same
//! [`MemoryTransport`] lives on one shared hub, so orchestrators running in a
//! single process can connect to each other.
//!
//! Offers and answers are plain strings naming the link that produced them
//! (`memory-offer:<link id>` / `memory-answer:<link id>`). A few knobs let
//! tests inject faults.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{debug, trace};
use uuid::Uuid;

use meshlink_shared::protocol::SignalKind;
use meshlink_shared::{LinkRole, ParticipantId};

use crate::link::{
    LinkConfig, LinkError, LinkEvent, LinkEventKind, LinkEventSender, PeerLink, PeerTransport,
};

const OFFER_PREFIX: &str = "memory-offer:";
const ANSWER_PREFIX: &str = "memory-answer:";
const CANDIDATE_PREFIX: &str = "memory-candidate:";

struct Endpoint {
    local: ParticipantId,
    role: LinkRole,
    events: LinkEventSender,
    peer: Option<Uuid>,
    connected: bool,
}

impl Endpoint {
    fn emit(&self, link_id: Uuid, kind: LinkEventKind) {
        // A dropped receiver means the owner is gone; nothing to report to.
        let _ = self.events.send(LinkEvent { link_id, kind });
    }
}

#[derive(Default)]
struct Hub {
    links: HashMap<Uuid, Endpoint>,
    /// Remaining offers each participant will leave unanswered.
    stalled_answers: HashMap<ParticipantId, usize>,
    trickle_candidates: bool,
}

/// Shared hub of in-memory links. Cloning yields another handle to the same
/// hub.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                trickle_candidates: true,
                ..Hub::default()
            })),
        }
    }

    /// Whether initiators trickle a candidate after their offer.
    pub fn set_trickle_candidates(&self, enabled: bool) {
        lock(&self.hub).trickle_candidates = enabled;
    }

    /// Make `participant` ignore the next `count` offers it responds to, so
    /// the initiator's handshake times out.
    pub fn stall_answers_from(&self, participant: &ParticipantId, count: usize) {
        lock(&self.hub)
            .stalled_answers
            .insert(participant.clone(), count);
    }

    /// Drop every connected link between `a` and `b`, reporting `Close` to
    /// both ends.
    pub fn sever(&self, a: &ParticipantId, b: &ParticipantId) {
        let mut hub = lock(&self.hub);
        let pairs: Vec<(Uuid, Uuid)> = hub
            .links
            .iter()
            .filter(|(_, ep)| ep.connected && &ep.local == a)
            .filter_map(|(id, ep)| ep.peer.map(|peer| (*id, peer)))
            .filter(|(_, peer)| hub.links.get(peer).map(|ep| &ep.local == b).unwrap_or(false))
            .collect();

        for (id, peer) in pairs {
            for link in [id, peer] {
                if let Some(ep) = hub.links.remove(&link) {
                    ep.emit(link, LinkEventKind::Close);
                }
            }
            debug!(a = %a, b = %b, link = %id, "Severed memory link");
        }
    }

    /// Number of live links on the hub.
    pub fn link_count(&self) -> usize {
        lock(&self.hub).links.len()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTransport for MemoryTransport {
    fn create_link(
        &self,
        config: LinkConfig,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, LinkError> {
        let mut hub = lock(&self.hub);
        let endpoint = Endpoint {
            local: config.local.clone(),
            role: config.role,
            events,
            peer: None,
            connected: false,
        };

        if config.role == LinkRole::Initiator {
            endpoint.emit(
                config.link_id,
                LinkEventKind::Signal(SignalKind::Offer(format!("{OFFER_PREFIX}{}", config.link_id))),
            );
            if hub.trickle_candidates {
                endpoint.emit(
                    config.link_id,
                    LinkEventKind::Signal(SignalKind::Candidate(format!(
                        "{CANDIDATE_PREFIX}{}",
                        config.link_id
                    ))),
                );
            }
        }

        hub.links.insert(config.link_id, endpoint);
        trace!(link = %config.link_id, role = ?config.role, local = %config.local, "Memory link created");

        Ok(Arc::new(MemoryLink {
            id: config.link_id,
            role: config.role,
            hub: Arc::clone(&self.hub),
        }))
    }
}

/// One end of an in-memory link.
pub struct MemoryLink {
    id: Uuid,
    role: LinkRole,
    hub: Arc<Mutex<Hub>>,
}

impl MemoryLink {
    fn accept_offer(&self, hub: &mut Hub, sdp: &str) -> Result<(), LinkError> {
        if self.role != LinkRole::Responder {
            return Err(LinkError::InvalidSignal("initiator received an offer".into()));
        }
        let initiator = parse_link_ref(sdp, OFFER_PREFIX)?;
        if !hub.links.contains_key(&initiator) {
            return Err(LinkError::Transport(format!("offering link {initiator} is gone")));
        }

        let local = {
            let ep = hub.links.get_mut(&self.id).ok_or(LinkError::Closed)?;
            ep.peer = Some(initiator);
            ep.local.clone()
        };

        if let Some(remaining) = hub.stalled_answers.get_mut(&local) {
            if *remaining > 0 {
                *remaining -= 1;
                debug!(link = %self.id, participant = %local, "Stalling answer");
                return Ok(());
            }
        }

        if let Some(ep) = hub.links.get(&self.id) {
            ep.emit(
                self.id,
                LinkEventKind::Signal(SignalKind::Answer(format!("{ANSWER_PREFIX}{}", self.id))),
            );
        }
        Ok(())
    }

    fn accept_answer(&self, hub: &mut Hub, sdp: &str) -> Result<(), LinkError> {
        if self.role != LinkRole::Initiator {
            return Err(LinkError::InvalidSignal("responder received an answer".into()));
        }
        let responder = parse_link_ref(sdp, ANSWER_PREFIX)?;

        let paired = hub
            .links
            .get(&responder)
            .map(|ep| ep.peer == Some(self.id))
            .unwrap_or(false);
        if !paired {
            return Err(LinkError::Transport(format!(
                "answering link {responder} is not paired with {}",
                self.id
            )));
        }

        for (link, peer) in [(self.id, responder), (responder, self.id)] {
            if let Some(ep) = hub.links.get_mut(&link) {
                ep.peer = Some(peer);
                ep.connected = true;
                ep.emit(link, LinkEventKind::Connect);
            }
        }
        Ok(())
    }
}

impl PeerLink for MemoryLink {
    fn id(&self) -> Uuid {
        self.id
    }

    fn role(&self) -> LinkRole {
        self.role
    }

    fn signal(&self, signal: SignalKind) -> Result<(), LinkError> {
        let mut hub = lock(&self.hub);
        if !hub.links.contains_key(&self.id) {
            return Err(LinkError::Closed);
        }

        match signal {
            SignalKind::Offer(sdp) => self.accept_offer(&mut hub, &sdp),
            SignalKind::Answer(sdp) => self.accept_answer(&mut hub, &sdp),
            SignalKind::Candidate(candidate) => {
                if candidate.starts_with(CANDIDATE_PREFIX) {
                    Ok(())
                } else {
                    Err(LinkError::InvalidSignal(format!("bad candidate: {candidate}")))
                }
            }
        }
    }

    fn send(&self, data: Bytes) -> Result<(), LinkError> {
        let hub = lock(&self.hub);
        let ep = hub.links.get(&self.id).ok_or(LinkError::Closed)?;
        if !ep.connected {
            return Err(LinkError::NotConnected);
        }
        let peer_id = ep.peer.ok_or(LinkError::NotConnected)?;
        let peer = hub.links.get(&peer_id).ok_or(LinkError::NotConnected)?;
        peer.emit(peer_id, LinkEventKind::Data(data));
        Ok(())
    }

    fn close(&self) {
        let mut hub = lock(&self.hub);
        let Some(ep) = hub.links.remove(&self.id) else {
            return;
        };
        if let Some(peer_id) = ep.peer {
            if let Some(peer) = hub.links.get_mut(&peer_id) {
                if peer.peer == Some(self.id) {
                    let was_connected = peer.connected;
                    peer.connected = false;
                    peer.peer = None;
                    if was_connected {
                        peer.emit(peer_id, LinkEventKind::Close);
                    }
                }
            }
        }
        trace!(link = %self.id, "Memory link closed");
    }
}

fn parse_link_ref(sdp: &str, prefix: &str) -> Result<Uuid, LinkError> {
    sdp.strip_prefix(prefix)
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or_else(|| LinkError::InvalidSignal(format!("unrecognised description: {sdp}")))
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    // The hub holds no invariants a panicking holder could break halfway.
    hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
