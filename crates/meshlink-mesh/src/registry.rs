//! Peer link bookkeeping.
//!
//! At most one link per counterpart. Replacing or removing an entry always
//! tears the old link down, so a counterpart never ends up with two live
//! links.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;
use uuid::Uuid;

use meshlink_shared::{LinkRole, ParticipantId};

use crate::link::{LinkState, PeerLink};
use crate::tasks::DeadlineTimer;

/// A link to one counterpart plus its handshake state.
pub struct PeerLinkHandle {
    pub counterpart: ParticipantId,
    pub role: LinkRole,
    pub state: LinkState,
    /// Handshake attempt, starting at 0.
    pub attempt: u32,
    /// Link id carried by this attempt's signals (always the initiator's).
    pub signal_link_id: Uuid,
    /// The answer goes to the relay's answer slot rather than the signal
    /// queue (a joiner answering the host's bootstrap offer).
    pub answer_via_slot: bool,
    pub link: Arc<dyn PeerLink>,
    pub created_at: Instant,
    deadline: Option<DeadlineTimer>,
}

impl PeerLinkHandle {
    pub fn new(counterpart: ParticipantId, link: Arc<dyn PeerLink>, signal_link_id: Uuid) -> Self {
        Self {
            counterpart,
            role: link.role(),
            state: LinkState::Created,
            attempt: 0,
            signal_link_id,
            answer_via_slot: false,
            link,
            created_at: Instant::now(),
            deadline: None,
        }
    }

    pub fn link_id(&self) -> Uuid {
        self.link.id()
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn set_deadline(&mut self, timer: DeadlineTimer) {
        self.deadline = Some(timer);
    }

    pub fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    fn teardown(&mut self) {
        self.deadline = None;
        self.link.close();
        if self.state != LinkState::Failed {
            self.state = LinkState::Closed;
        }
    }
}

/// Registry of the local participant's peer links.
#[derive(Default)]
pub struct PeerRegistry {
    handles: HashMap<ParticipantId, PeerLinkHandle>,
    by_link: HashMap<Uuid, ParticipantId>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `handle`, tearing down any link previously held for the same
    /// counterpart. Returns the replaced handle.
    pub fn insert(&mut self, handle: PeerLinkHandle) -> Option<PeerLinkHandle> {
        let replaced = self.remove(&handle.counterpart);
        if let Some(old) = &replaced {
            debug!(peer = %old.counterpart, old_link = %old.link_id(), new_link = %handle.link_id(), "Replacing peer link");
        }
        self.by_link.insert(handle.link_id(), handle.counterpart.clone());
        self.handles.insert(handle.counterpart.clone(), handle);
        replaced
    }

    /// Stop tracking `peer`: its deadline is cancelled and its link closed
    /// before this returns.
    pub fn remove(&mut self, peer: &ParticipantId) -> Option<PeerLinkHandle> {
        let mut handle = self.handles.remove(peer)?;
        self.by_link.remove(&handle.link_id());
        handle.teardown();
        Some(handle)
    }

    /// Same as [`remove`](Self::remove) but marks the handle failed.
    pub fn fail(&mut self, peer: &ParticipantId) -> Option<PeerLinkHandle> {
        if let Some(handle) = self.handles.get_mut(peer) {
            handle.state = LinkState::Failed;
        }
        self.remove(peer)
    }

    pub fn get(&self, peer: &ParticipantId) -> Option<&PeerLinkHandle> {
        self.handles.get(peer)
    }

    pub fn get_mut(&mut self, peer: &ParticipantId) -> Option<&mut PeerLinkHandle> {
        self.handles.get_mut(peer)
    }

    pub fn set_state(&mut self, peer: &ParticipantId, state: LinkState) -> bool {
        match self.handles.get_mut(peer) {
            Some(handle) => {
                handle.state = state;
                true
            }
            None => false,
        }
    }

    /// Counterpart owning the local link `link_id`, if it is still tracked.
    pub fn counterpart_of(&self, link_id: &Uuid) -> Option<&ParticipantId> {
        self.by_link.get(link_id)
    }

    pub fn contains(&self, peer: &ParticipantId) -> bool {
        self.handles.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Counterparts with a connected link, sorted.
    pub fn connected_peers(&self) -> Vec<ParticipantId> {
        let mut peers: Vec<ParticipantId> = self
            .handles
            .values()
            .filter(|h| h.is_connected())
            .map(|h| h.counterpart.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn connected_count(&self) -> usize {
        self.handles.values().filter(|h| h.is_connected()).count()
    }

    /// Every tracked counterpart, whatever its link state.
    pub fn peers(&self) -> Vec<ParticipantId> {
        self.handles.keys().cloned().collect()
    }

    /// Tear down every link.
    pub fn clear(&mut self) {
        for peer in self.peers() {
            self.remove(&peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkConfig, LinkEvent, LinkEventKind, PeerTransport};
    use crate::memory::MemoryTransport;
    use tokio::sync::mpsc;

    fn initiator(
        transport: &MemoryTransport,
        peer: &str,
        tx: &mpsc::UnboundedSender<LinkEvent>,
    ) -> PeerLinkHandle {
        let link_id = Uuid::new_v4();
        let link = transport
            .create_link(
                LinkConfig {
                    link_id,
                    role: LinkRole::Initiator,
                    local: ParticipantId::from("local"),
                    remote: Some(ParticipantId::from(peer)),
                },
                tx.clone(),
            )
            .unwrap();
        PeerLinkHandle::new(ParticipantId::from(peer), link, link_id)
    }

    #[test]
    fn test_insert_replaces_and_closes_old_link() {
        let transport = MemoryTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = PeerRegistry::new();

        let first = initiator(&transport, "bob", &tx);
        let first_id = first.link_id();
        assert!(registry.insert(first).is_none());

        let second = initiator(&transport, "bob", &tx);
        let second_id = second.link_id();
        let replaced = registry.insert(second).unwrap();

        assert_eq!(replaced.link_id(), first_id);
        assert_eq!(replaced.state, LinkState::Closed);
        assert_eq!(registry.len(), 1);
        assert!(registry.counterpart_of(&first_id).is_none());
        assert_eq!(registry.counterpart_of(&second_id), Some(&ParticipantId::from("bob")));
        assert_eq!(transport.link_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_cancels_deadline() {
        let transport = MemoryTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel::<u8>();
        let mut registry = PeerRegistry::new();

        let mut handle = initiator(&transport, "bob", &tx);
        handle.set_deadline(DeadlineTimer::spawn(
            std::time::Duration::from_millis(20),
            tick_tx,
            1,
        ));
        registry.insert(handle);

        let removed = registry.remove(&ParticipantId::from("bob")).unwrap();
        assert!(!removed.has_deadline());
        assert_eq!(tick_rx.recv().await, None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_connected_peers_sorted() {
        let transport = MemoryTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = PeerRegistry::new();

        for peer in ["carol", "alice", "bob"] {
            let mut handle = initiator(&transport, peer, &tx);
            if peer != "bob" {
                handle.state = LinkState::Connected;
            }
            registry.insert(handle);
        }

        assert_eq!(
            registry.connected_peers(),
            vec![ParticipantId::from("alice"), ParticipantId::from("carol")]
        );
        assert_eq!(registry.connected_count(), 2);

        assert!(registry.set_state(&ParticipantId::from("bob"), LinkState::Handshaking));
        assert!(!registry.set_state(&ParticipantId::from("dave"), LinkState::Handshaking));
        let failed = registry.fail(&ParticipantId::from("bob")).unwrap();
        assert_eq!(failed.state, LinkState::Failed);

        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(transport.link_count(), 0);
    }

    #[test]
    fn test_events_carry_link_id() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = initiator(&transport, "bob", &tx);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.link_id, handle.link_id());
        assert!(matches!(event.kind, LinkEventKind::Signal(_)));
    }
}
