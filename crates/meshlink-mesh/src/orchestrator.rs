//! Connection orchestrator with the tokio mpsc command/notification pattern.
//!
//! One orchestrator task runs per local participant. It owns the peer
//! registry, the periodic relay tasks and every link event, so all link
//! bookkeeping happens on a single task. Application code drives it through
//! a [`MeshHandle`] and receives [`MeshNotification`]s.
//!
//! Bootstrap works in one of two modes:
//!
//! * **Star**: the host keeps a spare initiator link whose offer is published
//!   as the session's shared offer and handed to each joiner that registers.
//!   Joiners answer through the relay's answer slot.
//! * **Mesh**: every participant initiates links to the participants the
//!   relay lists, exchanging offers, answers and candidates through the
//!   per-pair signal queues.
//!
//! When two participants offer to each other at the same time, the one with
//! the greater id accepts the inbound offer and the other keeps its own.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use meshlink_shared::protocol::{PeerMessage, RosterUpdate, SignalKind, SignalMessage};
use meshlink_shared::{LinkRole, ParticipantId, Role, SessionId};
use meshlink_store::{PendingAnswer, Registration, SignalingStore, StoreError};

use crate::config::{BootstrapMode, MeshConfig};
use crate::error::MeshError;
use crate::link::{LinkConfig, LinkEvent, LinkEventKind, LinkEventSender, LinkState, PeerLink, PeerTransport};
use crate::registry::{PeerLinkHandle, PeerRegistry};
use crate::retry::with_retry;
use crate::tasks::{DeadlineTimer, PeriodicTask};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Overall connectivity of the local participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Registering,
    Connecting,
    Connected,
    /// Some links dropped, at least one is still up.
    PartiallyConnected,
    Disconnected,
}

/// Notifications sent *from* the orchestrator to the application.
#[derive(Debug, Clone)]
pub enum MeshNotification {
    StateChanged(ConnectionState),
    PeerConnected {
        peer: ParticipantId,
    },
    PeerDisconnected {
        peer: ParticipantId,
    },
    /// Handshake retries exhausted.
    PeerFailed {
        peer: ParticipantId,
        reason: String,
    },
    /// A frame received from a peer, passed through untouched.
    Data {
        peer: ParticipantId,
        data: Bytes,
    },
    /// The relay's participant list changed (local participant excluded).
    RosterChanged {
        participants: Vec<ParticipantId>,
    },
    /// The host announced who it is connected to.
    HostRoster(RosterUpdate),
    /// A joiner never received an offer from the host.
    BootstrapFailed {
        reason: String,
    },
    SignalingError {
        op: &'static str,
        error: String,
    },
}

/// Commands sent *into* the orchestrator task.
#[derive(Debug)]
enum Command {
    Connect(ParticipantId),
    Disconnect(ParticipantId),
    Leave(oneshot::Sender<()>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tick {
    Heartbeat,
    Poll,
    Roster,
    OfferFetch,
    RestartBootstrap,
    HandshakeDeadline { peer: ParticipantId, link_id: Uuid },
}

type SharedLinks = Arc<RwLock<HashMap<ParticipantId, Arc<dyn PeerLink>>>>;

fn read_links(links: &SharedLinks) -> RwLockReadGuard<'_, HashMap<ParticipantId, Arc<dyn PeerLink>>> {
    links.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_links(links: &SharedLinks) -> RwLockWriteGuard<'_, HashMap<ParticipantId, Arc<dyn PeerLink>>> {
    links.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cheap, cloneable handle to a running orchestrator.
///
/// Sending goes straight to the connected link without a round trip through
/// the orchestrator task. Dropping every handle shuts the orchestrator down
/// as if [`leave`](MeshHandle::leave) had been called.
#[derive(Clone)]
pub struct MeshHandle {
    local: ParticipantId,
    session: SessionId,
    commands: mpsc::UnboundedSender<Command>,
    links: SharedLinks,
    state: watch::Receiver<ConnectionState>,
}

impl MeshHandle {
    pub fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch channel following [`state`](Self::state).
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Counterparts with a connected link, sorted.
    pub fn connected_peers(&self) -> Vec<ParticipantId> {
        let mut peers: Vec<ParticipantId> = read_links(&self.links).keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn is_connected_to(&self, peer: &ParticipantId) -> bool {
        read_links(&self.links).contains_key(peer)
    }

    /// Which end of the connected link to `peer` this participant holds.
    pub fn link_role(&self, peer: &ParticipantId) -> Option<LinkRole> {
        read_links(&self.links).get(peer).map(|link| link.role())
    }

    /// Send one frame to a connected peer.
    pub fn send(&self, peer: &ParticipantId, data: impl Into<Bytes>) -> Result<(), MeshError> {
        let link = read_links(&self.links)
            .get(peer)
            .cloned()
            .ok_or_else(|| MeshError::NotConnected(peer.clone()))?;
        link.send(data.into())?;
        Ok(())
    }

    /// Initiate a link to `peer` (also clears an earlier failure).
    pub fn connect_to(&self, peer: ParticipantId) -> Result<(), MeshError> {
        self.commands
            .send(Command::Connect(peer))
            .map_err(|_| MeshError::Stopped)
    }

    /// Tear down the link to `peer`. In mesh mode it is not re-initiated
    /// until `peer` leaves and rejoins or [`connect_to`](Self::connect_to)
    /// is called.
    pub fn disconnect(&self, peer: ParticipantId) -> Result<(), MeshError> {
        self.commands
            .send(Command::Disconnect(peer))
            .map_err(|_| MeshError::Stopped)
    }

    /// Close every link, stop all periodic tasks and deregister from the
    /// relay. Returns once the orchestrator has stopped.
    pub async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Leave(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Register with the relay and spawn the orchestrator task.
///
/// Registration failures (wrong password, full session, unreachable relay)
/// are returned here; everything after that is reported through
/// notifications.
pub async fn spawn_orchestrator(
    config: MeshConfig,
    store: Arc<dyn SignalingStore>,
    transport: Arc<dyn PeerTransport>,
) -> Result<(MeshHandle, mpsc::UnboundedReceiver<MeshNotification>), MeshError> {
    let local = config
        .participant_id
        .clone()
        .unwrap_or_else(ParticipantId::generate);
    if local.as_str().is_empty() {
        return Err(MeshError::InvalidConfig("participant id is empty".into()));
    }

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (notification_tx, notification_rx) = mpsc::unbounded_channel();
    let (tick_tx, tick_rx) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
    let links: SharedLinks = Arc::new(RwLock::new(HashMap::new()));

    let handle = MeshHandle {
        local: local.clone(),
        session: config.session.clone(),
        commands: command_tx,
        links: Arc::clone(&links),
        state: state_rx,
    };

    let mut orchestrator = Orchestrator {
        config,
        local,
        store,
        transport,
        registry: PeerRegistry::new(),
        spare: None,
        state: ConnectionState::Idle,
        state_tx,
        notifications: notification_tx,
        ticks: tick_tx,
        link_events: link_tx,
        links,
        abandoned: HashSet::new(),
        host_id: None,
        roster: Vec::new(),
        heartbeat: None,
        poll: None,
        roster_refresh: None,
        offer_fetch: None,
        fetch_attempts: 0,
    };

    orchestrator.register().await?;
    orchestrator.start_tasks();

    tokio::spawn(orchestrator.run(command_rx, tick_rx, link_rx));

    Ok((handle, notification_rx))
}

// ---------------------------------------------------------------------------
// Orchestrator task
// ---------------------------------------------------------------------------

/// The host's not-yet-assigned initiator link.
struct SpareLink {
    link: Arc<dyn PeerLink>,
    offer: Option<SignalKind>,
    /// Candidates trickled before a joiner was picked.
    candidates: Vec<SignalKind>,
    published: bool,
}

struct Orchestrator {
    config: MeshConfig,
    local: ParticipantId,
    store: Arc<dyn SignalingStore>,
    transport: Arc<dyn PeerTransport>,
    registry: PeerRegistry,
    spare: Option<SpareLink>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    notifications: mpsc::UnboundedSender<MeshNotification>,
    ticks: mpsc::UnboundedSender<Tick>,
    link_events: LinkEventSender,
    links: SharedLinks,
    /// Counterparts not to initiate to again (retries exhausted or
    /// explicitly disconnected).
    abandoned: HashSet<ParticipantId>,
    host_id: Option<ParticipantId>,
    roster: Vec<ParticipantId>,
    heartbeat: Option<PeriodicTask>,
    poll: Option<PeriodicTask>,
    roster_refresh: Option<PeriodicTask>,
    offer_fetch: Option<PeriodicTask>,
    fetch_attempts: u32,
}

impl Orchestrator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut ticks: mpsc::UnboundedReceiver<Tick>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Leave(ack)) => {
                        commands.close();
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!(participant = %self.local, "All handles dropped, leaving");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(tick) = ticks.recv() => self.handle_tick(tick).await,
                Some(event) = link_events.recv() => self.handle_link_event(event).await,
            }
        }
    }

    fn is_star_host(&self) -> bool {
        self.config.mode == BootstrapMode::Star && self.config.role == Role::Host
    }

    fn is_star_joiner(&self) -> bool {
        self.config.mode == BootstrapMode::Star && self.config.role == Role::Joiner
    }

    fn notify(&self, notification: MeshNotification) {
        // The application may have dropped its receiver; the mesh keeps running.
        let _ = self.notifications.send(notification);
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(participant = %self.local, from = ?self.state, to = ?next, "Connection state changed");
        self.state = next;
        self.state_tx.send_replace(next);
        self.notify(MeshNotification::StateChanged(next));
    }

    fn signaling_error(&self, op: &'static str, error: &StoreError) {
        warn!(participant = %self.local, op, error = %error, "Signaling call failed");
        self.notify(MeshNotification::SignalingError {
            op,
            error: error.to_string(),
        });
    }

    // -- registration -------------------------------------------------------

    async fn register(&mut self) -> Result<(), MeshError> {
        self.set_state(ConnectionState::Registering);
        if let Err(e) = self.join().await {
            warn!(session = %self.config.session, error = %e, "Registration failed");
            self.set_state(ConnectionState::Disconnected);
            return Err(e.into());
        }
        info!(
            session = %self.config.session,
            participant = %self.local,
            role = ?self.config.role,
            mode = ?self.config.mode,
            "Registered with relay"
        );
        Ok(())
    }

    async fn join(&self) -> Result<(), StoreError> {
        let registration = Registration {
            id: self.local.clone(),
            display_name: self
                .config
                .display_name
                .clone()
                .unwrap_or_else(|| self.local.to_string()),
            role: self.config.role,
            password_hash: self.config.password_hash.clone(),
        };
        let session = &self.config.session;

        with_retry(&self.config.relay_retry, "join", || {
            self.store.join(session, registration.clone())
        })
        .await?;

        if self.is_star_joiner() && !self.bootstrapped() {
            with_retry(&self.config.relay_retry, "register_joiner", || {
                self.store.register_joiner(session, &self.local)
            })
            .await?;
        }
        Ok(())
    }

    fn start_tasks(&mut self) {
        self.heartbeat = Some(PeriodicTask::spawn(
            "heartbeat",
            self.config.heartbeat_interval,
            self.ticks.clone(),
            Tick::Heartbeat,
        ));
        self.poll = Some(PeriodicTask::spawn(
            "poll",
            self.config.poll_interval,
            self.ticks.clone(),
            Tick::Poll,
        ));
        self.roster_refresh = Some(PeriodicTask::spawn(
            "roster",
            self.config.roster_interval,
            self.ticks.clone(),
            Tick::Roster,
        ));

        if self.is_star_host() {
            self.create_spare();
        }
        if self.is_star_joiner() {
            self.offer_fetch = Some(PeriodicTask::spawn(
                "offer-fetch",
                self.config.offer_fetch_interval,
                self.ticks.clone(),
                Tick::OfferFetch,
            ));
        }

        self.set_state(ConnectionState::Connecting);
    }

    async fn shutdown(&mut self) {
        // Best effort and bounded: the relay prunes silent participants anyway.
        let removal = self
            .store
            .remove_participant(&self.config.session, &self.local);
        match tokio::time::timeout(self.config.leave_timeout, removal).await {
            Ok(Ok(_)) => info!(session = %self.config.session, participant = %self.local, "Left session"),
            Ok(Err(e)) => debug!(participant = %self.local, error = %e, "Leave request failed"),
            Err(_) => debug!(
                participant = %self.local,
                timeout_ms = self.config.leave_timeout.as_millis() as u64,
                "Leave request timed out"
            ),
        }

        self.heartbeat = None;
        self.poll = None;
        self.roster_refresh = None;
        self.offer_fetch = None;

        if let Some(spare) = self.spare.take() {
            spare.link.close();
        }

        let connected = self.registry.connected_peers();
        self.registry.clear();
        write_links(&self.links).clear();
        for peer in connected {
            self.notify(MeshNotification::PeerDisconnected { peer });
        }

        self.set_state(ConnectionState::Disconnected);
    }

    // -- commands -----------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(peer) => {
                if peer == self.local {
                    return;
                }
                self.abandoned.remove(&peer);
                if !self.registry.contains(&peer) {
                    self.initiate(peer, 0);
                }
            }
            Command::Disconnect(peer) => {
                self.abandoned.insert(peer.clone());
                if self.registry.remove(&peer).is_some() && read_links(&self.links).contains_key(&peer) {
                    self.on_link_down(&peer).await;
                }
            }
            Command::Leave(_) => {}
        }
    }

    // -- periodic tasks -----------------------------------------------------

    async fn handle_tick(&mut self, tick: Tick) {
        match tick {
            Tick::Heartbeat => self.heartbeat().await,
            Tick::Poll => self.poll().await,
            Tick::Roster => self.refresh_roster().await,
            Tick::OfferFetch => self.fetch_offer().await,
            Tick::RestartBootstrap => self.restart_bootstrap().await,
            Tick::HandshakeDeadline { peer, link_id } => {
                let current = self
                    .registry
                    .get(&peer)
                    .map(|h| h.link_id() == link_id && !h.is_connected())
                    .unwrap_or(false);
                if current {
                    self.handshake_failed(&peer, "handshake timed out");
                }
            }
        }
    }

    async fn heartbeat(&mut self) {
        let result = with_retry(&self.config.relay_retry, "heartbeat", || {
            self.store
                .touch_participant(&self.config.session, &self.local)
        })
        .await;

        match result {
            Ok(()) => trace!(participant = %self.local, "Heartbeat sent"),
            Err(StoreError::SessionNotFound(_)) | Err(StoreError::ParticipantNotFound { .. }) => {
                warn!(participant = %self.local, "Relay forgot us, re-registering");
                if let Err(e) = self.join().await {
                    self.signaling_error("join", &e);
                    return;
                }
                if let Some(spare) = self.spare.as_mut() {
                    spare.published = false;
                }
                self.publish_spare_offer().await;
                self.report_connections().await;
            }
            Err(e) => self.signaling_error("heartbeat", &e),
        }
    }

    async fn poll(&mut self) {
        if self.is_star_host() {
            if self.spare.is_none() {
                self.create_spare();
            }
            self.poll_answers().await;
            self.assign_pending_joiners().await;
        }
        self.poll_signals().await;
    }

    async fn poll_answers(&mut self) {
        let answers = match with_retry(&self.config.relay_retry, "poll_answers", || {
            self.store.poll_answers(&self.config.session)
        })
        .await
        {
            Ok(answers) => answers,
            Err(e) => {
                self.signaling_error("poll_answers", &e);
                return;
            }
        };

        for PendingAnswer { joiner_id, answer } in answers {
            let cleared = with_retry(&self.config.relay_retry, "clear_answer", || {
                self.store.clear_answer(&self.config.session, &joiner_id)
            })
            .await;
            if let Err(e) = cleared {
                self.signaling_error("clear_answer", &e);
            }
            self.handle_answer(joiner_id, answer).await;
        }
    }

    async fn handle_answer(&mut self, joiner: ParticipantId, answer: SignalMessage) {
        if !matches!(answer.kind, SignalKind::Answer(_)) {
            warn!(joiner = %joiner, kind = answer.kind.name(), "Answer slot held a non-answer, ignoring");
            return;
        }

        if let Some(handle) = self.registry.get(&joiner) {
            if handle.role == LinkRole::Initiator
                && handle.signal_link_id == answer.link_id
                && !handle.is_connected()
            {
                self.feed_signal(&joiner, answer.kind);
            } else {
                debug!(joiner = %joiner, link = %answer.link_id, "Ignoring stale answer");
            }
            return;
        }

        let for_spare = self
            .spare
            .as_ref()
            .map(|spare| spare.link.id() == answer.link_id)
            .unwrap_or(false);
        if for_spare {
            self.bind_spare(&joiner).await;
            self.feed_signal(&joiner, answer.kind);
            return;
        }

        // The joiner answered an offer that was meanwhile given to someone
        // else; it gets a fresh one through its signal queue.
        info!(joiner = %joiner, link = %answer.link_id, "Answer for a retired offer, re-offering");
        self.initiate(joiner, 0);
    }

    async fn assign_pending_joiners(&mut self) {
        let joiners = match with_retry(&self.config.relay_retry, "pending_joiners", || {
            self.store.pending_joiners(&self.config.session)
        })
        .await
        {
            Ok(joiners) => joiners,
            Err(e) => {
                self.signaling_error("pending_joiners", &e);
                return;
            }
        };

        for joiner in joiners {
            // Already handshaking through an answer or a re-offer.
            if joiner == self.local || self.registry.contains(&joiner) {
                continue;
            }

            let Some((link_id, offer)) = self
                .spare
                .as_ref()
                .and_then(|spare| spare.offer.clone().map(|offer| (spare.link.id(), offer)))
            else {
                // Spare offer not ready yet; next poll.
                break;
            };

            let message = SignalMessage::new(link_id, offer);
            let assigned = with_retry(&self.config.relay_retry, "set_joiner_offer", || {
                self.store.set_joiner_offer(
                    &self.config.session,
                    &joiner,
                    message.clone(),
                    &self.local,
                )
            })
            .await;

            match assigned {
                Ok(()) => self.bind_spare(&joiner).await,
                Err(e) => {
                    self.signaling_error("set_joiner_offer", &e);
                    break;
                }
            }
        }
    }

    async fn poll_signals(&mut self) {
        let envelopes = match with_retry(&self.config.relay_retry, "poll_signals", || {
            self.store
                .poll_signals_for(&self.config.session, &self.local)
        })
        .await
        {
            Ok(envelopes) => envelopes,
            Err(e) => {
                self.signaling_error("poll_signals", &e);
                return;
            }
        };
        if envelopes.is_empty() {
            return;
        }

        let mut through: HashMap<ParticipantId, u64> = HashMap::new();
        for envelope in envelopes {
            let seq = through.entry(envelope.from.clone()).or_insert(0);
            *seq = (*seq).max(envelope.seq);
            trace!(from = %envelope.from, seq = envelope.seq, kind = envelope.signal.kind.name(), "Signal received");
            self.handle_signal(envelope.from, envelope.signal).await;
        }

        for (from, seq) in through {
            let cleared = with_retry(&self.config.relay_retry, "clear_signal", || {
                self.store
                    .clear_signal(&self.config.session, &from, &self.local, seq)
            })
            .await;
            if let Err(e) = cleared {
                self.signaling_error("clear_signal", &e);
            }
        }
    }

    async fn refresh_roster(&mut self) {
        let roster = match with_retry(&self.config.relay_retry, "list_participants", || {
            self.store
                .list_participants(&self.config.session, Some(&self.local))
        })
        .await
        {
            Ok(roster) => roster,
            Err(e) => {
                self.signaling_error("list_participants", &e);
                return;
            }
        };

        let ids: Vec<ParticipantId> = roster.into_iter().map(|info| info.id).collect();
        if ids != self.roster {
            debug!(participant = %self.local, count = ids.len(), "Roster changed");
            self.roster = ids.clone();
            self.notify(MeshNotification::RosterChanged {
                participants: ids.clone(),
            });
        }

        let present: HashSet<ParticipantId> = ids.iter().cloned().collect();
        for peer in self.registry.peers() {
            let handshaking = self
                .registry
                .get(&peer)
                .map(|h| !h.is_connected())
                .unwrap_or(false);
            if handshaking && !present.contains(&peer) {
                debug!(peer = %peer, "Participant left during handshake, dropping link");
                self.registry.remove(&peer);
            }
        }
        self.abandoned.retain(|peer| present.contains(peer));

        if self.config.mode == BootstrapMode::Mesh {
            for peer in ids {
                if self.registry.len() >= self.config.max_peers {
                    break;
                }
                if self.registry.contains(&peer) || self.abandoned.contains(&peer) {
                    continue;
                }
                self.initiate(peer, 0);
            }
        }
    }

    async fn fetch_offer(&mut self) {
        if self.bootstrapped() {
            self.offer_fetch = None;
            return;
        }
        self.fetch_attempts += 1;

        let dedicated = with_retry(&self.config.relay_retry, "joiner_offer", || {
            self.store.joiner_offer(&self.config.session, &self.local)
        })
        .await;

        let record = match dedicated {
            Ok(Some(record)) => Some(record),
            Ok(None) if self.config.shared_offer_fallback => {
                match with_retry(&self.config.relay_retry, "fetch_offer", || {
                    self.store.fetch_offer(&self.config.session)
                })
                .await
                {
                    Ok(record) => record,
                    Err(e) => {
                        self.signaling_error("fetch_offer", &e);
                        None
                    }
                }
            }
            Ok(None) => None,
            Err(e) => {
                self.signaling_error("joiner_offer", &e);
                None
            }
        };

        if let Some(record) = record {
            info!(
                participant = %self.local,
                host = %record.host_id,
                attempt = self.fetch_attempts,
                "Received host offer"
            );
            self.offer_fetch = None;
            self.host_id = Some(record.host_id.clone());
            self.accept_offer(record.host_id, record.offer, true);
            return;
        }

        if self.fetch_attempts >= self.config.offer_fetch_attempts {
            self.offer_fetch = None;
            let reason = format!("no offer from host after {} attempts", self.fetch_attempts);
            warn!(participant = %self.local, "{reason}");
            self.notify(MeshNotification::BootstrapFailed { reason });
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Ask the host for a fresh offer after the bootstrap handshake broke
    /// down, as long as fetch attempts remain.
    async fn restart_bootstrap(&mut self) {
        if self.offer_fetch.is_some() || self.bootstrapped() || self.registry.connected_count() > 0 {
            return;
        }
        self.host_id = None;

        if self.fetch_attempts >= self.config.offer_fetch_attempts {
            let reason = format!(
                "handshake with host failed, no offer fetch left after {} attempts",
                self.fetch_attempts
            );
            warn!(participant = %self.local, "{reason}");
            self.notify(MeshNotification::BootstrapFailed { reason });
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        // Drop the dead offer and queue up for a new one.
        let session = &self.config.session;
        let cleared = with_retry(&self.config.relay_retry, "clear_joiner_offer", || {
            self.store.clear_joiner_offer(session, &self.local)
        })
        .await;
        if let Err(e) = cleared {
            self.signaling_error("clear_joiner_offer", &e);
        }
        let registered = with_retry(&self.config.relay_retry, "register_joiner", || {
            self.store.register_joiner(session, &self.local)
        })
        .await;
        if let Err(e) = registered {
            self.signaling_error("register_joiner", &e);
        }

        info!(participant = %self.local, attempts = self.fetch_attempts, "Restarting offer fetch");
        self.offer_fetch = Some(PeriodicTask::spawn(
            "offer-fetch",
            self.config.offer_fetch_interval,
            self.ticks.clone(),
            Tick::OfferFetch,
        ));
        self.set_state(ConnectionState::Connecting);
    }

    /// A star joiner lost its only handshake with the host.
    fn bootstrap_lost(&self, peer: &ParticipantId) {
        let from_host = self.host_id.as_ref().map(|host| host == peer).unwrap_or(true);
        if self.is_star_joiner() && from_host && self.registry.connected_count() == 0 {
            let _ = self.ticks.send(Tick::RestartBootstrap);
        }
    }

    /// A joiner has a link (in any state) to the host.
    fn bootstrapped(&self) -> bool {
        self.host_id
            .as_ref()
            .map(|host| self.registry.contains(host))
            .unwrap_or(false)
    }

    // -- signals ------------------------------------------------------------

    async fn handle_signal(&mut self, from: ParticipantId, signal: SignalMessage) {
        if from == self.local {
            return;
        }
        match signal.kind {
            SignalKind::Offer(_) => self.handle_remote_offer(from, signal).await,
            SignalKind::Answer(_) | SignalKind::Candidate(_) => {
                let current = self
                    .registry
                    .get(&from)
                    .map(|h| {
                        h.signal_link_id == signal.link_id
                            && !(h.is_connected() && matches!(signal.kind, SignalKind::Answer(_)))
                    })
                    .unwrap_or(false);
                if current {
                    self.feed_signal(&from, signal.kind);
                } else {
                    debug!(from = %from, link = %signal.link_id, kind = signal.kind.name(), "Dropping stale signal");
                }
            }
        }
    }

    async fn handle_remote_offer(&mut self, from: ParticipantId, offer: SignalMessage) {
        let mut was_connected = false;
        if let Some(handle) = self.registry.get(&from) {
            match handle.role {
                LinkRole::Initiator if !handle.is_connected() => {
                    if self.local > from {
                        info!(peer = %from, "Offer collision, accepting remote offer");
                    } else {
                        debug!(peer = %from, "Offer collision, keeping local offer");
                        return;
                    }
                }
                LinkRole::Responder if handle.signal_link_id == offer.link_id => {
                    debug!(peer = %from, link = %offer.link_id, "Duplicate offer");
                    return;
                }
                _ => {
                    info!(peer = %from, "Peer restarted its link, replacing");
                    was_connected = handle.is_connected();
                }
            }
        }

        if was_connected {
            self.registry.remove(&from);
            self.on_link_down(&from).await;
        }

        if self.is_star_joiner() && self.offer_fetch.is_some() {
            self.offer_fetch = None;
            if self.host_id.is_none() {
                self.host_id = Some(from.clone());
            }
        }
        self.abandoned.remove(&from);
        self.accept_offer(from, offer, false);
    }

    /// Hand a remote signal to the link held for `peer`.
    fn feed_signal(&mut self, peer: &ParticipantId, signal: SignalKind) {
        let Some(handle) = self.registry.get_mut(peer) else {
            return;
        };
        if handle.state == LinkState::Created {
            handle.state = LinkState::Handshaking;
        }
        if let Err(e) = handle.link.signal(signal) {
            warn!(peer = %peer, error = %e, "Link rejected signal");
            self.handshake_failed(peer, &e.to_string());
        }
    }

    // -- link lifecycle -----------------------------------------------------

    fn deadline(&self, peer: &ParticipantId, link_id: Uuid) -> DeadlineTimer {
        DeadlineTimer::spawn(
            self.config.handshake_timeout,
            self.ticks.clone(),
            Tick::HandshakeDeadline {
                peer: peer.clone(),
                link_id,
            },
        )
    }

    fn create_link(
        &self,
        link_id: Uuid,
        role: LinkRole,
        remote: Option<ParticipantId>,
    ) -> Option<Arc<dyn PeerLink>> {
        let config = LinkConfig {
            link_id,
            role,
            local: self.local.clone(),
            remote,
        };
        match self.transport.create_link(config, self.link_events.clone()) {
            Ok(link) => Some(link),
            Err(e) => {
                warn!(participant = %self.local, role = ?role, error = %e, "Failed to create link");
                None
            }
        }
    }

    /// Start (or restart) an outbound handshake with `peer`.
    fn initiate(&mut self, peer: ParticipantId, attempt: u32) {
        let link_id = Uuid::new_v4();
        let Some(link) = self.create_link(link_id, LinkRole::Initiator, Some(peer.clone())) else {
            self.notify(MeshNotification::PeerFailed {
                peer,
                reason: "transport refused to create a link".into(),
            });
            return;
        };

        let mut handle = PeerLinkHandle::new(peer.clone(), link, link_id);
        handle.attempt = attempt;
        handle.set_deadline(self.deadline(&peer, link_id));
        info!(participant = %self.local, peer = %peer, attempt, link = %link_id, "Initiating link");
        self.registry.insert(handle);
    }

    /// Answer an offer from `from`. `answer_via_slot` routes the answer to
    /// the relay's answer slot (star bootstrap) instead of the signal queue.
    fn accept_offer(&mut self, from: ParticipantId, offer: SignalMessage, answer_via_slot: bool) {
        let link_id = Uuid::new_v4();
        let Some(link) = self.create_link(link_id, LinkRole::Responder, Some(from.clone())) else {
            return;
        };

        let mut handle = PeerLinkHandle::new(from.clone(), Arc::clone(&link), offer.link_id);
        handle.answer_via_slot = answer_via_slot;
        handle.state = LinkState::Handshaking;
        handle.set_deadline(self.deadline(&from, link_id));
        debug!(participant = %self.local, peer = %from, link = %link_id, "Accepting offer");
        self.registry.insert(handle);

        if let Err(e) = link.signal(offer.kind) {
            warn!(peer = %from, error = %e, "Link rejected offer");
            self.registry.remove(&from);
            self.bootstrap_lost(&from);
        }
    }

    /// A handshake with `peer` timed out or broke: retry initiators, drop
    /// responders.
    fn handshake_failed(&mut self, peer: &ParticipantId, reason: &str) {
        let Some(handle) = self.registry.get(peer) else {
            return;
        };
        if handle.is_connected() {
            return;
        }
        let (role, attempt) = (handle.role, handle.attempt);

        match role {
            LinkRole::Initiator if attempt < self.config.max_handshake_retries => {
                info!(peer = %peer, attempt = attempt + 1, reason, "Retrying handshake");
                self.initiate(peer.clone(), attempt + 1);
            }
            LinkRole::Initiator => {
                self.registry.fail(peer);
                self.abandoned.insert(peer.clone());
                let reason = format!("{reason} after {} attempts", attempt + 1);
                warn!(peer = %peer, reason = %reason, "Giving up on peer");
                self.notify(MeshNotification::PeerFailed {
                    peer: peer.clone(),
                    reason,
                });
                if self.registry.connected_count() == 0 && self.is_star_joiner() {
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            LinkRole::Responder => {
                debug!(peer = %peer, reason, "Dropping inbound handshake");
                self.registry.remove(peer);
                self.bootstrap_lost(peer);
            }
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        let from_spare = self
            .spare
            .as_ref()
            .map(|spare| spare.link.id() == event.link_id)
            .unwrap_or(false);
        if from_spare {
            self.handle_spare_event(event.kind).await;
            return;
        }

        let Some(peer) = self.registry.counterpart_of(&event.link_id).cloned() else {
            trace!(link = %event.link_id, "Ignoring event from retired link");
            return;
        };

        match event.kind {
            LinkEventKind::Signal(signal) => self.relay_local_signal(&peer, signal).await,
            LinkEventKind::Connect => self.on_link_up(&peer).await,
            LinkEventKind::Data(data) => self.on_data(&peer, data),
            LinkEventKind::Close => self.on_link_closed(&peer).await,
            LinkEventKind::Error(reason) => {
                warn!(peer = %peer, error = %reason, "Link error");
                self.handshake_failed(&peer, &reason);
            }
        }
    }

    /// Deliver a handshake artifact produced by our link for `peer`.
    async fn relay_local_signal(&mut self, peer: &ParticipantId, signal: SignalKind) {
        let Some(handle) = self.registry.get_mut(peer) else {
            return;
        };
        if handle.state == LinkState::Created {
            handle.state = LinkState::Handshaking;
        }
        let via_slot = handle.answer_via_slot && matches!(signal, SignalKind::Answer(_));
        let message = SignalMessage::new(handle.signal_link_id, signal);

        if via_slot {
            let result = with_retry(&self.config.relay_retry, "submit_answer", || {
                self.store
                    .submit_answer(&self.config.session, message.clone(), &self.local)
            })
            .await;
            if let Err(e) = result {
                self.signaling_error("submit_answer", &e);
            }
        } else {
            let result = with_retry(&self.config.relay_retry, "publish_signal", || {
                self.store.publish_signal(
                    &self.config.session,
                    &self.local,
                    peer,
                    message.clone(),
                )
            })
            .await;
            if let Err(e) = result {
                self.signaling_error("publish_signal", &e);
            }
        }
    }

    async fn on_link_up(&mut self, peer: &ParticipantId) {
        let Some(handle) = self.registry.get_mut(peer) else {
            return;
        };
        handle.state = LinkState::Connected;
        handle.clear_deadline();
        let link = Arc::clone(&handle.link);
        let elapsed_ms = handle.created_at.elapsed().as_millis() as u64;

        self.abandoned.remove(peer);
        write_links(&self.links).insert(peer.clone(), link);
        info!(participant = %self.local, peer = %peer, elapsed_ms, "Peer connected");
        self.notify(MeshNotification::PeerConnected { peer: peer.clone() });
        self.set_state(ConnectionState::Connected);
        self.report_connections().await;

        if self.is_star_host() {
            let cleared = with_retry(&self.config.relay_retry, "clear_joiner_offer", || {
                self.store.clear_joiner_offer(&self.config.session, peer)
            })
            .await;
            if let Err(e) = cleared {
                self.signaling_error("clear_joiner_offer", &e);
            }
            self.broadcast_roster();
        }
    }

    async fn on_link_closed(&mut self, peer: &ParticipantId) {
        let connected = match self.registry.get(peer) {
            Some(handle) => handle.is_connected(),
            None => return,
        };
        if connected {
            self.registry.remove(peer);
            self.on_link_down(peer).await;
        } else {
            self.handshake_failed(peer, "link closed during handshake");
        }
    }

    /// Bookkeeping after a connected link to `peer` went away.
    async fn on_link_down(&mut self, peer: &ParticipantId) {
        write_links(&self.links).remove(peer);
        info!(participant = %self.local, peer = %peer, "Peer disconnected");
        self.notify(MeshNotification::PeerDisconnected { peer: peer.clone() });

        let next = if self.registry.connected_count() > 0 {
            ConnectionState::PartiallyConnected
        } else {
            ConnectionState::Disconnected
        };
        self.set_state(next);
        self.report_connections().await;

        if self.is_star_host() {
            self.broadcast_roster();
        }
    }

    fn on_data(&self, peer: &ParticipantId, data: Bytes) {
        if let Ok(PeerMessage::Roster(update)) = PeerMessage::from_bytes(&data) {
            debug!(from = %peer, participants = update.participants.len(), "Host roster received");
            self.notify(MeshNotification::HostRoster(update));
            return;
        }
        self.notify(MeshNotification::Data {
            peer: peer.clone(),
            data,
        });
    }

    async fn report_connections(&self) {
        let connected = self.registry.connected_peers();
        let result = with_retry(&self.config.relay_retry, "set_connected_to", || {
            self.store
                .set_connected_to(&self.config.session, &self.local, connected.clone())
        })
        .await;
        if let Err(e) = result {
            self.signaling_error("set_connected_to", &e);
        }
    }

    /// Tell every connected joiner who the host is connected to.
    fn broadcast_roster(&self) {
        let peers = self.registry.connected_peers();
        if peers.is_empty() {
            return;
        }

        let mut participants = peers.clone();
        participants.push(self.local.clone());
        participants.sort();
        let frame = PeerMessage::Roster(RosterUpdate {
            host: self.local.clone(),
            participants,
        });
        let bytes = match frame.to_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(error = %e, "Failed to encode roster frame");
                return;
            }
        };

        for peer in peers {
            if let Some(handle) = self.registry.get(&peer) {
                if let Err(e) = handle.link.send(bytes.clone()) {
                    debug!(peer = %peer, error = %e, "Roster frame not delivered");
                }
            }
        }
    }

    // -- host spare link ----------------------------------------------------

    fn create_spare(&mut self) {
        let link_id = Uuid::new_v4();
        if let Some(link) = self.create_link(link_id, LinkRole::Initiator, None) {
            debug!(participant = %self.local, link = %link_id, "Prepared spare offer link");
            self.spare = Some(SpareLink {
                link,
                offer: None,
                candidates: Vec::new(),
                published: false,
            });
        }
    }

    async fn handle_spare_event(&mut self, kind: LinkEventKind) {
        match kind {
            LinkEventKind::Signal(SignalKind::Offer(sdp)) => {
                if let Some(spare) = self.spare.as_mut() {
                    spare.offer = Some(SignalKind::Offer(sdp));
                    spare.published = false;
                }
                self.publish_spare_offer().await;
            }
            LinkEventKind::Signal(signal) => {
                if let Some(spare) = self.spare.as_mut() {
                    spare.candidates.push(signal);
                }
            }
            LinkEventKind::Close | LinkEventKind::Error(_) => {
                warn!(participant = %self.local, "Spare offer link failed, replacing");
                if let Some(spare) = self.spare.take() {
                    spare.link.close();
                }
                self.create_spare();
            }
            LinkEventKind::Connect | LinkEventKind::Data(_) => {}
        }
    }

    async fn publish_spare_offer(&mut self) {
        let Some((link_id, offer)) = self.spare.as_ref().and_then(|spare| {
            if spare.published {
                None
            } else {
                spare.offer.clone().map(|offer| (spare.link.id(), offer))
            }
        }) else {
            return;
        };

        let message = SignalMessage::new(link_id, offer);
        let result = with_retry(&self.config.relay_retry, "publish_offer", || {
            self.store
                .publish_offer(&self.config.session, message.clone(), &self.local)
        })
        .await;

        match result {
            Ok(()) => {
                debug!(participant = %self.local, link = %link_id, "Published shared offer");
                if let Some(spare) = self.spare.as_mut() {
                    if spare.link.id() == link_id {
                        spare.published = true;
                    }
                }
            }
            Err(e) => self.signaling_error("publish_offer", &e),
        }
    }

    /// Dedicate the spare link to `joiner` and prepare a new spare.
    async fn bind_spare(&mut self, joiner: &ParticipantId) {
        let Some(spare) = self.spare.take() else {
            return;
        };
        let link_id = spare.link.id();

        let mut handle = PeerLinkHandle::new(joiner.clone(), spare.link, link_id);
        handle.state = LinkState::Handshaking;
        handle.set_deadline(self.deadline(joiner, link_id));
        self.registry.insert(handle);
        info!(participant = %self.local, joiner = %joiner, link = %link_id, "Offer assigned to joiner");

        for candidate in spare.candidates {
            let message = SignalMessage::new(link_id, candidate);
            let result = with_retry(&self.config.relay_retry, "publish_signal", || {
                self.store.publish_signal(
                    &self.config.session,
                    &self.local,
                    joiner,
                    message.clone(),
                )
            })
            .await;
            if let Err(e) = result {
                self.signaling_error("publish_signal", &e);
            }
        }

        self.create_spare();
    }
}
