//! Process-wide in-memory signaling store.
//!
//! All sessions live in one map behind a `tokio::sync::RwLock`, which
//! serializes mutations. Every mutating call pushes the session's expiry to
//! `now + session_ttl` and refreshes the caller's last-seen time; a periodic
//! [`sweep`](MemoryStore::sweep) prunes silent participants and deletes
//! sessions that are both expired and empty.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use meshlink_shared::protocol::SignalMessage;
use meshlink_shared::{ParticipantId, Role, SessionId};

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::models::{
    OfferRecord, ParticipantInfo, PendingAnswer, Registration, Session, SignalEnvelope,
    SweepReport,
};
use crate::store::SignalingStore;

#[derive(Clone)]
pub struct MemoryStore {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Snapshot of a session, regardless of expiry.
    pub async fn session(&self, id: &SessionId) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Prune participants without a recent heartbeat and delete sessions
    /// that are expired and empty. Expired sessions that still have
    /// participants get their expiry advanced instead.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let cutoff = now - self.config.participant_timeout;
        let mut report = SweepReport::default();
        let mut sessions = self.sessions.write().await;

        for session in sessions.values_mut() {
            let stale = session.stale_participants(cutoff);
            for participant in stale {
                session.remove_participant(&participant);
                debug!(
                    session = %session.id,
                    participant = %participant,
                    "Pruned participant without heartbeat"
                );
                report
                    .removed_participants
                    .push((session.id.clone(), participant));
            }

            if session.is_empty() {
                let grace_deadline = now + self.config.empty_session_grace;
                if session.expires_at > grace_deadline {
                    session.expires_at = grace_deadline;
                }
            } else if session.is_expired(now) {
                session.expires_at = now + self.config.session_ttl;
            }
        }

        sessions.retain(|id, session| {
            let delete = session.is_empty() && session.is_expired(now);
            if delete {
                report.deleted_sessions.push(id.clone());
            }
            !delete
        });

        if !report.removed_participants.is_empty() || !report.deleted_sessions.is_empty() {
            info!(
                pruned = report.removed_participants.len(),
                deleted = report.deleted_sessions.len(),
                remaining = sessions.len(),
                "Signaling store sweep"
            );
        }

        report
    }

    /// Run [`sweep`](Self::sweep) forever on a background task.
    pub fn spawn_sweeper(&self, every: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                store.sweep().await;
            }
        })
    }

    fn refresh(&self, session: &mut Session, now: DateTime<Utc>) {
        session.expires_at = now + self.config.session_ttl;
    }

    fn new_session(&self, id: &SessionId, now: DateTime<Utc>) -> Session {
        info!(session = %id, "Created session");
        Session::new(id.clone(), now, now + self.config.session_ttl)
    }

    fn participant(id: &ParticipantId, name: &str, role: Role, now: DateTime<Utc>) -> ParticipantInfo {
        ParticipantInfo {
            id: id.clone(),
            display_name: name.to_string(),
            role,
            joined_at: now,
            last_seen: now,
            connected_to: Vec::new(),
        }
    }

    /// Apply `f` to a live session, then refresh its expiry and the actor's
    /// last-seen time.
    async fn mutate<T>(
        &self,
        id: &SessionId,
        actor: Option<&ParticipantId>,
        f: impl FnOnce(&mut Session, DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        let session = live_session_mut(&mut sessions, id, now)?;
        let out = f(session, now)?;
        self.refresh(session, now);
        if let Some(actor) = actor {
            session.touch(actor, now);
        }
        Ok(out)
    }

    async fn read<T>(&self, id: &SessionId, f: impl FnOnce(&Session) -> T) -> Result<T> {
        let now = self.clock.now();
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(session) if !(session.is_empty() && session.is_expired(now)) => Ok(f(session)),
            _ => Err(StoreError::SessionNotFound(id.clone())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

fn live_session_mut<'a>(
    sessions: &'a mut HashMap<SessionId, Session>,
    id: &SessionId,
    now: DateTime<Utc>,
) -> Result<&'a mut Session> {
    match sessions.get_mut(id) {
        Some(session) if !(session.is_empty() && session.is_expired(now)) => Ok(session),
        _ => Err(StoreError::SessionNotFound(id.clone())),
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn ensure_session(&self, session: &SessionId, host_id: &ParticipantId) -> Result<()> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;

        let expired_empty = sessions
            .get(session)
            .map(|s| s.is_empty() && s.is_expired(now))
            .unwrap_or(true);
        if expired_empty {
            sessions.insert(session.clone(), self.new_session(session, now));
        }

        let entry = sessions
            .get_mut(session)
            .ok_or_else(|| StoreError::SessionNotFound(session.clone()))?;
        entry
            .participants
            .entry(host_id.clone())
            .or_insert_with(|| Self::participant(host_id, host_id.as_str(), Role::Host, now));
        entry.host_id = Some(host_id.clone());
        self.refresh(entry, now);
        entry.touch(host_id, now);
        Ok(())
    }

    async fn join(
        &self,
        session: &SessionId,
        registration: Registration,
    ) -> Result<ParticipantInfo> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;

        let expired_empty = sessions
            .get(session)
            .map(|s| s.is_empty() && s.is_expired(now))
            .unwrap_or(true);
        if expired_empty {
            let mut fresh = self.new_session(session, now);
            fresh.password_hash = registration.password_hash.clone();
            sessions.insert(session.clone(), fresh);
        }

        let entry = sessions
            .get_mut(session)
            .ok_or_else(|| StoreError::SessionNotFound(session.clone()))?;

        if entry.password_hash.is_some() && entry.password_hash != registration.password_hash {
            warn!(session = %session, participant = %registration.id, "Join rejected: bad password");
            return Err(StoreError::AccessDenied(session.clone()));
        }

        let max = self.config.max_participants;
        if max > 0
            && !entry.participants.contains_key(&registration.id)
            && entry.participants.len() >= max
        {
            return Err(StoreError::SessionFull {
                session: session.clone(),
                max,
            });
        }

        let info = entry
            .participants
            .entry(registration.id.clone())
            .and_modify(|info| {
                info.display_name = registration.display_name.clone();
                info.role = registration.role;
                info.last_seen = now;
            })
            .or_insert_with(|| {
                Self::participant(&registration.id, &registration.display_name, registration.role, now)
            })
            .clone();

        if registration.role == Role::Host {
            entry.host_id = Some(registration.id.clone());
        }
        self.refresh(entry, now);

        info!(
            session = %session,
            participant = %info.id,
            role = ?info.role,
            participants = entry.participants.len(),
            "Participant joined"
        );
        Ok(info)
    }

    async fn publish_offer(
        &self,
        session: &SessionId,
        offer: SignalMessage,
        host_id: &ParticipantId,
    ) -> Result<()> {
        self.mutate(session, Some(host_id), |s, _| {
            s.host_id = Some(host_id.clone());
            s.shared_offer = Some(OfferRecord {
                host_id: host_id.clone(),
                offer,
            });
            Ok(())
        })
        .await
    }

    async fn fetch_offer(&self, session: &SessionId) -> Result<Option<OfferRecord>> {
        self.read(session, |s| s.shared_offer.clone()).await
    }

    async fn submit_answer(
        &self,
        session: &SessionId,
        answer: SignalMessage,
        joiner_id: &ParticipantId,
    ) -> Result<()> {
        self.mutate(session, Some(joiner_id), |s, _| {
            // An answering joiner already holds an offer.
            s.pending_joiners.remove(joiner_id);
            s.answers.insert(joiner_id.clone(), answer);
            Ok(())
        })
        .await
    }

    async fn poll_answers(&self, session: &SessionId) -> Result<Vec<PendingAnswer>> {
        self.read(session, |s| {
            s.answers
                .iter()
                .map(|(joiner_id, answer)| PendingAnswer {
                    joiner_id: joiner_id.clone(),
                    answer: answer.clone(),
                })
                .collect()
        })
        .await
    }

    async fn clear_answer(&self, session: &SessionId, joiner_id: &ParticipantId) -> Result<()> {
        self.mutate(session, None, |s, _| {
            s.answers.remove(joiner_id);
            Ok(())
        })
        .await
    }

    async fn register_joiner(
        &self,
        session: &SessionId,
        joiner_id: &ParticipantId,
    ) -> Result<()> {
        self.mutate(session, Some(joiner_id), |s, _| {
            if !s.joiner_offers.contains_key(joiner_id) {
                s.pending_joiners.insert(joiner_id.clone());
            }
            Ok(())
        })
        .await
    }

    async fn pending_joiners(&self, session: &SessionId) -> Result<Vec<ParticipantId>> {
        self.read(session, |s| {
            s.pending_joiners
                .iter()
                .filter(|j| !s.joiner_offers.contains_key(*j))
                .cloned()
                .collect()
        })
        .await
    }

    async fn set_joiner_offer(
        &self,
        session: &SessionId,
        joiner_id: &ParticipantId,
        offer: SignalMessage,
        host_id: &ParticipantId,
    ) -> Result<()> {
        self.mutate(session, Some(host_id), |s, _| {
            s.pending_joiners.remove(joiner_id);
            s.joiner_offers.insert(
                joiner_id.clone(),
                OfferRecord {
                    host_id: host_id.clone(),
                    offer,
                },
            );
            Ok(())
        })
        .await
    }

    async fn joiner_offer(
        &self,
        session: &SessionId,
        joiner_id: &ParticipantId,
    ) -> Result<Option<OfferRecord>> {
        self.read(session, |s| s.joiner_offers.get(joiner_id).cloned())
            .await
    }

    async fn clear_joiner_offer(
        &self,
        session: &SessionId,
        joiner_id: &ParticipantId,
    ) -> Result<()> {
        self.mutate(session, None, |s, _| {
            s.joiner_offers.remove(joiner_id);
            Ok(())
        })
        .await
    }

    async fn publish_signal(
        &self,
        session: &SessionId,
        from: &ParticipantId,
        to: &ParticipantId,
        signal: SignalMessage,
    ) -> Result<u64> {
        let max_queued = self.config.max_queued_signals;
        self.mutate(session, Some(from), |s, now| {
            let seq = s.next_seq;
            s.next_seq += 1;
            let queue = s.signals.entry((from.clone(), to.clone())).or_default();
            if max_queued > 0 && queue.len() >= max_queued {
                queue.pop_front();
                warn!(session = %s.id, from = %from, to = %to, "Signal queue full, dropped oldest");
            }
            queue.push_back(SignalEnvelope {
                seq,
                from: from.clone(),
                to: to.clone(),
                signal,
                sent_at: now,
            });
            Ok(seq)
        })
        .await
    }

    async fn poll_signals_for(
        &self,
        session: &SessionId,
        to: &ParticipantId,
    ) -> Result<Vec<SignalEnvelope>> {
        self.read(session, |s| {
            let mut out: Vec<SignalEnvelope> = s
                .signals
                .iter()
                .filter(|((_, recipient), _)| recipient == to)
                .flat_map(|(_, queue)| queue.iter().cloned())
                .collect();
            out.sort_by_key(|env| env.seq);
            out
        })
        .await
    }

    async fn clear_signal(
        &self,
        session: &SessionId,
        from: &ParticipantId,
        to: &ParticipantId,
        through_seq: u64,
    ) -> Result<()> {
        self.mutate(session, Some(to), |s, _| {
            let key = (from.clone(), to.clone());
            if let Some(queue) = s.signals.get_mut(&key) {
                queue.retain(|env| env.seq > through_seq);
                if queue.is_empty() {
                    s.signals.remove(&key);
                }
            }
            Ok(())
        })
        .await
    }

    async fn touch_participant(
        &self,
        session: &SessionId,
        participant: &ParticipantId,
    ) -> Result<()> {
        self.mutate(session, None, |s, now| {
            if s.touch(participant, now) {
                Ok(())
            } else {
                Err(StoreError::ParticipantNotFound {
                    session: s.id.clone(),
                    participant: participant.clone(),
                })
            }
        })
        .await
    }

    async fn set_connected_to(
        &self,
        session: &SessionId,
        participant: &ParticipantId,
        counterparts: Vec<ParticipantId>,
    ) -> Result<()> {
        self.mutate(session, Some(participant), |s, _| {
            let session_id = s.id.clone();
            let info = s.participants.get_mut(participant).ok_or_else(|| {
                StoreError::ParticipantNotFound {
                    session: session_id,
                    participant: participant.clone(),
                }
            })?;
            info.connected_to = counterparts;
            Ok(())
        })
        .await
    }

    async fn remove_participant(
        &self,
        session: &SessionId,
        participant: &ParticipantId,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(session) else {
            return Ok(false);
        };

        let removed = entry.remove_participant(participant);
        if entry.is_empty() {
            entry.expires_at = now + self.config.empty_session_grace;
        } else {
            self.refresh(entry, now);
        }

        if removed {
            info!(
                session = %session,
                participant = %participant,
                remaining = entry.participants.len(),
                "Participant left"
            );
        }
        Ok(removed)
    }

    async fn list_participants(
        &self,
        session: &SessionId,
        exclude: Option<&ParticipantId>,
    ) -> Result<Vec<ParticipantInfo>> {
        self.read(session, |s| {
            let mut roster: Vec<ParticipantInfo> = s
                .participants
                .values()
                .filter(|info| Some(&info.id) != exclude)
                .cloned()
                .collect();
            roster.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
            roster
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use meshlink_shared::protocol::SignalKind;
    use uuid::Uuid;

    fn setup() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryStore::with_clock(StoreConfig::default(), clock.clone());
        (store, clock)
    }

    fn room() -> SessionId {
        SessionId::parse("room-1").unwrap()
    }

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::from(s)
    }

    fn offer(sdp: &str) -> SignalMessage {
        SignalMessage::new(Uuid::new_v4(), SignalKind::Offer(sdp.into()))
    }

    #[tokio::test]
    async fn test_missing_session_is_not_found() {
        let (store, _) = setup();
        let err = store.fetch_offer(&room()).await.unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let (store, _) = setup();
        let host = pid("host");
        let joiner = pid("joiner");

        store.ensure_session(&room(), &host).await.unwrap();
        assert!(store.fetch_offer(&room()).await.unwrap().is_none());

        let sent = offer("v=0 host");
        store.publish_offer(&room(), sent.clone(), &host).await.unwrap();
        let fetched = store.fetch_offer(&room()).await.unwrap().unwrap();
        assert_eq!(fetched.offer, sent);
        assert_eq!(fetched.host_id, host);

        store
            .join(&room(), Registration::new(joiner.clone(), Role::Joiner))
            .await
            .unwrap();
        let answer = SignalMessage::new(sent.link_id, SignalKind::Answer("v=0 joiner".into()));
        store.submit_answer(&room(), answer.clone(), &joiner).await.unwrap();

        let answers = store.poll_answers(&room()).await.unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].joiner_id, joiner);
        assert_eq!(answers[0].answer, answer);

        store.clear_answer(&room(), &joiner).await.unwrap();
        assert!(store.poll_answers(&room()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_answer_clears_pending_joiner() {
        let (store, _) = setup();
        let host = pid("host");
        let joiner = pid("joiner");
        store.ensure_session(&room(), &host).await.unwrap();
        store.register_joiner(&room(), &joiner).await.unwrap();

        store.submit_answer(&room(), offer("answer"), &joiner).await.unwrap();
        assert!(store.pending_joiners(&room()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_joiner_offer_assignment() {
        let (store, _) = setup();
        let host = pid("host");
        let a = pid("a");
        let b = pid("b");
        store.ensure_session(&room(), &host).await.unwrap();
        store.register_joiner(&room(), &a).await.unwrap();
        store.register_joiner(&room(), &b).await.unwrap();
        assert_eq!(store.pending_joiners(&room()).await.unwrap(), vec![a.clone(), b.clone()]);

        let for_a = offer("for a");
        store.set_joiner_offer(&room(), &a, for_a.clone(), &host).await.unwrap();
        assert_eq!(store.pending_joiners(&room()).await.unwrap(), vec![b.clone()]);
        assert_eq!(
            store.joiner_offer(&room(), &a).await.unwrap().unwrap().offer,
            for_a
        );
        assert!(store.joiner_offer(&room(), &b).await.unwrap().is_none());

        store.clear_joiner_offer(&room(), &a).await.unwrap();
        assert!(store.joiner_offer(&room(), &a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_signals_are_ordered_and_cleared_through_seq() {
        let (store, _) = setup();
        let a = pid("a");
        let b = pid("b");
        store.ensure_session(&room(), &a).await.unwrap();

        let link = Uuid::new_v4();
        let s1 = store
            .publish_signal(&room(), &a, &b, SignalMessage::new(link, SignalKind::Offer("o".into())))
            .await
            .unwrap();
        let s2 = store
            .publish_signal(&room(), &a, &b, SignalMessage::new(link, SignalKind::Candidate("c".into())))
            .await
            .unwrap();
        assert!(s2 > s1);

        let pending = store.poll_signals_for(&room(), &b).await.unwrap();
        assert_eq!(pending.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![s1, s2]);
        assert!(store.poll_signals_for(&room(), &a).await.unwrap().is_empty());

        // A signal published after the poll survives the clear.
        let s3 = store
            .publish_signal(&room(), &a, &b, SignalMessage::new(link, SignalKind::Candidate("late".into())))
            .await
            .unwrap();
        store.clear_signal(&room(), &a, &b, s2).await.unwrap();
        let rest = store.poll_signals_for(&room(), &b).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].seq, s3);
    }

    #[tokio::test]
    async fn test_password_protected_join() {
        let (store, _) = setup();
        let mut host = Registration::new(pid("host"), Role::Host);
        host.password_hash = Some("hash".into());
        store.join(&room(), host).await.unwrap();

        let intruder = Registration::new(pid("x"), Role::Joiner);
        assert!(matches!(
            store.join(&room(), intruder).await,
            Err(StoreError::AccessDenied(_))
        ));

        let mut guest = Registration::new(pid("guest"), Role::Joiner);
        guest.password_hash = Some("hash".into());
        assert!(store.join(&room(), guest).await.is_ok());
    }

    #[tokio::test]
    async fn test_session_full() {
        let clock = Arc::new(ManualClock::default());
        let config = StoreConfig {
            max_participants: 2,
            ..StoreConfig::default()
        };
        let store = MemoryStore::with_clock(config, clock);
        store.join(&room(), Registration::new(pid("a"), Role::Host)).await.unwrap();
        store.join(&room(), Registration::new(pid("b"), Role::Joiner)).await.unwrap();
        // Re-joining is fine, a third participant is not.
        store.join(&room(), Registration::new(pid("b"), Role::Joiner)).await.unwrap();
        assert!(matches!(
            store.join(&room(), Registration::new(pid("c"), Role::Joiner)).await,
            Err(StoreError::SessionFull { max: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_sweep_prunes_silent_participant_everywhere() {
        let (store, clock) = setup();
        let host = pid("host");
        let silent = pid("silent");
        store.ensure_session(&room(), &host).await.unwrap();
        store
            .join(&room(), Registration::new(silent.clone(), Role::Joiner))
            .await
            .unwrap();
        store.register_joiner(&room(), &silent).await.unwrap();
        store
            .submit_answer(&room(), offer("answer-ish"), &silent)
            .await
            .unwrap();
        store
            .publish_signal(&room(), &silent, &host, offer("to host"))
            .await
            .unwrap();
        store
            .publish_signal(&room(), &host, &silent, offer("to silent"))
            .await
            .unwrap();
        store
            .set_connected_to(&room(), &host, vec![silent.clone()])
            .await
            .unwrap();

        clock.advance(Duration::seconds(100));
        store.touch_participant(&room(), &host).await.unwrap();
        clock.advance(Duration::seconds(60));

        let report = store.sweep().await;
        assert_eq!(report.removed_participants, vec![(room(), silent.clone())]);
        assert!(report.deleted_sessions.is_empty());

        let roster = store.list_participants(&room(), None).await.unwrap();
        assert_eq!(roster.len(), 1);
        assert!(roster[0].connected_to.is_empty());
        assert!(store.poll_answers(&room()).await.unwrap().is_empty());
        assert!(store.pending_joiners(&room()).await.unwrap().is_empty());
        assert!(store.poll_signals_for(&room(), &host).await.unwrap().is_empty());
        assert!(store.poll_signals_for(&room(), &silent).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_session_never_deleted() {
        let (store, clock) = setup();
        let host = pid("host");
        store.ensure_session(&room(), &host).await.unwrap();

        // Heartbeats every minute for well past the 30 minute ttl, without
        // any other mutation.
        for _ in 0..45 {
            clock.advance(Duration::seconds(60));
            {
                let mut sessions = store.sessions.write().await;
                let s = sessions.get_mut(&room()).unwrap();
                s.touch(&host, clock.now());
            }
            let report = store.sweep().await;
            assert!(report.deleted_sessions.is_empty());
        }
        assert!(store.fetch_offer(&room()).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_session_deleted_after_grace() {
        let (store, clock) = setup();
        let host = pid("host");
        store.ensure_session(&room(), &host).await.unwrap();
        assert!(store.remove_participant(&room(), &host).await.unwrap());
        // Leaving twice is fine.
        assert!(!store.remove_participant(&room(), &host).await.unwrap());

        clock.advance(Duration::seconds(30));
        assert!(store.sweep().await.deleted_sessions.is_empty());
        assert_eq!(store.session_count().await, 1);

        clock.advance(Duration::seconds(31));
        assert_eq!(store.sweep().await.deleted_sessions, vec![room()]);
        assert_eq!(store.session_count().await, 0);
        assert!(matches!(
            store.fetch_offer(&room()).await,
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejoin_within_grace_keeps_session() {
        let (store, clock) = setup();
        let host = pid("host");
        store.ensure_session(&room(), &host).await.unwrap();
        store.remove_participant(&room(), &host).await.unwrap();
        clock.advance(Duration::seconds(20));
        store
            .join(&room(), Registration::new(host.clone(), Role::Host))
            .await
            .unwrap();
        clock.advance(Duration::seconds(120));
        assert!(store.sweep().await.deleted_sessions.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_participant() {
        let (store, _) = setup();
        store.ensure_session(&room(), &pid("host")).await.unwrap();
        let err = store
            .touch_participant(&room(), &pid("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ParticipantNotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_participants_excludes_caller() {
        let (store, clock) = setup();
        store.ensure_session(&room(), &pid("host")).await.unwrap();
        clock.advance(Duration::seconds(1));
        store
            .join(&room(), Registration::new(pid("j1"), Role::Joiner))
            .await
            .unwrap();
        let roster = store
            .list_participants(&room(), Some(&pid("host")))
            .await
            .unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].id, pid("j1"));
        assert_eq!(roster[0].role, Role::Joiner);
    }
}
