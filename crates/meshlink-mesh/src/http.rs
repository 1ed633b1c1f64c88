//! HTTP client for a remote signaling relay.
//!
//! [`HttpRelay`] implements [`SignalingStore`] on top of the relay's JSON
//! endpoints, so an orchestrator can use a relay server exactly like an
//! in-process [`MemoryStore`](meshlink_store::MemoryStore). Error bodies are
//! mapped back to the [`StoreError`] variant the server started from;
//! transport failures become [`StoreError::Unavailable`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::trace;

use meshlink_shared::protocol::SignalMessage;
use meshlink_shared::{ParticipantId, SessionId};
use meshlink_store::api::{
    self, Ack, AnswersResponse, ClearSignalQuery, ConnectedRequest, EnsureSessionRequest,
    ErrorBody, JoinersResponse, LeaveResponse, OfferResponse, ParticipantRequest,
    ParticipantsResponse, PublishOfferRequest, PublishSignalRequest, PublishSignalResponse,
    RegisterJoinerRequest, SetJoinerOfferRequest, SignalsResponse, SubmitAnswerRequest,
};
use meshlink_store::{
    OfferRecord, ParticipantInfo, PendingAnswer, Registration, SignalEnvelope, SignalingStore,
    StoreError,
};

use crate::error::MeshError;

pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8080";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type StoreResult<T> = Result<T, StoreError>;

/// Signaling relay reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRelay {
    client: Client,
    base: Url,
}

impl HttpRelay {
    pub fn new(base_url: &str) -> Result<Self, MeshError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MeshError::Relay(e.to_string()))?;
        Self::with_client(client, base_url)
    }

    /// Use a pre-configured client (custom timeouts, proxies).
    pub fn with_client(client: Client, base_url: &str) -> Result<Self, MeshError> {
        let base = Url::parse(base_url)
            .map_err(|e| MeshError::InvalidConfig(format!("relay url {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(MeshError::InvalidConfig(format!(
                "relay url {base_url} cannot carry a path"
            )));
        }
        Ok(Self { client, base })
    }

    /// Relay from `MESHLINK_RELAY_URL`, defaulting to [`DEFAULT_RELAY_URL`].
    pub fn from_env() -> Result<Self, MeshError> {
        let url = std::env::var("MESHLINK_RELAY_URL").unwrap_or_else(|_| DEFAULT_RELAY_URL.into());
        Self::new(&url)
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, session: &SessionId, tail: &[&str]) -> StoreResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Invalid(format!("relay url {} cannot carry a path", self.base)))?
            .pop_if_empty()
            .push("sessions")
            .push(session.as_str())
            .extend(tail);
        Ok(url)
    }

    /// Send `request` and decode a successful JSON response.
    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        session: &SessionId,
        participant: Option<&ParticipantId>,
    ) -> StoreResult<T> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let status = response.status();
        trace!(status = status.as_u16(), url = %response.url(), "Relay response");

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| StoreError::Unavailable(format!("malformed relay response: {e}")));
        }

        let body = response.json::<ErrorBody>().await.ok();
        Err(map_error(status, body, session, participant))
    }
}

/// Rebuild the store error a relay reported.
fn map_error(
    status: StatusCode,
    body: Option<ErrorBody>,
    session: &SessionId,
    participant: Option<&ParticipantId>,
) -> StoreError {
    let Some(body) = body else {
        return match status {
            StatusCode::NOT_FOUND => StoreError::SessionNotFound(session.clone()),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                StoreError::Unavailable(format!("relay answered {s}"))
            }
            s => StoreError::Invalid(format!("relay answered {s}")),
        };
    };

    match body.code.as_str() {
        api::CODE_SESSION_NOT_FOUND => StoreError::SessionNotFound(session.clone()),
        api::CODE_PARTICIPANT_NOT_FOUND => match participant {
            Some(participant) => StoreError::ParticipantNotFound {
                session: session.clone(),
                participant: participant.clone(),
            },
            None => StoreError::Invalid(body.error),
        },
        api::CODE_ACCESS_DENIED => StoreError::AccessDenied(session.clone()),
        api::CODE_SESSION_FULL => StoreError::SessionFull {
            session: session.clone(),
            max: body.limit.unwrap_or_default(),
        },
        api::CODE_INVALID => StoreError::Invalid(body.error),
        _ => StoreError::Unavailable(body.error),
    }
}

#[async_trait]
impl SignalingStore for HttpRelay {
    async fn ensure_session(&self, session: &SessionId, host_id: &ParticipantId) -> StoreResult<()> {
        let request = self
            .client
            .post(self.url(session, &[])?)
            .json(&EnsureSessionRequest {
                host_id: host_id.clone(),
            });
        self.execute::<Ack>(request, session, Some(host_id)).await?;
        Ok(())
    }

    async fn join(&self, session: &SessionId, registration: Registration) -> StoreResult<ParticipantInfo> {
        let request = self.client.post(self.url(session, &["join"])?).json(&registration);
        self.execute(request, session, Some(&registration.id)).await
    }

    async fn publish_offer(
        &self,
        session: &SessionId,
        offer: SignalMessage,
        host_id: &ParticipantId,
    ) -> StoreResult<()> {
        let request = self
            .client
            .post(self.url(session, &["offer"])?)
            .json(&PublishOfferRequest {
                host_id: host_id.clone(),
                offer,
            });
        self.execute::<Ack>(request, session, Some(host_id)).await?;
        Ok(())
    }

    async fn fetch_offer(&self, session: &SessionId) -> StoreResult<Option<OfferRecord>> {
        let request = self.client.get(self.url(session, &["offer"])?);
        let response: OfferResponse = self.execute(request, session, None).await?;
        Ok(response.offer)
    }

    async fn submit_answer(
        &self,
        session: &SessionId,
        answer: SignalMessage,
        joiner_id: &ParticipantId,
    ) -> StoreResult<()> {
        let request = self
            .client
            .post(self.url(session, &["answers"])?)
            .json(&SubmitAnswerRequest {
                joiner_id: joiner_id.clone(),
                answer,
            });
        self.execute::<Ack>(request, session, Some(joiner_id)).await?;
        Ok(())
    }

    async fn poll_answers(&self, session: &SessionId) -> StoreResult<Vec<PendingAnswer>> {
        let request = self.client.get(self.url(session, &["answers"])?);
        let response: AnswersResponse = self.execute(request, session, None).await?;
        Ok(response.answers)
    }

    async fn clear_answer(&self, session: &SessionId, joiner_id: &ParticipantId) -> StoreResult<()> {
        let request = self
            .client
            .delete(self.url(session, &["answers", joiner_id.as_str()])?);
        self.execute::<Ack>(request, session, Some(joiner_id)).await?;
        Ok(())
    }

    async fn register_joiner(&self, session: &SessionId, joiner_id: &ParticipantId) -> StoreResult<()> {
        let request = self
            .client
            .post(self.url(session, &["joiners"])?)
            .json(&RegisterJoinerRequest {
                joiner_id: joiner_id.clone(),
            });
        self.execute::<Ack>(request, session, Some(joiner_id)).await?;
        Ok(())
    }

    async fn pending_joiners(&self, session: &SessionId) -> StoreResult<Vec<ParticipantId>> {
        let request = self.client.get(self.url(session, &["joiners"])?);
        let response: JoinersResponse = self.execute(request, session, None).await?;
        Ok(response.joiners)
    }

    async fn set_joiner_offer(
        &self,
        session: &SessionId,
        joiner_id: &ParticipantId,
        offer: SignalMessage,
        host_id: &ParticipantId,
    ) -> StoreResult<()> {
        let request = self
            .client
            .put(self.url(session, &["joiners", joiner_id.as_str(), "offer"])?)
            .json(&SetJoinerOfferRequest {
                host_id: host_id.clone(),
                offer,
            });
        self.execute::<Ack>(request, session, Some(host_id)).await?;
        Ok(())
    }

    async fn joiner_offer(
        &self,
        session: &SessionId,
        joiner_id: &ParticipantId,
    ) -> StoreResult<Option<OfferRecord>> {
        let request = self
            .client
            .get(self.url(session, &["joiners", joiner_id.as_str(), "offer"])?);
        let response: OfferResponse = self.execute(request, session, Some(joiner_id)).await?;
        Ok(response.offer)
    }

    async fn clear_joiner_offer(&self, session: &SessionId, joiner_id: &ParticipantId) -> StoreResult<()> {
        let request = self
            .client
            .delete(self.url(session, &["joiners", joiner_id.as_str(), "offer"])?);
        self.execute::<Ack>(request, session, Some(joiner_id)).await?;
        Ok(())
    }

    async fn publish_signal(
        &self,
        session: &SessionId,
        from: &ParticipantId,
        to: &ParticipantId,
        signal: SignalMessage,
    ) -> StoreResult<u64> {
        let request = self
            .client
            .post(self.url(session, &["signals"])?)
            .json(&PublishSignalRequest {
                from: from.clone(),
                to: to.clone(),
                signal,
            });
        let response: PublishSignalResponse = self.execute(request, session, Some(from)).await?;
        Ok(response.seq)
    }

    async fn poll_signals_for(&self, session: &SessionId, to: &ParticipantId) -> StoreResult<Vec<SignalEnvelope>> {
        let request = self.client.get(self.url(session, &["signals", to.as_str()])?);
        let response: SignalsResponse = self.execute(request, session, Some(to)).await?;
        Ok(response.signals)
    }

    async fn clear_signal(
        &self,
        session: &SessionId,
        from: &ParticipantId,
        to: &ParticipantId,
        through_seq: u64,
    ) -> StoreResult<()> {
        let request = self
            .client
            .delete(self.url(session, &["signals", from.as_str(), to.as_str()])?)
            .query(&ClearSignalQuery {
                through: through_seq,
            });
        self.execute::<Ack>(request, session, Some(to)).await?;
        Ok(())
    }

    async fn touch_participant(&self, session: &SessionId, participant: &ParticipantId) -> StoreResult<()> {
        let request = self
            .client
            .post(self.url(session, &["heartbeat"])?)
            .json(&ParticipantRequest {
                participant_id: participant.clone(),
            });
        self.execute::<Ack>(request, session, Some(participant)).await?;
        Ok(())
    }

    async fn set_connected_to(
        &self,
        session: &SessionId,
        participant: &ParticipantId,
        counterparts: Vec<ParticipantId>,
    ) -> StoreResult<()> {
        let request = self
            .client
            .post(self.url(session, &["connected"])?)
            .json(&ConnectedRequest {
                participant_id: participant.clone(),
                connected_to: counterparts,
            });
        self.execute::<Ack>(request, session, Some(participant)).await?;
        Ok(())
    }

    async fn remove_participant(&self, session: &SessionId, participant: &ParticipantId) -> StoreResult<bool> {
        let request = self
            .client
            .post(self.url(session, &["leave"])?)
            .json(&ParticipantRequest {
                participant_id: participant.clone(),
            });
        let response: LeaveResponse = self.execute(request, session, Some(participant)).await?;
        Ok(response.removed)
    }

    async fn list_participants(
        &self,
        session: &SessionId,
        exclude: Option<&ParticipantId>,
    ) -> StoreResult<Vec<ParticipantInfo>> {
        let mut request = self.client.get(self.url(session, &["participants"])?);
        if let Some(exclude) = exclude {
            request = request.query(&[("exclude", exclude.as_str())]);
        }
        let response: ParticipantsResponse = self.execute(request, session, None).await?;
        Ok(response.participants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> SessionId {
        SessionId::parse("room-1").unwrap()
    }

    fn body(code: &str) -> Option<ErrorBody> {
        Some(ErrorBody {
            error: format!("{code} happened"),
            code: code.to_string(),
            retryable: false,
            limit: Some(9),
        })
    }

    #[test]
    fn test_url_building() {
        let relay = HttpRelay::new("http://relay.local:8080/api/").unwrap();
        let url = relay
            .url(&room(), &["signals", "peer a/b"])
            .unwrap();
        assert_eq!(url.as_str(), "http://relay.local:8080/api/sessions/room-1/signals/peer%20a%2Fb");
    }

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(matches!(HttpRelay::new("not a url"), Err(MeshError::InvalidConfig(_))));
        assert!(matches!(HttpRelay::new("mailto:relay@example.com"), Err(MeshError::InvalidConfig(_))));
    }

    #[test]
    fn test_error_codes_map_back() {
        let alice = ParticipantId::from("alice");
        let status = StatusCode::NOT_FOUND;

        assert!(matches!(
            map_error(status, body(api::CODE_SESSION_NOT_FOUND), &room(), None),
            StoreError::SessionNotFound(_)
        ));
        assert!(matches!(
            map_error(status, body(api::CODE_PARTICIPANT_NOT_FOUND), &room(), Some(&alice)),
            StoreError::ParticipantNotFound { participant, .. } if participant == alice
        ));
        assert!(matches!(
            map_error(StatusCode::FORBIDDEN, body(api::CODE_ACCESS_DENIED), &room(), None),
            StoreError::AccessDenied(_)
        ));
        assert!(matches!(
            map_error(StatusCode::CONFLICT, body(api::CODE_SESSION_FULL), &room(), None),
            StoreError::SessionFull { max: 9, .. }
        ));
        assert!(matches!(
            map_error(StatusCode::TOO_MANY_REQUESTS, body(api::CODE_RATE_LIMITED), &room(), None),
            StoreError::Unavailable(_)
        ));
    }

    #[test]
    fn test_bodyless_errors() {
        assert!(matches!(
            map_error(StatusCode::NOT_FOUND, None, &room(), None),
            StoreError::SessionNotFound(_)
        ));
        assert!(matches!(
            map_error(StatusCode::BAD_GATEWAY, None, &room(), None),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_error(StatusCode::BAD_REQUEST, None, &room(), None),
            StoreError::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_unavailable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let relay = HttpRelay::new(&format!("http://127.0.0.1:{port}")).unwrap();
        let result = relay.fetch_offer(&room()).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
