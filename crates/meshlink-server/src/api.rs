use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::Method,
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use meshlink_shared::{ParticipantId, SessionId};
use meshlink_store::api::{
    Ack, AnswersResponse, ClearSignalQuery, ConnectedRequest, EnsureSessionRequest,
    JoinersResponse, LeaveResponse, OfferResponse, ParticipantRequest, ParticipantsQuery,
    ParticipantsResponse, PublishOfferRequest, PublishSignalRequest, PublishSignalResponse,
    RegisterJoinerRequest, SetJoinerOfferRequest, SignalsResponse, SubmitAnswerRequest,
};
use meshlink_store::{MemoryStore, ParticipantInfo, Registration, SignalingStore};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            store: Arc::new(MemoryStore::new(config.store_config())),
            rate_limiter: RateLimiter::new(config.rate_limit_rps, config.rate_limit_burst),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let sessions = Router::new()
        .route("/:id", post(ensure_session))
        .route("/:id/join", post(join))
        .route("/:id/offer", post(publish_offer).get(fetch_offer))
        .route("/:id/answers", post(submit_answer).get(poll_answers))
        .route("/:id/answers/:joiner", delete(clear_answer))
        .route("/:id/joiners", post(register_joiner).get(pending_joiners))
        .route(
            "/:id/joiners/:joiner/offer",
            get(joiner_offer).put(set_joiner_offer).delete(clear_joiner_offer),
        )
        .route("/:id/signals", post(publish_signal))
        .route("/:id/signals/:to", get(poll_signals))
        .route("/:id/signals/:from/:to", delete(clear_signal))
        .route("/:id/heartbeat", post(heartbeat))
        .route("/:id/connected", post(set_connected))
        .route("/:id/leave", post(leave))
        .route("/:id/participants", get(list_participants));

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .nest("/sessions", sessions)
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    sessions: usize,
    max_participants: usize,
    uptime_secs: u64,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.store.session_count().await,
        max_participants: state.config.max_participants,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

fn session_id(raw: &str) -> Result<SessionId, ServerError> {
    SessionId::parse(raw).map_err(|e| ServerError::BadRequest(e.to_string()))
}

fn participant_id(raw: String) -> Result<ParticipantId, ServerError> {
    require(&ParticipantId::new(raw), "participant id")
}

fn require(id: &ParticipantId, what: &str) -> Result<ParticipantId, ServerError> {
    if id.as_str().is_empty() {
        return Err(ServerError::BadRequest(format!("{what} must not be empty")));
    }
    Ok(id.clone())
}

// ─── Session bootstrap ───

async fn ensure_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<EnsureSessionRequest>,
) -> Result<Json<Ack>, ServerError> {
    let session = session_id(&id)?;
    let host_id = require(&req.host_id, "host id")?;
    state.store.ensure_session(&session, &host_id).await?;
    Ok(Json(Ack::ok()))
}

async fn join(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(registration): Json<Registration>,
) -> Result<Json<ParticipantInfo>, ServerError> {
    let session = session_id(&id)?;
    require(&registration.id, "participant id")?;
    let info = state.store.join(&session, registration).await?;
    Ok(Json(info))
}

async fn publish_offer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PublishOfferRequest>,
) -> Result<Json<Ack>, ServerError> {
    let session = session_id(&id)?;
    let host_id = require(&req.host_id, "host id")?;
    state.store.publish_offer(&session, req.offer, &host_id).await?;
    debug!(session = %session, host = %host_id, "Offer published");
    Ok(Json(Ack::ok()))
}

async fn fetch_offer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OfferResponse>, ServerError> {
    let session = session_id(&id)?;
    let offer = state.store.fetch_offer(&session).await?;
    Ok(Json(OfferResponse { offer }))
}

async fn submit_answer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SubmitAnswerRequest>,
) -> Result<Json<Ack>, ServerError> {
    let session = session_id(&id)?;
    let joiner_id = require(&req.joiner_id, "joiner id")?;
    state.store.submit_answer(&session, req.answer, &joiner_id).await?;
    debug!(session = %session, joiner = %joiner_id, "Answer submitted");
    Ok(Json(Ack::ok()))
}

async fn poll_answers(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AnswersResponse>, ServerError> {
    let session = session_id(&id)?;
    let answers = state.store.poll_answers(&session).await?;
    Ok(Json(AnswersResponse { answers }))
}

async fn clear_answer(
    State(state): State<AppState>,
    Path((id, joiner)): Path<(String, String)>,
) -> Result<Json<Ack>, ServerError> {
    let session = session_id(&id)?;
    let joiner_id = participant_id(joiner)?;
    state.store.clear_answer(&session, &joiner_id).await?;
    Ok(Json(Ack::ok()))
}

// ─── Per-joiner offers ───

async fn register_joiner(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RegisterJoinerRequest>,
) -> Result<Json<Ack>, ServerError> {
    let session = session_id(&id)?;
    let joiner_id = require(&req.joiner_id, "joiner id")?;
    state.store.register_joiner(&session, &joiner_id).await?;
    Ok(Json(Ack::ok()))
}

async fn pending_joiners(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JoinersResponse>, ServerError> {
    let session = session_id(&id)?;
    let joiners = state.store.pending_joiners(&session).await?;
    Ok(Json(JoinersResponse { joiners }))
}

async fn set_joiner_offer(
    State(state): State<AppState>,
    Path((id, joiner)): Path<(String, String)>,
    Json(req): Json<SetJoinerOfferRequest>,
) -> Result<Json<Ack>, ServerError> {
    let session = session_id(&id)?;
    let joiner_id = participant_id(joiner)?;
    let host_id = require(&req.host_id, "host id")?;
    state
        .store
        .set_joiner_offer(&session, &joiner_id, req.offer, &host_id)
        .await?;
    Ok(Json(Ack::ok()))
}

async fn joiner_offer(
    State(state): State<AppState>,
    Path((id, joiner)): Path<(String, String)>,
) -> Result<Json<OfferResponse>, ServerError> {
    let session = session_id(&id)?;
    let joiner_id = participant_id(joiner)?;
    let offer = state.store.joiner_offer(&session, &joiner_id).await?;
    Ok(Json(OfferResponse { offer }))
}

async fn clear_joiner_offer(
    State(state): State<AppState>,
    Path((id, joiner)): Path<(String, String)>,
) -> Result<Json<Ack>, ServerError> {
    let session = session_id(&id)?;
    let joiner_id = participant_id(joiner)?;
    state.store.clear_joiner_offer(&session, &joiner_id).await?;
    Ok(Json(Ack::ok()))
}

// ─── Directed signals ───

async fn publish_signal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PublishSignalRequest>,
) -> Result<Json<PublishSignalResponse>, ServerError> {
    let session = session_id(&id)?;
    let from = require(&req.from, "sender id")?;
    let to = require(&req.to, "recipient id")?;
    let seq = state
        .store
        .publish_signal(&session, &from, &to, req.signal)
        .await?;
    Ok(Json(PublishSignalResponse { seq }))
}

async fn poll_signals(
    State(state): State<AppState>,
    Path((id, to)): Path<(String, String)>,
) -> Result<Json<SignalsResponse>, ServerError> {
    let session = session_id(&id)?;
    let to = participant_id(to)?;
    let signals = state.store.poll_signals_for(&session, &to).await?;
    Ok(Json(SignalsResponse { signals }))
}

async fn clear_signal(
    State(state): State<AppState>,
    Path((id, from, to)): Path<(String, String, String)>,
    Query(query): Query<ClearSignalQuery>,
) -> Result<Json<Ack>, ServerError> {
    let session = session_id(&id)?;
    let from = participant_id(from)?;
    let to = participant_id(to)?;
    state
        .store
        .clear_signal(&session, &from, &to, query.through)
        .await?;
    Ok(Json(Ack::ok()))
}

// ─── Presence ───

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ParticipantRequest>,
) -> Result<Json<Ack>, ServerError> {
    let session = session_id(&id)?;
    let participant = require(&req.participant_id, "participant id")?;
    state.store.touch_participant(&session, &participant).await?;
    Ok(Json(Ack::ok()))
}

async fn set_connected(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConnectedRequest>,
) -> Result<Json<Ack>, ServerError> {
    let session = session_id(&id)?;
    let participant = require(&req.participant_id, "participant id")?;
    state
        .store
        .set_connected_to(&session, &participant, req.connected_to)
        .await?;
    Ok(Json(Ack::ok()))
}

async fn leave(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ParticipantRequest>,
) -> Result<Json<LeaveResponse>, ServerError> {
    let session = session_id(&id)?;
    let participant = require(&req.participant_id, "participant id")?;
    let removed = state.store.remove_participant(&session, &participant).await?;
    Ok(Json(LeaveResponse { removed }))
}

async fn list_participants(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ParticipantsQuery>,
) -> Result<Json<ParticipantsResponse>, ServerError> {
    let session = session_id(&id)?;
    let participants = state
        .store
        .list_participants(&session, query.exclude.as_ref())
        .await?;
    Ok(Json(ParticipantsResponse { participants }))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(state, listener).await
}

pub async fn serve_on(state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Starting HTTP API server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
