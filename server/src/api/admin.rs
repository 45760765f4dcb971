//! Localhost admin API handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::Event;
use axum::response::Sse;
use axum::Json;
use futures::Stream;
use selene_types::{
    ErrorResponse, PairPinRequest, PairResponse, PendingPairListResponse, SessionListResponse,
};
use std::convert::Infallible;
use tracing::{info, warn};

use crate::error::HostError;
use crate::state::AppState;

/// List pairing handshakes waiting for their PIN.
#[utoipa::path(
    get,
    path = "/api/v1/pairing/pending",
    tag = "pairing",
    responses(
        (status = 200, description = "Handshakes awaiting a PIN", body = PendingPairListResponse)
    )
)]
pub async fn pending_pair_requests(State(state): State<AppState>) -> Json<PendingPairListResponse> {
    Json(PendingPairListResponse {
        requests: state.pairing().pending_requests(),
    })
}

/// Deliver the PIN the user read off the Moonlight client.
#[utoipa::path(
    post,
    path = "/api/v1/pairing/pin",
    tag = "pairing",
    request_body = PairPinRequest,
    responses(
        (status = 200, description = "PIN delivered", body = PairResponse),
        (status = 404, description = "No handshake with that secret", body = ErrorResponse)
    )
)]
pub async fn submit_pin(
    State(state): State<AppState>,
    Json(req): Json<PairPinRequest>,
) -> Result<Json<PairResponse>, (StatusCode, Json<ErrorResponse>)> {
    if state.pairing().fulfill_pin(&req.pair_secret, req.pin) {
        info!("PIN delivered for pairing {}", req.pair_secret);
        Ok(Json(PairResponse { success: true }))
    } else {
        warn!("PIN for unknown pairing secret {}", req.pair_secret);
        Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("Invalid pair secret")),
        ))
    }
}

/// List active streaming sessions.
#[utoipa::path(
    get,
    path = "/api/v1/sessions",
    tag = "sessions",
    responses(
        (status = 200, description = "Active sessions", body = SessionListResponse)
    )
)]
pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.session_infos(),
    })
}

fn lifecycle_result(
    result: Result<(), HostError>,
) -> Result<Json<PairResponse>, (StatusCode, Json<ErrorResponse>)> {
    match result {
        Ok(()) => Ok(Json(PairResponse { success: true })),
        Err(e) => Err((
            e.http_status(),
            Json(ErrorResponse::new(e.to_string())),
        )),
    }
}

/// Stop a session and release everything it holds.
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/stop",
    tag = "sessions",
    params(("id" = u64, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session stopped", body = PairResponse),
        (status = 404, description = "Unknown session", body = ErrorResponse)
    )
)]
pub async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<PairResponse>, (StatusCode, Json<ErrorResponse>)> {
    lifecycle_result(state.stop_session(id))
}

/// Pause a session's media pipelines.
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/pause",
    tag = "sessions",
    params(("id" = u64, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session paused", body = PairResponse),
        (status = 404, description = "Unknown session", body = ErrorResponse)
    )
)]
pub async fn pause_session(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<PairResponse>, (StatusCode, Json<ErrorResponse>)> {
    lifecycle_result(state.pause_session(id))
}

/// Resume a paused session.
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/resume",
    tag = "sessions",
    params(("id" = u64, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session resumed", body = PairResponse),
        (status = 404, description = "Unknown session", body = ErrorResponse)
    )
)]
pub async fn resume_session(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<PairResponse>, (StatusCode, Json<ErrorResponse>)> {
    lifecycle_result(state.resume_session(id))
}

/// Subscribe to host events (pairing requests, session lifecycle) over SSE.
pub async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(
        "New admin SSE client (total subscribers: {})",
        state.admin_events().subscriber_count() + 1
    );
    state.admin_events().subscribe()
}
