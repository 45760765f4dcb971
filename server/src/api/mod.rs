//! HTTP surfaces of the host.
//!
//! Three routers: the plain-HTTP Moonlight endpoint (pairing), the
//! mutual-TLS Moonlight endpoint (launch and friends) and the localhost
//! admin API. The Moonlight wire format is the GameStream XML; the admin
//! API speaks JSON.

pub mod admin;
pub mod launch;
pub mod pair;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::error::HostError;
use crate::state::AppState;

/// GameStream XML envelope: `<root status_code="...">` with one element per
/// field.
pub fn xml_response(status_code: u16, fields: &[(&str, String)]) -> String {
    let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\r\n");
    body.push_str(&format!("<root status_code=\"{}\">", status_code));
    for (name, value) in fields {
        body.push_str(&format!("<{}>{}</{}>", name, value, name));
    }
    body.push_str("</root>");
    body
}

/// A 200 reply with protocol-level success.
pub fn xml_ok(fields: &[(&str, String)]) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        xml_response(200, fields),
    )
        .into_response()
}

/// An error reply. The HTTP status carries the numeric kind (401/404/503);
/// the body keeps the envelope so clients always find `<root>`.
pub fn xml_error(error: &HostError) -> Response {
    let status = error.http_status();
    (
        status,
        [(header::CONTENT_TYPE, "application/xml")],
        xml_response(status.as_u16(), &[("error", error.to_string())]),
    )
        .into_response()
}

/// Router served over plain HTTP: the pairing handshake.
pub fn moonlight_http_router(state: AppState) -> Router {
    Router::new()
        .route("/pair", get(pair::pair_handler))
        .with_state(state)
}

/// Router served behind mutual TLS: everything that requires a paired
/// client certificate.
pub fn moonlight_https_router(state: AppState) -> Router {
    Router::new()
        .route("/applist", get(launch::applist_handler))
        .route("/launch", get(launch::launch_handler))
        .route("/resume", get(launch::resume_handler))
        .route("/cancel", get(launch::cancel_handler))
        .route("/unpair", get(launch::unpair_handler))
        .with_state(state)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        admin::pending_pair_requests,
        admin::submit_pin,
        admin::list_sessions,
        admin::stop_session,
        admin::pause_session,
        admin::resume_session,
    ),
    components(schemas(
        selene_types::PendingPairRequest,
        selene_types::PendingPairListResponse,
        selene_types::PairPinRequest,
        selene_types::PairResponse,
        selene_types::SessionInfo,
        selene_types::SessionListResponse,
        selene_types::ErrorResponse,
    )),
    tags(
        (name = "pairing", description = "PIN delivery for in-flight pairing handshakes"),
        (name = "sessions", description = "Active streaming session management")
    ),
    info(
        title = "Selene Admin API",
        description = "Localhost management API of the Selene streaming host",
        license(name = "MIT")
    )
)]
pub struct AdminApiDoc;

/// Localhost admin API router with Swagger UI.
pub fn admin_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/pairing/pending", get(admin::pending_pair_requests))
        .route("/pairing/pin", post(admin::submit_pin))
        .route("/sessions", get(admin::list_sessions))
        .route("/sessions/{id}/stop", post(admin::stop_session))
        .route("/sessions/{id}/pause", post(admin::pause_session))
        .route("/sessions/{id}/resume", post(admin::resume_session))
        .route("/events", get(admin::events_stream));

    Router::new()
        .route("/health", get(health))
        .merge(
            SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", AdminApiDoc::openapi()),
        )
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint.
async fn health() -> &'static str {
    "OK"
}
