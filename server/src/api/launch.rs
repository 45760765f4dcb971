//! Authenticated Moonlight endpoints: app listing and session lifecycle.
//!
//! All handlers here run behind mutual TLS; the paired client is resolved
//! from the presented certificate on every request.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::response::Response;
use axum::Extension;
use selene_types::DisplayMode;
use tracing::{info, warn};

use super::{xml_error, xml_ok};
use crate::error::HostError;
use crate::state::AppState;
use crate::tls::ClientConnection;

fn optional_u32(params: &HashMap<String, String>, name: &str) -> Option<u32> {
    params.get(name).and_then(|v| v.parse().ok())
}

/// `mode=1920x1080x60` from the launch query string.
fn parse_mode(params: &HashMap<String, String>) -> Option<DisplayMode> {
    let raw = params.get("mode")?;
    let mut parts = raw.split('x');
    let width = parts.next()?.parse().ok()?;
    let height = parts.next()?.parse().ok()?;
    let refresh_rate = parts.next()?.parse().ok()?;
    Some(DisplayMode {
        width,
        height,
        refresh_rate,
        hdr: params.get("hdrMode").map(|v| v == "1").unwrap_or(false),
    })
}

/// `surroundAudioInfo` packs the channel mask and count; the low word is
/// the count.
fn audio_channel_count(params: &HashMap<String, String>) -> u32 {
    params
        .get("surroundAudioInfo")
        .and_then(|v| v.parse::<u32>().ok())
        .map(|info| info & 0xFFFF)
        .filter(|count| (1..=8).contains(count))
        .unwrap_or(2)
}

fn parse_rikey(params: &HashMap<String, String>) -> Result<Option<[u8; 16]>, HostError> {
    let Some(raw) = params.get("rikey") else {
        return Ok(None);
    };
    let bytes = hex::decode(raw)?;
    let key: [u8; 16] = bytes
        .try_into()
        .map_err(|_| HostError::Protocol("rikey must be 16 bytes".into()))?;
    Ok(Some(key))
}

/// List the apps a paired client may launch.
pub async fn applist_handler(
    State(state): State<AppState>,
    Extension(conn): Extension<ClientConnection>,
) -> Response {
    if let Err(e) = state.authorize(conn.client_cert_pem.as_deref()) {
        return xml_error(&e);
    }

    let mut fields = Vec::new();
    for app in state.store().apps().iter() {
        fields.push((
            "App",
            format!(
                "<ID>{}</ID><AppTitle>{}</AppTitle><IsHdrSupported>{}</IsHdrSupported>",
                app.id,
                app.title,
                if app.support_hdr { 1 } else { 0 }
            ),
        ));
    }
    xml_ok(&fields)
}

/// Create a session and hand the client its RTSP rendezvous.
pub async fn launch_handler(
    State(state): State<AppState>,
    Extension(conn): Extension<ClientConnection>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let result = async {
        let client = state.authorize(conn.client_cert_pem.as_deref())?;
        let app_id = params
            .get("appid")
            .ok_or_else(|| HostError::Protocol("missing appid".into()))?;

        let session = state.launch_session(
            app_id,
            &client,
            conn.peer.ip(),
            parse_rikey(&params)?,
            optional_u32(&params, "rikeyid"),
            parse_mode(&params),
            audio_channel_count(&params),
        )?;
        Ok::<_, HostError>(session)
    }
    .await;

    match result {
        Ok(session) => xml_ok(&[
            ("gamesession", "1".to_string()),
            (
                "sessionUrl0",
                format!(
                    "rtsp://{}:{}",
                    conn.local_addr.ip(),
                    state.settings().rtsp_port
                ),
            ),
            ("videoport", session.video_port.to_string()),
            ("audioport", session.audio_port.to_string()),
        ]),
        Err(e) => {
            warn!("Launch from {} failed: {}", conn.peer, e);
            xml_error(&e)
        }
    }
}

/// Reconnect to the client's active session: restart the media pipelines
/// with the last negotiated parameters.
pub async fn resume_handler(
    State(state): State<AppState>,
    Extension(conn): Extension<ClientConnection>,
) -> Response {
    let result = (|| {
        state.authorize(conn.client_cert_pem.as_deref())?;
        let session = state
            .sessions()
            .find_by_ip(conn.peer.ip())
            .ok_or_else(|| HostError::NotFound("no active session for client".into()))?;
        state.resume_session(session.session_id)?;
        Ok::<_, HostError>(session)
    })();

    match result {
        Ok(session) => xml_ok(&[
            ("resume", "1".to_string()),
            (
                "sessionUrl0",
                format!(
                    "rtsp://{}:{}",
                    conn.local_addr.ip(),
                    state.settings().rtsp_port
                ),
            ),
            ("videoport", session.video_port.to_string()),
            ("audioport", session.audio_port.to_string()),
        ]),
        Err(e) => {
            warn!("Resume from {} failed: {}", conn.peer, e);
            xml_error(&e)
        }
    }
}

/// End the client's active session.
pub async fn cancel_handler(
    State(state): State<AppState>,
    Extension(conn): Extension<ClientConnection>,
) -> Response {
    let result = (|| {
        state.authorize(conn.client_cert_pem.as_deref())?;
        let session = state
            .sessions()
            .find_by_ip(conn.peer.ip())
            .ok_or_else(|| HostError::NotFound("no active session for client".into()))?;
        state.stop_session(session.session_id)?;
        Ok::<_, HostError>(())
    })();

    match result {
        Ok(()) => xml_ok(&[("cancel", "1".to_string())]),
        Err(e) => {
            warn!("Cancel from {} failed: {}", conn.peer, e);
            xml_error(&e)
        }
    }
}

/// Remove the calling client from the paired set.
pub async fn unpair_handler(
    State(state): State<AppState>,
    Extension(conn): Extension<ClientConnection>,
) -> Response {
    let result = async {
        let client = state.authorize(conn.client_cert_pem.as_deref())?;
        state
            .store()
            .unpair(&client)
            .await
            .map_err(HostError::from)?;
        state
            .admin_events()
            .broadcast(selene_types::AdminEvent::ClientUnpaired {
                client_id: client.client_id.clone(),
            });
        Ok::<_, HostError>(client)
    }
    .await;

    match result {
        Ok(client) => {
            info!("Client {} unpaired", client.client_id);
            xml_ok(&[("unpair", "1".to_string())])
        }
        Err(e) => {
            warn!("Unpair from {} failed: {}", conn.peer, e);
            xml_error(&e)
        }
    }
}
