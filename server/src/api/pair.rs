//! The `/pair` endpoint: one HTTP request per handshake phase.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use tracing::{info, warn};

use super::{xml_ok, xml_response};
use crate::error::HostError;
use crate::state::AppState;

/// The pairing failure reply: always HTTP 200, `paired=0` in the envelope.
fn pairing_failed() -> Response {
    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        xml_response(200, &[("paired", "0".to_string())]),
    )
        .into_response()
}

fn host_ip(headers: &HeaderMap) -> IpAddr {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|host| host.rsplit_once(':').map(|(ip, _)| ip).or(Some(host)))
        .and_then(|ip| ip.parse().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Dispatch one pairing phase.
///
/// Every phase is a GET with query parameters and answers with the XML
/// envelope; any failure terminates the exchange with `paired=0`.
pub async fn pair_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let client_ip = peer.ip();
    let result = match params.get("phase").map(String::as_str) {
        Some("getservercert") => get_server_cert(&state, client_ip, &headers, &params).await,
        Some("clientchallenge") => client_challenge(&state, client_ip, &params),
        Some("serverchallengeresp") => server_challenge_resp(&state, client_ip, &params),
        Some("clientpairingsecret") => client_pairing_secret(&state, client_ip, &params).await,
        other => Err(HostError::Protocol(format!(
            "unknown pairing phase: {:?}",
            other
        ))),
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            warn!("Pairing with {} failed: {}", client_ip, e);
            pairing_failed()
        }
    }
}

fn required<'a>(
    params: &'a HashMap<String, String>,
    name: &str,
) -> Result<&'a String, HostError> {
    params
        .get(name)
        .ok_or_else(|| HostError::Protocol(format!("missing parameter: {}", name)))
}

async fn get_server_cert(
    state: &AppState,
    client_ip: IpAddr,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Result<Response, HostError> {
    let salt = hex::decode(required(params, "salt")?)?;
    let client_cert_pem = required(params, "clientcert")?.clone();

    let plaincert = state
        .pairing()
        .get_server_cert(
            state.store(),
            client_ip,
            host_ip(headers),
            &salt,
            client_cert_pem,
        )
        .await?;
    info!("Pairing with {} entered challenge phase", client_ip);
    Ok(xml_ok(&[
        ("paired", "1".to_string()),
        ("plaincert", plaincert),
    ]))
}

fn client_challenge(
    state: &AppState,
    client_ip: IpAddr,
    params: &HashMap<String, String>,
) -> Result<Response, HostError> {
    let challenge = required(params, "clientchallenge")?;
    let response = state
        .pairing()
        .client_challenge(state.store(), client_ip, challenge)?;
    Ok(xml_ok(&[
        ("paired", "1".to_string()),
        ("challengeresponse", response),
    ]))
}

fn server_challenge_resp(
    state: &AppState,
    client_ip: IpAddr,
    params: &HashMap<String, String>,
) -> Result<Response, HostError> {
    let resp = required(params, "serverchallengeresp")?;
    let secret = state
        .pairing()
        .server_challenge_resp(state.store(), client_ip, resp)?;
    Ok(xml_ok(&[
        ("paired", "1".to_string()),
        ("pairingsecret", secret),
    ]))
}

async fn client_pairing_secret(
    state: &AppState,
    client_ip: IpAddr,
    params: &HashMap<String, String>,
) -> Result<Response, HostError> {
    let secret = required(params, "clientpairingsecret")?;
    let client = state
        .pairing()
        .client_pairing_secret(
            state.store(),
            client_ip,
            secret,
            &state.settings().data_dir.join("clients"),
        )
        .await?;
    info!("Client {} paired from {}", client.client_id, client_ip);
    Ok(xml_ok(&[("paired", "1".to_string())]))
}
