//! Integration tests for the Moonlight wire surface and the admin API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::connect_info::MockConnectInfo,
    http::{Request, StatusCode},
    Extension, Router,
};
use selene::state::AppState;
use selene::tls::ClientConnection;
use selene::{crypto, Settings};
use selene_types::{App, RunnerConfig, SessionListResponse};
use serde_json::json;
use tempfile::TempDir;
use tower::ServiceExt; // for `oneshot`

const CLIENT_ADDR: &str = "10.0.0.2:47100";
const HOST_ADDR: &str = "10.0.0.1:47984";

/// Helper to create a host with one app and all three routers.
async fn create_test_host() -> (TempDir, AppState) {
    let dir = TempDir::new().unwrap();
    let settings = Settings::with_data_dir(dir.path());
    let store = selene::store::HostStore::load_or_default(
        &settings.state_path,
        &settings.cert_path,
        &settings.key_path,
    )
    .await
    .unwrap();
    store.set_apps(vec![App {
        id: "steam".into(),
        title: "Steam".into(),
        image_path: None,
        support_hdr: true,
        h264_pipeline: "videotestsrc ! x264enc".into(),
        hevc_pipeline: Some("videotestsrc ! x265enc".into()),
        av1_pipeline: None,
        opus_pipeline: "audiotestsrc ! opusenc".into(),
        render_node: "/dev/dri/renderD128".into(),
        start_virtual_compositor: true,
        joypad_kind: Default::default(),
        runner: RunnerConfig::Process {
            run_cmd: "true".into(),
        },
    }]);
    let state = AppState::new(
        settings,
        store,
        Arc::new(selene::media::LogPipelineEngine),
        Arc::new(selene::devices::SimulatedInputBackend),
    );
    (dir, state)
}

fn http_app(state: &AppState) -> Router {
    selene::moonlight_http_router(state.clone())
        .layer(MockConnectInfo(CLIENT_ADDR.parse::<SocketAddr>().unwrap()))
}

fn https_app(state: &AppState, cert_pem: Option<String>) -> Router {
    selene::moonlight_https_router(state.clone()).layer(Extension(ClientConnection {
        peer: CLIENT_ADDR.parse().unwrap(),
        local_addr: HOST_ADDR.parse().unwrap(),
        client_cert_pem: cert_pem,
    }))
}

async fn get(app: Router, uri: &str) -> (StatusCode, String) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}

/// Minimal percent-encoding for PEM blobs in query strings.
fn urlencode(raw: &str) -> String {
    let mut out = String::new();
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

struct MoonlightClient {
    cert: openssl::x509::X509,
    key: openssl::pkey::PKey<openssl::pkey::Private>,
    salt: Vec<u8>,
    aes_key: [u8; 16],
}

impl MoonlightClient {
    fn new(pin: &str) -> Self {
        let key = crypto::generate_key().unwrap();
        let cert = crypto::generate_x509(&key, "moonlight-test").unwrap();
        let salt: Vec<u8> = (1..=16).collect();

        let mut salted = salt.clone();
        salted.extend_from_slice(pin.as_bytes());
        let digest = crypto::sha256(&salted);
        let mut aes_key = [0u8; 16];
        aes_key.copy_from_slice(&digest[..16]);

        Self {
            cert,
            key,
            salt,
            aes_key,
        }
    }

    fn cert_pem(&self) -> String {
        crypto::cert_to_pem(&self.cert).unwrap()
    }
}

/// Run the whole 4-phase handshake, answering the PIN prompt through the
/// admin API with `answered_pin`. Returns the final `paired` field.
async fn run_pairing(state: &AppState, client: &MoonlightClient, answered_pin: &str) -> String {
    let admin = selene::admin_router(state.clone());

    // phase 1 blocks until the PIN arrives, so drive it concurrently
    let phase1_uri = format!(
        "/pair?phase=getservercert&salt={}&clientcert={}",
        hex::encode(&client.salt),
        urlencode(&client.cert_pem())
    );
    let phase1_app = http_app(state);
    let phase1 = tokio::spawn(async move { get(phase1_app, &phase1_uri).await });

    // the handshake shows up as a pending pair request
    let secret = loop {
        let (status, body) = get(admin.clone(), "/api/v1/pairing/pending").await;
        assert_eq!(status, StatusCode::OK);
        let parsed: selene_types::PendingPairListResponse = serde_json::from_str(&body).unwrap();
        if let Some(req) = parsed.requests.first() {
            assert_eq!(req.client_ip, "10.0.0.2");
            break req.pair_secret.clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let pin_body = json!({ "pair_secret": secret, "pin": answered_pin });
    let response = admin
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/pairing/pin")
                .method("POST")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&pin_body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, body) = phase1.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    let plaincert = extract_tag(&body, "plaincert").expect("phase 1 returns the host cert");
    let host_pem = String::from_utf8(hex::decode(plaincert).unwrap()).unwrap();
    assert!(host_pem.contains("BEGIN CERTIFICATE"));

    // phase 2
    let challenge = crypto::random_bytes(16);
    let encrypted = crypto::aes_encrypt_ecb(&client.aes_key, &challenge, false).unwrap();
    let (status, body) = get(
        http_app(state),
        &format!(
            "/pair?phase=clientchallenge&clientchallenge={}",
            hex::encode(encrypted)
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let challenge_response = extract_tag(&body, "challengeresponse").unwrap();
    let plain = crypto::aes_decrypt_ecb(
        &client.aes_key,
        &hex::decode(challenge_response).unwrap(),
        false,
    )
    .unwrap();
    let server_challenge = &plain[32..48];

    // phase 3
    let client_secret = crypto::random_bytes(16);
    let client_sig = crypto::cert_signature_bytes(&client.cert).unwrap();
    let mut hashed = server_challenge.to_vec();
    hashed.extend_from_slice(&client_sig);
    hashed.extend_from_slice(&client_secret);
    let client_hash = crypto::sha256(&hashed);
    let encrypted = crypto::aes_encrypt_ecb(&client.aes_key, &client_hash, false).unwrap();
    let (status, body) = get(
        http_app(state),
        &format!(
            "/pair?phase=serverchallengeresp&serverchallengeresp={}",
            hex::encode(encrypted)
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(extract_tag(&body, "pairingsecret").is_some());

    // phase 4
    let signature = crypto::sign(&client_secret, &client.key).unwrap();
    let mut payload = client_secret.clone();
    payload.extend_from_slice(&signature);
    let (status, body) = get(
        http_app(state),
        &format!(
            "/pair?phase=clientpairingsecret&clientpairingsecret={}",
            hex::encode(payload)
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    extract_tag(&body, "paired").unwrap()
}

#[tokio::test]
async fn successful_pairing_persists_the_client() {
    let (dir, state) = create_test_host().await;
    let client = MoonlightClient::new("1234");

    let paired = run_pairing(&state, &client, "1234").await;
    assert_eq!(paired, "1");
    assert!(state.store().get_client_via_ssl(&client.cert_pem()).is_some());

    // the state file on disk includes the new client
    let raw = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed["paired_clients"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn wrong_pin_yields_paired_zero() {
    let (_dir, state) = create_test_host().await;
    // client derives its key from PIN 1234, the user types 9999
    let client = MoonlightClient::new("1234");

    let paired = run_pairing(&state, &client, "9999").await;
    assert_eq!(paired, "0");
    assert!(state.store().paired_clients().is_empty());
}

#[tokio::test]
async fn launch_without_pairing_is_unauthorized() {
    let (_dir, state) = create_test_host().await;
    let client = MoonlightClient::new("1234");

    // no certificate at all
    let (status, _) = get(https_app(&state, None), "/launch?appid=steam").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // a certificate that was never paired
    let (status, _) = get(
        https_app(&state, Some(client.cert_pem())),
        "/launch?appid=steam",
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(state.sessions().is_empty());
}

#[tokio::test]
async fn launch_creates_session_and_returns_rtsp_url() {
    let (_dir, state) = create_test_host().await;
    let client = MoonlightClient::new("4321");
    assert_eq!(run_pairing(&state, &client, "4321").await, "1");

    let app = https_app(&state, Some(client.cert_pem()));
    let (status, body) = get(
        app,
        "/launch?appid=steam&rikey=000102030405060708090a0b0c0d0e0f&rikeyid=7&mode=1280x720x60",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(extract_tag(&body, "gamesession").unwrap(), "1");
    assert!(extract_tag(&body, "sessionUrl0")
        .unwrap()
        .starts_with("rtsp://10.0.0.1:"));

    let session = state.sessions().find_by_ip("10.0.0.2".parse().unwrap()).unwrap();
    assert_eq!(session.display_mode.width, 1280);
    assert_eq!(
        extract_tag(&body, "videoport").unwrap(),
        session.video_port.to_string()
    );

    // unknown app id is a 404
    let (status, _) = get(
        https_app(&state, Some(client.cert_pem())),
        "/launch?appid=doom",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn applist_requires_pairing_and_lists_apps() {
    let (_dir, state) = create_test_host().await;
    let client = MoonlightClient::new("2222");

    let (status, _) = get(https_app(&state, Some(client.cert_pem())), "/applist").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert_eq!(run_pairing(&state, &client, "2222").await, "1");
    let (status, body) = get(https_app(&state, Some(client.cert_pem())), "/applist").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("<AppTitle>Steam</AppTitle>"));
    assert!(body.contains("<IsHdrSupported>1</IsHdrSupported>"));
}

#[tokio::test]
async fn cancel_stops_the_clients_session() {
    let (_dir, state) = create_test_host().await;
    let client = MoonlightClient::new("3333");
    assert_eq!(run_pairing(&state, &client, "3333").await, "1");

    let (status, _) = get(
        https_app(&state, Some(client.cert_pem())),
        "/launch?appid=steam",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.sessions().len(), 1);

    let (status, body) = get(https_app(&state, Some(client.cert_pem())), "/cancel").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(extract_tag(&body, "cancel").unwrap(), "1");
    assert!(state.sessions().is_empty());

    // a second cancel has nothing to stop
    let (status, _) = get(https_app(&state, Some(client.cert_pem())), "/cancel").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unpair_removes_the_client() {
    let (_dir, state) = create_test_host().await;
    let client = MoonlightClient::new("5555");
    assert_eq!(run_pairing(&state, &client, "5555").await, "1");
    assert_eq!(state.store().paired_clients().len(), 1);

    let (status, body) = get(https_app(&state, Some(client.cert_pem())), "/unpair").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(extract_tag(&body, "unpair").unwrap(), "1");
    assert!(state.store().get_client_via_ssl(&client.cert_pem()).is_none());
}

#[tokio::test]
async fn admin_api_lists_and_stops_sessions() {
    let (_dir, state) = create_test_host().await;
    let client = MoonlightClient::new("7777");
    assert_eq!(run_pairing(&state, &client, "7777").await, "1");
    let (status, _) = get(
        https_app(&state, Some(client.cert_pem())),
        "/launch?appid=steam",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let admin = selene::admin_router(state.clone());
    let (status, body) = get(admin.clone(), "/api/v1/sessions").await;
    assert_eq!(status, StatusCode::OK);
    let sessions: SessionListResponse = serde_json::from_str(&body).unwrap();
    assert_eq!(sessions.sessions.len(), 1);
    assert_eq!(sessions.sessions[0].app_id, "steam");
    let id = sessions.sessions[0].session_id;

    let response = admin
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/sessions/{}/stop", id))
                .method("POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (_, body) = get(admin, "/api/v1/sessions").await;
    let sessions: SessionListResponse = serde_json::from_str(&body).unwrap();
    assert!(sessions.sessions.is_empty());
}

#[tokio::test]
async fn health_check() {
    let (_dir, state) = create_test_host().await;
    let (status, body) = get(selene::admin_router(state), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}
