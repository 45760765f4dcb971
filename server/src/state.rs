//! Shared application state and session lifecycle orchestration.
//!
//! Lock order across the host, outermost first: HostStore (persistence
//! lock) ≺ SessionRegistry ≺ per-session joypad map. No lock is ever held
//! across a suspension point.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock};

use selene_types::{AdminEvent, App, PairedClient, SessionInfo};
use tracing::{error, info, warn};

use crate::broadcast::AdminBroadcaster;
use crate::config::Settings;
use crate::crypto;
use crate::devices::{InputBackend, PlugQueue, SimulatedInputBackend};
use crate::error::HostError;
use crate::events::{AudioSessionParams, EventBus, SessionEvent, VideoSessionParams};
use crate::media::{LogPipelineEngine, PipelineEngine};
use crate::pairing::PairingManager;
use crate::sessions::{PortPool, SessionRegistry, StreamSession};
use crate::store::HostStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    settings: Settings,
    store: HostStore,
    sessions: SessionRegistry,
    ports: PortPool,
    bus: Arc<EventBus>,
    pairing: PairingManager,
    admin_events: AdminBroadcaster,
    engine: Arc<dyn PipelineEngine>,
    input: Arc<dyn InputBackend>,
}

impl AppState {
    /// Build state from parts. Most callers want [`AppState::bootstrap`].
    pub fn new(
        settings: Settings,
        store: HostStore,
        engine: Arc<dyn PipelineEngine>,
        input: Arc<dyn InputBackend>,
    ) -> Self {
        let bus = EventBus::new();
        let admin_events = AdminBroadcaster::default();
        let pairing = PairingManager::new(
            bus.clone(),
            admin_events.clone(),
            settings.pairing_ttl,
            settings.pin_timeout,
        );
        let ports = PortPool::new(settings.stream_port_range());

        Self {
            inner: Arc::new(AppStateInner {
                settings,
                store,
                sessions: SessionRegistry::new(),
                ports,
                bus,
                pairing,
                admin_events,
                engine,
                input,
            }),
        }
    }

    /// Load persisted state and construct the default state with the
    /// logging media engine and the simulated input backend.
    pub async fn bootstrap(settings: Settings) -> anyhow::Result<Self> {
        let store = HostStore::load_or_default(
            &settings.state_path,
            &settings.cert_path,
            &settings.key_path,
        )
        .await?;

        if let Some(apps_path) = &settings.apps_path {
            match tokio::fs::read_to_string(apps_path).await {
                Ok(contents) => {
                    let apps: Vec<App> = serde_json::from_str(&contents)?;
                    info!("Loaded {} apps from {:?}", apps.len(), apps_path);
                    store.set_apps(apps);
                }
                Err(e) => {
                    warn!("Could not read apps file {:?}: {}", apps_path, e);
                }
            }
        }

        Ok(Self::new(
            settings,
            store,
            Arc::new(LogPipelineEngine),
            Arc::new(SimulatedInputBackend),
        ))
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn store(&self) -> &HostStore {
        &self.inner.store
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn pairing(&self) -> &PairingManager {
        &self.inner.pairing
    }

    pub fn admin_events(&self) -> &AdminBroadcaster {
        &self.inner.admin_events
    }

    pub fn engine(&self) -> &Arc<dyn PipelineEngine> {
        &self.inner.engine
    }

    pub fn input_backend(&self) -> &Arc<dyn InputBackend> {
        &self.inner.input
    }

    /// Create a session for `app_id` on behalf of a paired client.
    ///
    /// `rikey`/`rikeyid` come off the launch query string; when the client
    /// does not provide them, fresh GCM material is generated.
    pub fn launch_session(
        &self,
        app_id: &str,
        client: &PairedClient,
        client_ip: IpAddr,
        rikey: Option<[u8; 16]>,
        rikeyid: Option<u32>,
        display_mode: Option<selene_types::DisplayMode>,
        audio_channel_count: u32,
    ) -> Result<Arc<StreamSession>, HostError> {
        let app = Arc::new(self.inner.store.get_app_by_id(app_id)?);

        let session_id = self.inner.sessions.allocate_id();

        let aes_key = rikey.unwrap_or_else(|| {
            let mut key = [0u8; 16];
            key.copy_from_slice(&crypto::random_bytes(16));
            key
        });
        let mut aes_iv = [0u8; 16];
        match rikeyid {
            Some(id) => aes_iv[..4].copy_from_slice(&id.to_be_bytes()),
            None => aes_iv.copy_from_slice(&crypto::random_bytes(16)),
        }

        let (video_port, audio_port) = self.inner.ports.allocate_pair()?;

        let session = Arc::new(StreamSession {
            session_id,
            client_ip,
            display_mode: display_mode.unwrap_or_default(),
            audio_channel_count,
            aes_key,
            aes_iv,
            video_port,
            audio_port,
            app: app.clone(),
            app_state_folder: PathBuf::from(&client.app_state_folder).join(&app.id),
            event_bus: self.inner.bus.clone(),
            plug_queue: Arc::new(PlugQueue::new(self.inner.settings.plug_queue_capacity)),
            wayland_display: OnceLock::new(),
            mouse: OnceLock::new(),
            keyboard: OnceLock::new(),
            pen_tablet: OnceLock::new(),
            touch_screen: OnceLock::new(),
            joypads: RwLock::new(HashMap::new()),
        });

        self.inner.sessions.insert(session.clone());
        self.inner
            .bus
            .publish(SessionEvent::StreamSessionCreated(session.clone()));
        self.inner.admin_events.broadcast(AdminEvent::SessionStarted {
            session_id,
            app_id: app.id.clone(),
        });
        info!(
            "Session {} launched: app {} for {} (video {}, audio {})",
            session_id, app.id, client_ip, video_port, audio_port
        );
        Ok(session)
    }

    /// Terminal transition. The registry entry is dropped before the stop
    /// event propagates, so no event for this id can reach a subscriber
    /// that registers afterwards.
    pub fn stop_session(&self, session_id: u64) -> Result<(), HostError> {
        let session = self
            .inner
            .sessions
            .remove(session_id)
            .ok_or_else(|| HostError::NotFound(format!("session {}", session_id)))?;

        self.inner
            .bus
            .publish(SessionEvent::StopStream { session_id });

        self.inner.ports.release(session.video_port);
        self.inner.ports.release(session.audio_port);

        self.inner
            .admin_events
            .broadcast(AdminEvent::SessionStopped { session_id });
        info!("Session {} stopped", session_id);
        Ok(())
    }

    /// Stop media pipelines, keep devices and the runner.
    pub fn pause_session(&self, session_id: u64) -> Result<(), HostError> {
        if !self.inner.sessions.contains(session_id) {
            return Err(HostError::NotFound(format!("session {}", session_id)));
        }
        self.inner
            .bus
            .publish(SessionEvent::PauseStream { session_id });
        self.inner
            .admin_events
            .broadcast(AdminEvent::SessionPaused { session_id });
        Ok(())
    }

    /// Restart media pipelines with the last negotiated parameters.
    pub fn resume_session(&self, session_id: u64) -> Result<(), HostError> {
        if !self.inner.sessions.contains(session_id) {
            return Err(HostError::NotFound(format!("session {}", session_id)));
        }
        self.inner
            .bus
            .publish(SessionEvent::ResumeStream { session_id });
        self.inner
            .admin_events
            .broadcast(AdminEvent::SessionResumed { session_id });
        Ok(())
    }

    /// Ask the video pipeline for an intra-coded frame.
    pub fn request_idr(&self, session_id: u64) {
        self.inner
            .bus
            .publish(SessionEvent::IdrRequest { session_id });
    }

    /// Publish negotiated video parameters, unless the session already
    /// stopped. Stop is terminal: nothing may follow it for the same id.
    pub fn publish_video_session(&self, params: VideoSessionParams) {
        if !self.inner.sessions.contains(params.session_id) {
            warn!(
                "Dropping video session parameters for stopped session {}",
                params.session_id
            );
            return;
        }
        self.inner
            .bus
            .publish(SessionEvent::VideoSessionReady(Arc::new(params)));
    }

    /// Publish negotiated audio parameters, unless the session already
    /// stopped.
    pub fn publish_audio_session(&self, params: AudioSessionParams) {
        if !self.inner.sessions.contains(params.session_id) {
            warn!(
                "Dropping audio session parameters for stopped session {}",
                params.session_id
            );
            return;
        }
        self.inner
            .bus
            .publish(SessionEvent::AudioSessionReady(Arc::new(params)));
    }

    /// Serializable snapshots of the active sessions for the admin API.
    pub fn session_infos(&self) -> Vec<SessionInfo> {
        self.inner
            .sessions
            .list()
            .into_iter()
            .map(|s| SessionInfo {
                session_id: s.session_id,
                app_id: s.app.id.clone(),
                client_ip: s.client_ip.to_string(),
                video_port: s.video_port,
                audio_port: s.audio_port,
                display_width: s.display_mode.width,
                display_height: s.display_mode.height,
                refresh_rate: s.display_mode.refresh_rate,
            })
            .collect()
    }

    /// Resolve the paired client for a presented certificate, or
    /// `Unauthorized`.
    pub fn authorize(&self, client_cert_pem: Option<&str>) -> Result<PairedClient, HostError> {
        let pem = client_cert_pem.ok_or(HostError::Unauthorized)?;
        self.inner
            .store
            .get_client_via_ssl(pem)
            .ok_or(HostError::Unauthorized)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

/// Log-and-continue wrapper for fire-and-forget lifecycle calls.
pub fn stop_session_quietly(state: &AppState, session_id: u64) {
    if let Err(e) = state.stop_session(session_id) {
        error!("Stopping session {}: {}", session_id, e);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use selene_types::RunnerConfig;
    use tempfile::tempdir;

    pub(crate) async fn test_state(dir: &std::path::Path) -> AppState {
        let settings = Settings::with_data_dir(dir);
        let store = HostStore::load_or_default(
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
            support_hdr: false,
            h264_pipeline: "videotestsrc ! x264enc bitrate={bitrate_kbps}".into(),
            hevc_pipeline: None,
            av1_pipeline: None,
            opus_pipeline: "audiotestsrc ! opusenc".into(),
            render_node: "/dev/dri/renderD128".into(),
            start_virtual_compositor: true,
            joypad_kind: Default::default(),
            runner: RunnerConfig::Process {
                run_cmd: "true".into(),
            },
        }]);
        AppState::new(
            settings,
            store,
            Arc::new(LogPipelineEngine),
            Arc::new(SimulatedInputBackend),
        )
    }

    pub(crate) fn test_client() -> PairedClient {
        let key = crypto::generate_key().unwrap();
        let cert = crypto::generate_x509(&key, "client").unwrap();
        PairedClient {
            client_id: "test-client".into(),
            client_cert: crypto::cert_to_pem(&cert).unwrap(),
            app_state_folder: "/tmp/selene-clients/test".into(),
            run_uid: 1000,
            run_gid: 1000,
        }
    }

    #[tokio::test]
    async fn launch_requires_known_app() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let client = test_client();

        let err = state
            .launch_session(
                "missing",
                &client,
                "10.0.0.2".parse().unwrap(),
                None,
                None,
                None,
                2,
            )
            .unwrap_err();
        assert!(matches!(err, HostError::NotFound(_)));
    }

    #[tokio::test]
    async fn launch_creates_and_publishes_session() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let client = test_client();

        let (_reg, mut rx) = state
            .bus()
            .subscribe_channel(crate::events::EventKind::StreamSessionCreated);

        let session = state
            .launch_session(
                "steam",
                &client,
                "10.0.0.2".parse().unwrap(),
                Some([7u8; 16]),
                Some(2),
                None,
                2,
            )
            .unwrap();

        assert!(state.sessions().contains(session.session_id));
        assert_eq!(session.aes_key, [7u8; 16]);
        assert_eq!(&session.aes_iv[..4], &2u32.to_be_bytes());

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.session_id(), Some(session.session_id));
    }

    #[tokio::test]
    async fn stop_is_terminal_and_releases_ports() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let client = test_client();

        let session = state
            .launch_session("steam", &client, "10.0.0.2".parse().unwrap(), None, None, None, 2)
            .unwrap();
        let id = session.session_id;

        state.stop_session(id).unwrap();
        assert!(!state.sessions().contains(id));

        // terminal: further lifecycle transitions are NotFound
        assert!(matches!(state.pause_session(id), Err(HostError::NotFound(_))));
        assert!(matches!(state.resume_session(id), Err(HostError::NotFound(_))));
        assert!(matches!(state.stop_session(id), Err(HostError::NotFound(_))));
    }

    #[tokio::test]
    async fn media_params_are_dropped_after_stop() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let client = test_client();

        let session = state
            .launch_session("steam", &client, "10.0.0.2".parse().unwrap(), None, None, None, 2)
            .unwrap();
        let id = session.session_id;
        state.stop_session(id).unwrap();

        // a subscriber registered after the stop must never see the id
        let (_reg, mut rx) = state.bus().subscribe_channel_many(&[
            crate::events::EventKind::VideoSessionReady,
            crate::events::EventKind::AudioSessionReady,
        ]);

        state.publish_video_session(VideoSessionParams {
            session_id: id,
            display_mode: Default::default(),
            pipeline: "x".into(),
            port: session.video_port,
            timeout_ms: 7000,
            packet_size: 1024,
            frames_with_invalid_ref_threshold: 0,
            fec_percentage: 20,
            min_required_fec_packets: 2,
            bitrate_kbps: 10000,
            slices_per_frame: 1,
            color_range: selene_types::ColorRange::Mpeg,
            color_space: selene_types::ColorSpace::Bt709,
            client_ip: session.client_ip,
        });

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn authorize_rejects_unknown_certs() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let client = test_client();

        assert!(matches!(
            state.authorize(None),
            Err(HostError::Unauthorized)
        ));
        assert!(matches!(
            state.authorize(Some(&client.client_cert)),
            Err(HostError::Unauthorized)
        ));

        state.store().pair(client.clone()).await.unwrap();
        let authorized = state.authorize(Some(&client.client_cert)).unwrap();
        assert_eq!(authorized.client_id, client.client_id);
    }
}
