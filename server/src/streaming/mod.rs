//! Stream sub-sessions.
//!
//! One supervisor task per live session fans the bus out into the video,
//! audio and control sub-sessions, owns the runner task, and enforces the
//! teardown grace period when the session stops.

pub mod audio;
pub mod control;
pub mod ping;
pub mod video;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::devices::VirtualDisplayHandle;
use crate::events::{EventKind, SessionEvent};
use crate::runners::{runner_from_config, RunnerContext};
use crate::sessions::StreamSession;
use crate::state::{stop_session_quietly, AppState};

use audio::AudioStream;
use control::SessionControl;
use ping::{run_ping_listener, StreamPingKind};
use video::VideoStream;

/// Run the streaming service: supervise every session the host launches,
/// until cancelled.
pub async fn run(state: AppState, cancel: CancellationToken) {
    let (_reg, mut rx) = state
        .bus()
        .subscribe_channel(EventKind::StreamSessionCreated);
    info!("Streaming service ready");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Streaming service shutting down");
                return;
            }
            ev = rx.recv() => match ev {
                Some(SessionEvent::StreamSessionCreated(session)) => {
                    tokio::spawn(supervise_session(
                        state.clone(),
                        session,
                        cancel.child_token(),
                    ));
                }
                Some(_) => {}
                None => return,
            }
        }
    }
}

/// Supervise one session from creation to teardown.
pub(crate) async fn supervise_session(
    state: AppState,
    session: Arc<StreamSession>,
    cancel: CancellationToken,
) {
    let session_id = session.session_id;
    // subscribe before the liveness check: a stop arriving after the check
    // lands in the channel, a stop before it makes the check fail
    let (_regs, mut rx) = state.bus().subscribe_channel_many(&[
        EventKind::VideoSessionReady,
        EventKind::AudioSessionReady,
        EventKind::IdrRequest,
        EventKind::PauseStream,
        EventKind::ResumeStream,
        EventKind::StopStream,
    ]);
    if !state.sessions().contains(session_id) {
        debug!("Session {} stopped before supervision started", session_id);
        return;
    }
    info!("Supervising session {}", session_id);

    if session.app.start_virtual_compositor {
        let _ = session.wayland_display.set(VirtualDisplayHandle {
            wayland_display_name: format!("selene-{}", session_id),
        });
    }

    let mut video = VideoStream::new(state.engine().clone());
    let mut audio = AudioStream::new(state.engine().clone());

    // mouse and keyboard exist from the start; pen, touch and joypads are
    // created on first use by the control transport
    let control = SessionControl::new(session.clone(), state.input_backend().clone());
    if let Err(e) = control.ensure_mouse() {
        warn!("Session {}: mouse creation failed: {}", session_id, e);
    }
    if let Err(e) = control.ensure_keyboard() {
        warn!("Session {}: keyboard creation failed: {}", session_id, e);
    }

    let session_cancel = CancellationToken::new();

    // NAT-punch ping listeners on the stream ports
    let mut ping_tasks = Vec::new();
    for (kind, port) in [
        (StreamPingKind::Video, session.video_port),
        (StreamPingKind::Audio, session.audio_port),
    ] {
        match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => {
                ping_tasks.push(tokio::spawn(run_ping_listener(
                    state.bus().clone(),
                    kind,
                    socket,
                    session_cancel.clone(),
                )));
            }
            Err(e) => warn!(
                "Session {}: could not bind {:?} ping port {}: {}",
                session_id, kind, port, e
            ),
        }
    }

    // the runner owns the app; its exit terminates the session
    let runner = runner_from_config(&session.app.runner, state.bus().clone());
    let runner_ctx = RunnerContext {
        session_id,
        app_state_folder: session.app_state_folder.clone(),
        plug_queue: session.plug_queue.clone(),
        virtual_inputs: session.virtual_input_paths(),
        mounts: Vec::new(),
        env: runner_env(&session),
        render_node: session.app.render_node.clone(),
        cancel: session_cancel.clone(),
        stop_grace: state.settings().stop_grace,
    };
    let runner_task = {
        let state = state.clone();
        let cancel = session_cancel.clone();
        tokio::spawn(async move {
            let result = runner.run(runner_ctx).await;
            if cancel.is_cancelled() {
                return;
            }
            match result {
                Ok(()) => info!("Session {}: app exited, ending session", session_id),
                Err(e) => error!("Session {}: runner failed: {}", session_id, e),
            }
            stop_session_quietly(&state, session_id);
        })
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Session {}: host shutdown", session_id);
                break;
            }
            ev = rx.recv() => {
                let Some(ev) = ev else { break };
                if ev.session_id() != Some(session_id) {
                    continue;
                }
                match ev {
                    SessionEvent::VideoSessionReady(params) => video.on_ready(params),
                    SessionEvent::AudioSessionReady(params) => audio.on_ready(params),
                    SessionEvent::IdrRequest { .. } => {
                        video.on_idr();
                    }
                    SessionEvent::PauseStream { .. } => {
                        info!("Session {}: paused", session_id);
                        video.on_pause();
                        audio.on_pause();
                    }
                    SessionEvent::ResumeStream { .. } => {
                        info!("Session {}: resumed", session_id);
                        video.on_resume();
                        audio.on_resume();
                    }
                    SessionEvent::StopStream { .. } => break,
                    _ => {}
                }
            }
        }
    }

    // teardown: pipelines first, then the runner inside its grace period
    video.on_stop();
    audio.on_stop();
    session_cancel.cancel();

    let grace = state.settings().stop_grace + std::time::Duration::from_secs(1);
    if tokio::time::timeout(grace, runner_task).await.is_err() {
        warn!(
            "Session {}: runner did not stop within grace, releasing anyway",
            session_id
        );
    }
    for task in ping_tasks {
        task.abort();
    }
    info!("Session {} torn down", session_id);
}

fn runner_env(session: &StreamSession) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert(
        "SELENE_SESSION_ID".to_string(),
        session.session_id.to_string(),
    );
    env.insert(
        "SELENE_CLIENT_IP".to_string(),
        session.client_ip.to_string(),
    );
    if let Some(display) = session.wayland_display.get() {
        env.insert(
            "WAYLAND_DISPLAY".to_string(),
            display.wayland_display_name.clone(),
        );
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::devices::SimulatedInputBackend;
    use crate::media::testing::{EngineEvent, RecordingEngine};
    use crate::state::tests::test_client;
    use crate::store::HostStore;
    use selene_types::{App, PairedClient, RunnerConfig};
    use std::time::Duration;
    use tempfile::tempdir;

    async fn state_with_recording_engine(
        dir: &std::path::Path,
    ) -> (AppState, Arc<RecordingEngine>, PairedClient) {
        let settings = Settings::with_data_dir(dir);
        let store = HostStore::load_or_default(
            &settings.state_path,
            &settings.cert_path,
            &settings.key_path,
        )
        .await
        .unwrap();
        store.set_apps(vec![App {
            id: "game".into(),
            title: "Game".into(),
            image_path: None,
            support_hdr: false,
            h264_pipeline: "videotestsrc ! x264enc".into(),
            hevc_pipeline: None,
            av1_pipeline: None,
            opus_pipeline: "audiotestsrc ! opusenc".into(),
            render_node: String::new(),
            start_virtual_compositor: true,
            joypad_kind: Default::default(),
            runner: RunnerConfig::Process {
                run_cmd: "sleep 30".into(),
            },
        }]);

        let engine = Arc::new(RecordingEngine::default());
        let state = AppState::new(
            settings,
            store,
            engine.clone(),
            Arc::new(SimulatedInputBackend),
        );
        (state, engine, test_client())
    }

    fn video_params(
        session: &StreamSession,
        bitrate_kbps: i64,
    ) -> crate::events::VideoSessionParams {
        crate::rtsp::build_video_params(
            session,
            &HashMap::from([(
                "x-nv-vqos[0].bw.maximumBitrateKbps".to_string(),
                bitrate_kbps.to_string(),
            )]),
        )
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn pause_resume_restarts_with_identical_params() {
        let dir = tempdir().unwrap();
        let (state, engine, client) = state_with_recording_engine(dir.path()).await;
        let cancel = CancellationToken::new();
        tokio::spawn(run(state.clone(), cancel.clone()));
        // let the service subscribe before launching
        tokio::task::yield_now().await;

        let session = state
            .launch_session("game", &client, "127.0.0.1".parse().unwrap(), None, None, None, 2)
            .unwrap();
        let id = session.session_id;
        // give the per-session supervisor a beat to subscribe
        tokio::time::sleep(Duration::from_millis(50)).await;

        state.publish_video_session(video_params(&session, 12_000));
        wait_for(|| {
            engine
                .recorded()
                .iter()
                .any(|e| matches!(e, EngineEvent::VideoStart(_)))
        })
        .await;

        state.pause_session(id).unwrap();
        wait_for(|| engine.recorded().contains(&EngineEvent::VideoStop)).await;

        state.resume_session(id).unwrap();
        wait_for(|| {
            engine
                .recorded()
                .iter()
                .filter(|e| matches!(e, EngineEvent::VideoStart(_)))
                .count()
                == 2
        })
        .await;

        let starts: Vec<_> = engine
            .recorded()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::VideoStart(p) => Some(p),
                _ => None,
            })
            .collect();
        // resume used the last negotiated parameters bit-exactly
        assert_eq!(starts[0], starts[1]);

        state.stop_session(id).unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn idr_requests_within_a_frame_interval_coalesce() {
        let dir = tempdir().unwrap();
        let (state, engine, client) = state_with_recording_engine(dir.path()).await;
        let cancel = CancellationToken::new();
        tokio::spawn(run(state.clone(), cancel.clone()));
        tokio::task::yield_now().await;

        // 1 fps keeps the coalescing window wide open for the whole test
        let session = state
            .launch_session(
                "game",
                &client,
                "127.0.0.1".parse().unwrap(),
                None,
                None,
                Some(selene_types::DisplayMode {
                    width: 1280,
                    height: 720,
                    refresh_rate: 1,
                    hdr: false,
                }),
                2,
            )
            .unwrap();
        let id = session.session_id;
        // give the per-session supervisor a beat to subscribe
        tokio::time::sleep(Duration::from_millis(50)).await;

        state.publish_video_session(video_params(&session, 10_000));
        wait_for(|| {
            engine
                .recorded()
                .iter()
                .any(|e| matches!(e, EngineEvent::VideoStart(_)))
        })
        .await;

        for _ in 0..5 {
            state.request_idr(id);
        }
        wait_for(|| engine.recorded().contains(&EngineEvent::Idr)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let idr_count = engine
            .recorded()
            .iter()
            .filter(|e| matches!(e, EngineEvent::Idr))
            .count();
        assert_eq!(idr_count, 1, "duplicate IDR requests must coalesce");

        state.stop_session(id).unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn stop_tears_down_pipelines() {
        let dir = tempdir().unwrap();
        let (state, engine, client) = state_with_recording_engine(dir.path()).await;
        let cancel = CancellationToken::new();
        tokio::spawn(run(state.clone(), cancel.clone()));
        tokio::task::yield_now().await;

        let session = state
            .launch_session("game", &client, "127.0.0.1".parse().unwrap(), None, None, None, 2)
            .unwrap();
        let id = session.session_id;
        // give the per-session supervisor a beat to subscribe
        tokio::time::sleep(Duration::from_millis(50)).await;

        state.publish_video_session(video_params(&session, 10_000));
        state.publish_audio_session(crate::rtsp::build_audio_params(&session, &HashMap::new()));
        wait_for(|| {
            let events = engine.recorded();
            events.iter().any(|e| matches!(e, EngineEvent::VideoStart(_)))
                && events.iter().any(|e| matches!(e, EngineEvent::AudioStart(_)))
        })
        .await;

        state.stop_session(id).unwrap();
        wait_for(|| {
            let events = engine.recorded();
            events.contains(&EngineEvent::VideoStop) && events.contains(&EngineEvent::AudioStop)
        })
        .await;

        cancel.cancel();
    }
}
