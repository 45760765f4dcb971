//! RTSP negotiator for the Moonlight stream setup.
//!
//! Clients connect to the port announced by `launch`, exchange
//! OPTIONS/DESCRIBE/SETUP/ANNOUNCE and finish with PLAY, at which point the
//! negotiated video and audio parameters are published for the pipeline
//! starters. Sessions are correlated by the peer address.

mod parser;

pub use parser::{attr_i64, parse_sdp_attributes, RtspRequest};

use std::collections::HashMap;
use std::net::SocketAddr;

use selene_types::{AudioMode, ColorRange, ColorSpace, DisplayMode};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{AudioSessionParams, VideoSessionParams};
use crate::media::{render_pipeline, PipelineContext};
use crate::sessions::StreamSession;
use crate::state::AppState;

/// Run the RTSP negotiator until cancelled.
pub async fn run_rtsp_server(state: AppState, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", state.settings().rtsp_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("RTSP negotiator listening on {}", addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("RTSP negotiator shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!("RTSP connection from {}", peer);
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, peer, state).await {
                            warn!("RTSP connection error from {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept RTSP connection: {}", e);
                }
            }
        }
    }
}

/// Handle one RTSP connection. Generic over the stream so tests can drive
/// it through an in-memory duplex.
pub(crate) async fn handle_connection<S>(
    socket: S,
    peer: SocketAddr,
    state: AppState,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(socket);
    // parameters collected from ANNOUNCE, consumed by PLAY
    let mut announced: Option<HashMap<String, String>> = None;

    loop {
        let mut head = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Ok(()); // connection closed
            }
            if line == "\r\n" || line == "\n" {
                break;
            }
            head.push(line.clone());
        }
        if head.is_empty() {
            return Ok(());
        }

        let mut request = match parser::parse_head(&head) {
            Ok(request) => request,
            Err(e) => {
                debug!("RTSP parse error from {}: {}", peer, e);
                send_response(&mut reader, 400, "Bad Request", "1", &[], "").await?;
                continue;
            }
        };

        let content_length = request.content_length();
        if content_length > 0 {
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).await?;
            request.body = String::from_utf8_lossy(&body).into_owned();
        }

        debug!("RTSP {} request for {}", request.method, request.target);

        // every verb except OPTIONS needs the launched session
        let session = state.sessions().find_by_ip(peer.ip());

        match request.method.as_str() {
            "OPTIONS" => {
                send_response(
                    &mut reader,
                    200,
                    "OK",
                    &request.cseq,
                    &[("Public", "OPTIONS, DESCRIBE, SETUP, ANNOUNCE, PLAY".into())],
                    "",
                )
                .await?;
            }
            "DESCRIBE" => match session {
                Some(session) => {
                    let sdp = describe_payload(&state, &session);
                    send_response(
                        &mut reader,
                        200,
                        "OK",
                        &request.cseq,
                        &[("Content-Type", "application/sdp".into())],
                        &sdp,
                    )
                    .await?;
                }
                None => {
                    send_response(&mut reader, 454, "Session Not Found", &request.cseq, &[], "")
                        .await?
                }
            },
            "SETUP" => match session {
                Some(session) => {
                    let stream_id = request.stream_id().unwrap_or_default().to_string();
                    let port = match stream_id.as_str() {
                        "video" => session.video_port,
                        "audio" => session.audio_port,
                        // the control channel is session-internal; its port
                        // only matters to the client as an opaque value
                        "control" => session.video_port.saturating_sub(1),
                        other => {
                            debug!("SETUP for unknown stream id {:?}", other);
                            send_response(&mut reader, 400, "Bad Request", &request.cseq, &[], "")
                                .await?;
                            continue;
                        }
                    };
                    send_response(
                        &mut reader,
                        200,
                        "OK",
                        &request.cseq,
                        &[
                            ("Session", format!("{};timeout = 90", session.session_id)),
                            ("Transport", format!("server_port={}", port)),
                        ],
                        "",
                    )
                    .await?;
                }
                None => {
                    send_response(&mut reader, 454, "Session Not Found", &request.cseq, &[], "")
                        .await?
                }
            },
            "ANNOUNCE" => match session {
                Some(_) => {
                    announced = Some(parser::parse_sdp_attributes(&request.body));
                    send_response(&mut reader, 200, "OK", &request.cseq, &[], "").await?;
                }
                None => {
                    send_response(&mut reader, 454, "Session Not Found", &request.cseq, &[], "")
                        .await?
                }
            },
            "PLAY" => match session {
                Some(session) => {
                    let attributes = announced.clone().unwrap_or_default();
                    let video = build_video_params(&session, &attributes);
                    let audio = build_audio_params(&session, &attributes);
                    info!(
                        "RTSP negotiation complete for session {} ({}x{}@{}, {} kbps)",
                        session.session_id,
                        video.display_mode.width,
                        video.display_mode.height,
                        video.display_mode.refresh_rate,
                        video.bitrate_kbps
                    );
                    state.publish_video_session(video);
                    state.publish_audio_session(audio);
                    send_response(&mut reader, 200, "OK", &request.cseq, &[], "").await?;
                }
                None => {
                    send_response(&mut reader, 454, "Session Not Found", &request.cseq, &[], "")
                        .await?
                }
            },
            _ => {
                send_response(&mut reader, 501, "Not Implemented", &request.cseq, &[], "").await?;
            }
        }
    }
}

/// SDP the host advertises on DESCRIBE: which codecs a client may pick and
/// the audio surround parameters.
fn describe_payload(state: &AppState, session: &StreamSession) -> String {
    let mut sdp = String::from("v=0\r\n");
    sdp.push_str(&format!(
        "o=- {} 1 IN IP4 {}\r\n",
        session.session_id, session.client_ip
    ));
    sdp.push_str("s=Selene Streaming\r\nt=0 0\r\n");

    if state.store().support_hevc() && session.app.hevc_pipeline.is_some() {
        sdp.push_str("a=sprop-parameter-sets=AAAAAU\r\n");
        if session.display_mode.hdr {
            sdp.push_str("a=x-selene-hdr-supported:1\r\n");
        }
    }
    if state.store().support_av1() && session.app.av1_pipeline.is_some() {
        sdp.push_str("a=rtpmap:98 AV1/90000\r\n");
    }

    let mode = AudioMode::from_channel_count(session.audio_channel_count);
    let mapping: String = (0..mode.channels).map(|c| c.to_string()).collect();
    sdp.push_str(&format!(
        "a=fmtp:97 surround-params={}{}{}{}\r\n",
        mode.channels, mode.streams, mode.coupled_streams, mapping
    ));
    sdp
}

/// Negotiated bitstream formats, from `x-nv-vqos[0].bitStreamFormat`.
const BITSTREAM_H264: i64 = 0;
const BITSTREAM_HEVC: i64 = 1;
const BITSTREAM_AV1: i64 = 2;

/// Turn the ANNOUNCE attribute soup into the video pipeline contract.
pub(crate) fn build_video_params(
    session: &StreamSession,
    attributes: &HashMap<String, String>,
) -> VideoSessionParams {
    let display_mode = DisplayMode {
        width: attr_i64(
            attributes,
            "x-nv-video[0].clientViewportWd",
            session.display_mode.width as i64,
        ) as u32,
        height: attr_i64(
            attributes,
            "x-nv-video[0].clientViewportHt",
            session.display_mode.height as i64,
        ) as u32,
        refresh_rate: attr_i64(
            attributes,
            "x-nv-video[0].maxFPS",
            session.display_mode.refresh_rate as i64,
        ) as u32,
        hdr: session.display_mode.hdr,
    };

    // encoderCscMode: bit 0 toggles full range, the rest picks the matrix
    let csc = attr_i64(attributes, "x-nv-video[0].encoderCscMode", 0);
    let color_range = if csc & 0x1 != 0 {
        ColorRange::Jpeg
    } else {
        ColorRange::Mpeg
    };
    let color_space = match csc >> 1 {
        0 => ColorSpace::Bt601,
        1 => ColorSpace::Bt709,
        _ => ColorSpace::Bt2020,
    };

    let bitrate_kbps = attr_i64(attributes, "x-nv-vqos[0].bw.maximumBitrateKbps", 10_000);
    let packet_size = attr_i64(attributes, "x-nv-video[0].packetSize", 1024);

    let description = match attr_i64(attributes, "x-nv-vqos[0].bitStreamFormat", BITSTREAM_H264) {
        BITSTREAM_HEVC => session.app.hevc_pipeline.as_deref().unwrap_or_else(|| {
            warn!("Client negotiated HEVC but the app has no HEVC pipeline, using H264");
            &session.app.h264_pipeline
        }),
        BITSTREAM_AV1 => session.app.av1_pipeline.as_deref().unwrap_or_else(|| {
            warn!("Client negotiated AV1 but the app has no AV1 pipeline, using H264");
            &session.app.h264_pipeline
        }),
        _ => &session.app.h264_pipeline,
    };
    let pipeline = render_pipeline(
        description,
        &PipelineContext {
            session_id: session.session_id,
            client_ip: session.client_ip,
            port: session.video_port,
            width: display_mode.width,
            height: display_mode.height,
            fps: display_mode.refresh_rate,
            bitrate_kbps,
            packet_size,
            color_range,
            color_space,
            aes_key: None,
            aes_iv: None,
        },
    );

    VideoSessionParams {
        session_id: session.session_id,
        display_mode,
        pipeline,
        port: session.video_port,
        timeout_ms: attr_i64(attributes, "x-nv-video[0].timeoutLengthMs", 7_000),
        packet_size,
        frames_with_invalid_ref_threshold: attr_i64(
            attributes,
            "x-nv-video[0].framesWithInvalidRefThreshold",
            0,
        ),
        fec_percentage: attr_i64(attributes, "x-nv-vqos[0].fec.percentage", 20),
        min_required_fec_packets: attr_i64(
            attributes,
            "x-nv-vqos[0].fec.minRequiredFecPackets",
            2,
        ),
        bitrate_kbps,
        slices_per_frame: attr_i64(attributes, "x-nv-video[0].videoEncoderSlicesPerFrame", 1),
        color_range,
        color_space,
        client_ip: session.client_ip,
    }
}

/// Audio encryption flag inside `x-nv-general.featureFlags`.
const FEATURE_AUDIO_ENCRYPTION: i64 = 0x20;

/// Turn the ANNOUNCE attribute soup into the audio pipeline contract.
pub(crate) fn build_audio_params(
    session: &StreamSession,
    attributes: &HashMap<String, String>,
) -> AudioSessionParams {
    let channels = attr_i64(
        attributes,
        "x-nv-audio.surround.channelCount",
        session.audio_channel_count as i64,
    );
    let audio_mode = AudioMode::from_channel_count(channels as u32);
    let feature_flags = attr_i64(
        attributes,
        "x-nv-general.featureFlags",
        FEATURE_AUDIO_ENCRYPTION,
    );

    let pipeline = render_pipeline(
        &session.app.opus_pipeline,
        &PipelineContext {
            session_id: session.session_id,
            client_ip: session.client_ip,
            port: session.audio_port,
            width: session.display_mode.width,
            height: session.display_mode.height,
            fps: session.display_mode.refresh_rate,
            bitrate_kbps: 0,
            packet_size: 0,
            color_range: ColorRange::Mpeg,
            color_space: ColorSpace::Bt709,
            aes_key: Some(&session.aes_key),
            aes_iv: Some(&session.aes_iv),
        },
    );

    AudioSessionParams {
        session_id: session.session_id,
        pipeline,
        encrypt_audio: feature_flags & FEATURE_AUDIO_ENCRYPTION != 0,
        aes_key: session.aes_key,
        aes_iv: session.aes_iv,
        port: session.audio_port,
        client_ip: session.client_ip,
        packet_duration_ms: attr_i64(attributes, "x-nv-aqos.packetDuration", 5),
        audio_mode,
    }
}

async fn send_response<S>(
    reader: &mut BufReader<S>,
    code: u16,
    reason: &str,
    cseq: &str,
    headers: &[(&str, String)],
    body: &str,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut response = format!("RTSP/1.0 {} {}\r\nCSeq: {}\r\n", code, reason, cseq);
    for (name, value) in headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !body.is_empty() {
        response.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    response.push_str("\r\n");
    response.push_str(body);

    reader.get_mut().write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::state::tests::{test_client, test_state};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::io::duplex;

    const PEER: &str = "10.0.0.2:53000";

    async fn launched_state() -> (tempfile::TempDir, AppState, Arc<StreamSession>) {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let client = test_client();
        let session = state
            .launch_session(
                "steam",
                &client,
                "10.0.0.2".parse().unwrap(),
                Some([3u8; 16]),
                Some(1),
                None,
                2,
            )
            .unwrap();
        (dir, state, session)
    }

    async fn exchange(state: AppState, requests: &str) -> String {
        let (mut client, server) = duplex(64 * 1024);
        let handle = tokio::spawn(handle_connection(
            server,
            PEER.parse().unwrap(),
            state,
        ));

        client.write_all(requests.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        handle.await.unwrap().unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn options_lists_supported_methods() {
        let (_dir, state, _session) = launched_state().await;
        let response = exchange(state, "OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n").await;
        assert!(response.starts_with("RTSP/1.0 200 OK"));
        assert!(response.contains("ANNOUNCE"));
        assert!(response.contains("CSeq: 1"));
    }

    #[tokio::test]
    async fn describe_without_session_is_not_found() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let response = exchange(
            state,
            "DESCRIBE rtsp://10.0.0.1:48010 RTSP/1.0\r\nCSeq: 2\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("RTSP/1.0 454"));
    }

    #[tokio::test]
    async fn setup_returns_the_stream_ports() {
        let (_dir, state, session) = launched_state().await;
        let requests = format!(
            "SETUP rtsp://10.0.0.1:48010/streamid=video/0/0 RTSP/1.0\r\nCSeq: 3\r\n\r\n\
             SETUP rtsp://10.0.0.1:48010/streamid=audio/0/0 RTSP/1.0\r\nCSeq: 4\r\n\r\n"
        );
        let response = exchange(state, &requests).await;
        assert!(response.contains(&format!("server_port={}", session.video_port)));
        assert!(response.contains(&format!("server_port={}", session.audio_port)));
    }

    #[tokio::test]
    async fn announce_then_play_publishes_negotiated_params() {
        let (_dir, state, session) = launched_state().await;
        let (_regs, mut rx) = state.bus().subscribe_channel_many(&[
            EventKind::VideoSessionReady,
            EventKind::AudioSessionReady,
        ]);

        let sdp = "a=x-nv-video[0].clientViewportWd:1280 \r\n\
                   a=x-nv-video[0].clientViewportHt:720 \r\n\
                   a=x-nv-video[0].maxFPS:120 \r\n\
                   a=x-nv-vqos[0].bw.maximumBitrateKbps:15000 \r\n\
                   a=x-nv-aqos.packetDuration:10 \r\n";
        let requests = format!(
            "ANNOUNCE streamid=control RTSP/1.0\r\nCSeq: 5\r\nContent-Length: {}\r\n\r\n{}\
             PLAY streamid=video RTSP/1.0\r\nCSeq: 6\r\n\r\n",
            sdp.len(),
            sdp
        );
        let response = exchange(state, &requests).await;
        assert_eq!(response.matches("RTSP/1.0 200 OK").count(), 2);

        let video = rx.recv().await.unwrap();
        let SessionEventMatched::Video(video) = matched(video) else {
            panic!("expected video params first")
        };
        assert_eq!(video.session_id, session.session_id);
        assert_eq!(video.display_mode.width, 1280);
        assert_eq!(video.display_mode.refresh_rate, 120);
        assert_eq!(video.bitrate_kbps, 15000);
        assert!(video.pipeline.contains("bitrate=15000"));

        let audio = rx.recv().await.unwrap();
        let SessionEventMatched::Audio(audio) = matched(audio) else {
            panic!("expected audio params second")
        };
        assert_eq!(audio.packet_duration_ms, 10);
        assert!(audio.encrypt_audio);
        assert_eq!(audio.aes_key, [3u8; 16]);
    }

    enum SessionEventMatched {
        Video(Arc<VideoSessionParams>),
        Audio(Arc<AudioSessionParams>),
    }

    fn matched(ev: crate::events::SessionEvent) -> SessionEventMatched {
        match ev {
            crate::events::SessionEvent::VideoSessionReady(p) => SessionEventMatched::Video(p),
            crate::events::SessionEvent::AudioSessionReady(p) => SessionEventMatched::Audio(p),
            other => panic!("unexpected event {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn csc_mode_maps_color_parameters() {
        let (_dir, _state, session) = launched_state().await;

        let mut attributes = HashMap::new();
        attributes.insert("x-nv-video[0].encoderCscMode".to_string(), "3".to_string());
        let params = build_video_params(&session, &attributes);
        assert_eq!(params.color_range, ColorRange::Jpeg);
        assert_eq!(params.color_space, ColorSpace::Bt709);

        attributes.insert("x-nv-video[0].encoderCscMode".to_string(), "4".to_string());
        let params = build_video_params(&session, &attributes);
        assert_eq!(params.color_range, ColorRange::Mpeg);
        assert_eq!(params.color_space, ColorSpace::Bt2020);
    }
}
