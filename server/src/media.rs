//! Media-engine capability.
//!
//! The host never runs codecs itself: it renders a declarative pipeline
//! description and hands it to an engine. The default engine only logs, which
//! keeps the host fully functional headless; deployments wire a real engine
//! (GStreamer or similar) through [`PipelineEngine`].

use std::net::IpAddr;

use selene_types::{ColorRange, ColorSpace};
use tracing::{debug, info};

use crate::error::HostError;
use crate::events::{AudioSessionParams, VideoSessionParams};

/// A started pipeline. Dropping the handle must not leak the pipeline; `stop`
/// is still called explicitly so teardown happens inside the grace period.
pub trait PipelineHandle: Send {
    /// Ask for an intra-coded frame on the next frame boundary.
    fn request_idr(&mut self);
    /// Stop and release the pipeline.
    fn stop(&mut self);
}

/// Capability starting media pipelines from negotiated session parameters.
pub trait PipelineEngine: Send + Sync {
    fn start_video(
        &self,
        params: &VideoSessionParams,
    ) -> Result<Box<dyn PipelineHandle>, HostError>;

    fn start_audio(
        &self,
        params: &AudioSessionParams,
    ) -> Result<Box<dyn PipelineHandle>, HostError>;
}

/// Values interpolated into a pipeline description before it reaches the
/// engine.
pub struct PipelineContext<'a> {
    pub session_id: u64,
    pub client_ip: IpAddr,
    pub port: u16,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: i64,
    pub packet_size: i64,
    pub color_range: ColorRange,
    pub color_space: ColorSpace,
    pub aes_key: Option<&'a [u8; 16]>,
    pub aes_iv: Option<&'a [u8; 16]>,
}

/// Render `{placeholder}`s in a pipeline description.
///
/// Unknown placeholders are left untouched so engine-specific syntax (caps
/// filters, pad templates) survives.
pub fn render_pipeline(description: &str, ctx: &PipelineContext<'_>) -> String {
    let color_range = match ctx.color_range {
        ColorRange::Jpeg => "jpeg",
        ColorRange::Mpeg => "mpeg",
    };
    let color_space = match ctx.color_space {
        ColorSpace::Bt601 => "bt601",
        ColorSpace::Bt709 => "bt709",
        ColorSpace::Bt2020 => "bt2020",
    };

    let mut out = description
        .replace("{session_id}", &ctx.session_id.to_string())
        .replace("{client_ip}", &ctx.client_ip.to_string())
        .replace("{port}", &ctx.port.to_string())
        .replace("{width}", &ctx.width.to_string())
        .replace("{height}", &ctx.height.to_string())
        .replace("{fps}", &ctx.fps.to_string())
        .replace("{bitrate_kbps}", &ctx.bitrate_kbps.to_string())
        .replace("{packet_size}", &ctx.packet_size.to_string())
        .replace("{color_range}", color_range)
        .replace("{color_space}", color_space);

    if let Some(key) = ctx.aes_key {
        out = out.replace("{aes_key}", &hex::encode(key));
    }
    if let Some(iv) = ctx.aes_iv {
        out = out.replace("{aes_iv}", &hex::encode(iv));
    }
    out
}

/// Engine that logs pipeline descriptions instead of executing them.
#[derive(Debug, Default)]
pub struct LogPipelineEngine;

struct LogPipelineHandle {
    label: &'static str,
    session_id: u64,
}

impl PipelineHandle for LogPipelineHandle {
    fn request_idr(&mut self) {
        info!(
            "[{}:{}] IDR frame requested on next frame boundary",
            self.label, self.session_id
        );
    }

    fn stop(&mut self) {
        info!("[{}:{}] pipeline stopped", self.label, self.session_id);
    }
}

impl PipelineEngine for LogPipelineEngine {
    fn start_video(
        &self,
        params: &VideoSessionParams,
    ) -> Result<Box<dyn PipelineHandle>, HostError> {
        debug!(
            "Starting video pipeline for session {}: {}",
            params.session_id, params.pipeline
        );
        Ok(Box::new(LogPipelineHandle {
            label: "video",
            session_id: params.session_id,
        }))
    }

    fn start_audio(
        &self,
        params: &AudioSessionParams,
    ) -> Result<Box<dyn PipelineHandle>, HostError> {
        debug!(
            "Starting audio pipeline for session {}: {}",
            params.session_id, params.pipeline
        );
        Ok(Box::new(LogPipelineHandle {
            label: "audio",
            session_id: params.session_id,
        }))
    }
}
