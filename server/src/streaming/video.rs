//! Video sub-session: pipeline lifecycle and IDR coalescing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::HostError;
use crate::events::VideoSessionParams;
use crate::media::{PipelineEngine, PipelineHandle};

/// Owns the video pipeline of one session.
///
/// Pause keeps the last negotiated parameters so Resume restarts the
/// pipeline with them bit-exactly; IDR requests inside one frame interval
/// coalesce into a single request towards the encoder.
pub struct VideoStream {
    engine: Arc<dyn PipelineEngine>,
    handle: Option<Box<dyn PipelineHandle>>,
    last_params: Option<Arc<VideoSessionParams>>,
    last_idr: Option<Instant>,
}

impl VideoStream {
    pub fn new(engine: Arc<dyn PipelineEngine>) -> Self {
        Self {
            engine,
            handle: None,
            last_params: None,
            last_idr: None,
        }
    }

    /// One frame at the negotiated refresh rate.
    fn frame_interval(&self) -> Duration {
        let fps = self
            .last_params
            .as_ref()
            .map(|p| p.display_mode.refresh_rate.max(1))
            .unwrap_or(60);
        Duration::from_secs(1) / fps
    }

    fn start(&mut self, params: &Arc<VideoSessionParams>) -> Result<(), HostError> {
        let handle = self.engine.start_video(params)?;
        self.handle = Some(handle);
        self.last_idr = None;
        Ok(())
    }

    /// Fresh parameters from RTSP negotiation: (re)start the pipeline.
    pub fn on_ready(&mut self, params: Arc<VideoSessionParams>) {
        self.stop_pipeline();
        match self.start(&params) {
            Ok(()) => {
                info!(
                    "Video pipeline running for session {} on port {}",
                    params.session_id, params.port
                );
                self.last_params = Some(params);
            }
            Err(e) => warn!(
                "Video pipeline start failed for session {}: {}",
                params.session_id, e
            ),
        }
    }

    /// Returns true when the request actually reached the encoder; requests
    /// within one frame interval of the previous one coalesce.
    pub fn on_idr(&mut self) -> bool {
        if self.handle.is_none() {
            return false;
        }
        let interval = self.frame_interval();
        if let Some(last) = self.last_idr {
            if last.elapsed() < interval {
                debug!("Coalescing duplicate IDR request");
                return false;
            }
        }
        if let Some(handle) = self.handle.as_mut() {
            handle.request_idr();
        }
        self.last_idr = Some(Instant::now());
        true
    }

    /// Stop the pipeline, keep the parameters for resume.
    pub fn on_pause(&mut self) {
        self.stop_pipeline();
    }

    /// Restart from the last negotiated parameters.
    pub fn on_resume(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let Some(params) = self.last_params.clone() else {
            warn!("Resume without prior video negotiation, ignoring");
            return;
        };
        if let Err(e) = self.start(&params) {
            warn!(
                "Video pipeline resume failed for session {}: {}",
                params.session_id, e
            );
        }
    }

    /// Terminal stop.
    pub fn on_stop(&mut self) {
        self.stop_pipeline();
        self.last_params = None;
    }

    fn stop_pipeline(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn last_params(&self) -> Option<&Arc<VideoSessionParams>> {
        self.last_params.as_ref()
    }

    /// Frame interval the coalescer currently uses, for tests and stats.
    pub fn idr_window(&self) -> Duration {
        self.frame_interval()
    }
}
