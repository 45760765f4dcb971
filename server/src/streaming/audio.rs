//! Audio sub-session: pipeline lifecycle.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::HostError;
use crate::events::AudioSessionParams;
use crate::media::{PipelineEngine, PipelineHandle};

/// Owns the audio pipeline of one session. Same pause/resume semantics as
/// video: resume reuses the last negotiated parameters unchanged.
pub struct AudioStream {
    engine: Arc<dyn PipelineEngine>,
    handle: Option<Box<dyn PipelineHandle>>,
    last_params: Option<Arc<AudioSessionParams>>,
}

impl AudioStream {
    pub fn new(engine: Arc<dyn PipelineEngine>) -> Self {
        Self {
            engine,
            handle: None,
            last_params: None,
        }
    }

    fn start(&mut self, params: &Arc<AudioSessionParams>) -> Result<(), HostError> {
        self.handle = Some(self.engine.start_audio(params)?);
        Ok(())
    }

    pub fn on_ready(&mut self, params: Arc<AudioSessionParams>) {
        self.stop_pipeline();
        match self.start(&params) {
            Ok(()) => {
                info!(
                    "Audio pipeline running for session {} on port {} ({} ch{})",
                    params.session_id,
                    params.port,
                    params.audio_mode.channels,
                    if params.encrypt_audio { ", encrypted" } else { "" }
                );
                self.last_params = Some(params);
            }
            Err(e) => warn!(
                "Audio pipeline start failed for session {}: {}",
                params.session_id, e
            ),
        }
    }

    pub fn on_pause(&mut self) {
        self.stop_pipeline();
    }

    pub fn on_resume(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let Some(params) = self.last_params.clone() else {
            warn!("Resume without prior audio negotiation, ignoring");
            return;
        };
        if let Err(e) = self.start(&params) {
            warn!(
                "Audio pipeline resume failed for session {}: {}",
                params.session_id, e
            );
        }
    }

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

    pub fn last_params(&self) -> Option<&Arc<AudioSessionParams>> {
        self.last_params.as_ref()
    }
}
