//! Streamable application definitions.

use serde::{Deserialize, Serialize};

/// Which kind of virtual joypad is created for a session of this app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    Xbox,
    Ps,
    Nintendo,
    Auto,
}

impl Default for ControllerKind {
    fn default() -> Self {
        ControllerKind::Auto
    }
}

/// How an app is started, as persisted in the state file.
///
/// The discriminator field is `type`, matching the on-disk format.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerConfig {
    /// Plain child process on the host
    Process {
        run_cmd: String,
    },
    /// Container started from an image
    Docker {
        image: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        mounts: Vec<String>,
        #[serde(default)]
        env: Vec<String>,
        #[serde(default)]
        devices: Vec<String>,
    },
    /// Co-op session piggybacking on an already running session
    ChildSession {
        parent_session_id: u64,
    },
}

fn default_true() -> bool {
    true
}

/// An application a paired client can launch.
///
/// Immutable after load; the pipeline fields are opaque descriptions handed
/// to the media engine as-is.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct App {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub support_hdr: bool,

    /// Video pipeline descriptions, one per codec the host may negotiate
    pub h264_pipeline: String,
    #[serde(default)]
    pub hevc_pipeline: Option<String>,
    #[serde(default)]
    pub av1_pipeline: Option<String>,
    /// Audio pipeline description (Opus)
    pub opus_pipeline: String,

    /// GPU render node used for hardware encoding (e.g. /dev/dri/renderD128)
    #[serde(default)]
    pub render_node: String,
    /// Whether a virtual compositor is spun up for this app
    #[serde(default = "default_true")]
    pub start_virtual_compositor: bool,
    #[serde(default)]
    pub joypad_kind: ControllerKind,

    pub runner: RunnerConfig,
}
