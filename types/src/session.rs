//! Negotiated stream parameters shared across the host.

use serde::{Deserialize, Serialize};

/// Resolution and refresh rate requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    #[serde(default)]
    pub hdr: bool,
}

impl Default for DisplayMode {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            refresh_rate: 60,
            hdr: false,
        }
    }
}

/// Color range negotiated over RTSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorRange {
    Jpeg,
    Mpeg,
}

/// Color space negotiated over RTSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSpace {
    Bt601,
    Bt709,
    Bt2020,
}

/// Speaker layout of the audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioMode {
    pub channels: u8,
    /// Opus streams the channels are packed into
    pub streams: u8,
    pub coupled_streams: u8,
}

impl AudioMode {
    /// Stereo, the Moonlight default.
    pub fn stereo() -> Self {
        Self {
            channels: 2,
            streams: 1,
            coupled_streams: 1,
        }
    }

    /// 5.1 surround.
    pub fn surround51() -> Self {
        Self {
            channels: 6,
            streams: 4,
            coupled_streams: 2,
        }
    }

    /// 7.1 surround.
    pub fn surround71() -> Self {
        Self {
            channels: 8,
            streams: 5,
            coupled_streams: 3,
        }
    }

    /// Map a Moonlight channel count to the matching layout.
    pub fn from_channel_count(channels: u32) -> Self {
        match channels {
            6 => Self::surround51(),
            8 => Self::surround71(),
            _ => Self::stereo(),
        }
    }
}
