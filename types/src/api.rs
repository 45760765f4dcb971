//! Request/response types of the localhost admin API.

use serde::{Deserialize, Serialize};

/// Standard error payload returned by admin endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// A pairing handshake waiting for its PIN.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PendingPairRequest {
    /// Opaque secret identifying the in-flight handshake
    pub pair_secret: String,
    /// Address of the client asking to pair
    pub client_ip: String,
}

/// List of pairing handshakes currently waiting for a PIN.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PendingPairListResponse {
    pub requests: Vec<PendingPairRequest>,
}

/// PIN submission for a pending pairing handshake.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PairPinRequest {
    pub pair_secret: String,
    /// The PIN displayed by the remote Moonlight client
    pub pin: String,
}

/// Outcome of a PIN submission.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PairResponse {
    pub success: bool,
}

/// Snapshot of one active streaming session.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SessionInfo {
    pub session_id: u64,
    pub app_id: String,
    pub client_ip: String,
    pub video_port: u16,
    pub audio_port: u16,
    pub display_width: u32,
    pub display_height: u32,
    pub refresh_rate: u32,
}

/// List of active streaming sessions.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}
