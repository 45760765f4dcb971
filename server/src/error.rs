//! Error kinds shared across the host core.

use axum::http::StatusCode;

/// Errors surfaced by the session-and-streaming core.
///
/// Parse and crypto failures inside pairing terminate the in-flight exchange
/// only; runner failures terminate the owning session only; persistence
/// failures surface as [`HostError::Transient`] and leave the in-memory
/// snapshot untouched. Nothing here aborts the process.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// No paired client matches the presented certificate
    #[error("no paired client matches the presented certificate")]
    Unauthorized,

    /// Unknown app or session
    #[error("not found: {0}")]
    NotFound(String),

    /// Any step of the pairing handshake failed or timed out
    #[error("pairing failed: {0}")]
    PairingFailed(String),

    /// Malformed RTSP/HTTP/SDP input
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Runner could not start or exited unexpectedly
    #[error("runner failed: {0}")]
    RunnerFailed(String),

    /// No free UDP port, queue overflow and the like
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Retriable I/O error
    #[error("transient: {0}")]
    Transient(String),
}

impl HostError {
    /// Numeric status reported to HTTP clients.
    pub fn http_status(&self) -> StatusCode {
        match self {
            HostError::Unauthorized => StatusCode::UNAUTHORIZED,
            HostError::NotFound(_) => StatusCode::NOT_FOUND,
            HostError::PairingFailed(_) => StatusCode::BAD_REQUEST,
            HostError::Protocol(_) => StatusCode::BAD_REQUEST,
            HostError::RunnerFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            HostError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            HostError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<openssl::error::ErrorStack> for HostError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        HostError::PairingFailed(format!("crypto error: {}", e))
    }
}

impl From<hex::FromHexError> for HostError {
    fn from(e: hex::FromHexError) -> Self {
        HostError::Protocol(format!("invalid hex field: {}", e))
    }
}
