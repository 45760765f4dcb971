//! Events broadcast to admin API clients over SSE.

use serde::{Deserialize, Serialize};

/// Event types streamed to management front-ends.
///
/// These mirror the host's internal lifecycle but carry only serializable
/// data; runtime handles (devices, pipelines, queues) never leave the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AdminEvent {
    /// A client started the pairing handshake and a PIN is needed
    PairRequested {
        pair_secret: String,
        client_ip: String,
    },
    /// Pairing completed and the client was persisted
    ClientPaired { client_id: String },
    /// A paired client was removed
    ClientUnpaired { client_id: String },
    /// A session was created by a launch request
    SessionStarted { session_id: u64, app_id: String },
    /// A session's media pipelines were paused
    SessionPaused { session_id: u64 },
    /// A session's media pipelines were resumed
    SessionResumed { session_id: u64 },
    /// A session ended and its resources were released
    SessionStopped { session_id: u64 },
}

impl AdminEvent {
    /// Get a human-readable description of the event.
    pub fn description(&self) -> String {
        match self {
            AdminEvent::PairRequested { client_ip, .. } => {
                format!("Pair requested by {}", client_ip)
            }
            AdminEvent::ClientPaired { client_id } => format!("Client {} paired", client_id),
            AdminEvent::ClientUnpaired { client_id } => format!("Client {} unpaired", client_id),
            AdminEvent::SessionStarted { session_id, app_id } => {
                format!("Session {} started for app {}", session_id, app_id)
            }
            AdminEvent::SessionPaused { session_id } => format!("Session {} paused", session_id),
            AdminEvent::SessionResumed { session_id } => format!("Session {} resumed", session_id),
            AdminEvent::SessionStopped { session_id } => format!("Session {} stopped", session_id),
        }
    }
}
