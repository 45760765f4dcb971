//! Paired client records.

use serde::{Deserialize, Serialize};

fn default_run_uid() -> u32 {
    1000
}

fn default_run_gid() -> u32 {
    1000
}

/// A Moonlight client that completed the pairing handshake.
///
/// Identity is the client certificate: two records refer to the same client
/// when one certificate verifies against the other, never when the PEM
/// strings happen to be equal.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PairedClient {
    /// Opaque identifier assigned at pairing time
    pub client_id: String,
    /// Client certificate, PEM encoded
    pub client_cert: String,
    /// Folder where per-client app state (saves, configs) is kept
    pub app_state_folder: String,
    /// uid the runner switches to when launching apps for this client
    #[serde(default = "default_run_uid")]
    pub run_uid: u32,
    /// gid the runner switches to when launching apps for this client
    #[serde(default = "default_run_gid")]
    pub run_gid: u32,
}
