//! Shared types for the Selene game-streaming host.
//!
//! This crate contains the serializable domain models and admin API types
//! shared between the server and any management front-end.

pub mod api;
pub mod app;
pub mod client;
pub mod events;
pub mod session;

// Re-export commonly used types
pub use api::{
    ErrorResponse, PairPinRequest, PairResponse, PendingPairListResponse, PendingPairRequest,
    SessionInfo, SessionListResponse,
};
pub use app::{App, ControllerKind, RunnerConfig};
pub use client::PairedClient;
pub use events::AdminEvent;
pub use session::{AudioMode, ColorRange, ColorSpace, DisplayMode};

/// Default port of the plain-HTTP Moonlight endpoint (pairing).
pub const DEFAULT_HTTP_PORT: u16 = 47989;
/// Default port of the mutual-TLS Moonlight endpoint (launch).
pub const DEFAULT_HTTPS_PORT: u16 = 47984;
/// Default port of the RTSP negotiator.
pub const DEFAULT_RTSP_PORT: u16 = 48010;
/// Default port of the localhost admin API.
pub const DEFAULT_ADMIN_PORT: u16 = 47990;
