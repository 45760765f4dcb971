//! Selene host library.
//!
//! This crate exposes the router constructors and application state so
//! integration tests can drive the host in-process.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod crypto;
pub mod devices;
pub mod error;
pub mod events;
pub mod media;
pub mod pairing;
pub mod rtsp;
pub mod runners;
pub mod sessions;
pub mod state;
pub mod store;
pub mod streaming;
pub mod tls;

pub use api::{admin_router, moonlight_http_router, moonlight_https_router};
pub use config::Settings;
pub use error::HostError;
pub use state::AppState;
