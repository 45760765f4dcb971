//! Runtime settings.
//!
//! Priority chain: defaults < user config file < local `.selene.toml` <
//! `SELENE_*` environment variables < CLI arguments.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration structure that matches the TOML file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_http_port")]
    http_port: u16,
    #[serde(default = "default_https_port")]
    https_port: u16,
    #[serde(default = "default_admin_port")]
    admin_port: u16,
    #[serde(default = "default_rtsp_port")]
    rtsp_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            https_port: default_https_port(),
            admin_port: default_admin_port(),
            rtsp_port: default_rtsp_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StorageConfig {
    data_dir: Option<PathBuf>,
    state_path: Option<PathBuf>,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    apps_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionConfig {
    #[serde(default = "default_stream_port_first")]
    stream_port_first: u16,
    #[serde(default = "default_stream_port_count")]
    stream_port_count: u16,
    #[serde(default = "default_pairing_ttl")]
    pairing_ttl_secs: u64,
    #[serde(default = "default_pin_timeout")]
    pin_timeout_secs: u64,
    #[serde(default = "default_plug_queue_capacity")]
    plug_queue_capacity: usize,
    #[serde(default = "default_stop_grace")]
    stop_grace_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stream_port_first: default_stream_port_first(),
            stream_port_count: default_stream_port_count(),
            pairing_ttl_secs: default_pairing_ttl(),
            pin_timeout_secs: default_pin_timeout(),
            plug_queue_capacity: default_plug_queue_capacity(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

fn default_http_port() -> u16 {
    selene_types::DEFAULT_HTTP_PORT
}
fn default_https_port() -> u16 {
    selene_types::DEFAULT_HTTPS_PORT
}
fn default_admin_port() -> u16 {
    selene_types::DEFAULT_ADMIN_PORT
}
fn default_rtsp_port() -> u16 {
    selene_types::DEFAULT_RTSP_PORT
}
fn default_stream_port_first() -> u16 {
    48100
}
fn default_stream_port_count() -> u16 {
    100
}
fn default_pairing_ttl() -> u64 {
    30
}
fn default_pin_timeout() -> u64 {
    60
}
fn default_plug_queue_capacity() -> usize {
    32
}
fn default_stop_grace() -> u64 {
    5
}

/// Resolved application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub http_port: u16,
    pub https_port: u16,
    pub admin_port: u16,
    pub rtsp_port: u16,

    /// Root for host state, certificates and per-client app state
    pub data_dir: PathBuf,
    pub state_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Optional JSON file the app catalogue is loaded from
    pub apps_path: Option<PathBuf>,

    pub stream_port_first: u16,
    pub stream_port_count: u16,
    pub pairing_ttl: Duration,
    pub pin_timeout: Duration,
    pub plug_queue_capacity: usize,
    pub stop_grace: Duration,
}

impl Settings {
    /// Load settings with the full priority chain. CLI overrides are passed
    /// in already parsed.
    pub fn load(
        http_port: Option<u16>,
        https_port: Option<u16>,
        data_dir: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let local_config = std::env::current_dir().ok().map(|d| d.join(".selene.toml"));
        let user_config = directories::ProjectDirs::from("", "", "selene")
            .map(|dirs| dirs.config_dir().join("config.toml"));

        let mut figment = Figment::new().merge(Serialized::defaults(ConfigFile {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            session: SessionConfig::default(),
        }));

        if let Some(ref path) = user_config {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }
        if let Some(ref path) = local_config {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(
            Env::prefixed("SELENE_")
                .map(|key| key.as_str().replace("__", ".").into())
                .split("_"),
        );

        if let Some(p) = http_port {
            figment = figment.merge(Serialized::default("server.http_port", p));
        }
        if let Some(p) = https_port {
            figment = figment.merge(Serialized::default("server.https_port", p));
        }
        if let Some(ref d) = data_dir {
            figment = figment.merge(Serialized::default("storage.data_dir", d));
        }

        let config: ConfigFile = figment.extract()?;
        Ok(Self::resolve(config))
    }

    fn resolve(config: ConfigFile) -> Self {
        let data_dir = config.storage.data_dir.unwrap_or_else(|| {
            directories::ProjectDirs::from("", "", "selene")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."))
        });

        Self {
            http_port: config.server.http_port,
            https_port: config.server.https_port,
            admin_port: config.server.admin_port,
            rtsp_port: config.server.rtsp_port,
            state_path: config
                .storage
                .state_path
                .unwrap_or_else(|| data_dir.join("state.json")),
            cert_path: config
                .storage
                .cert_path
                .unwrap_or_else(|| data_dir.join("cert.pem")),
            key_path: config
                .storage
                .key_path
                .unwrap_or_else(|| data_dir.join("key.pem")),
            apps_path: config.storage.apps_path,
            data_dir,
            stream_port_first: config.session.stream_port_first,
            stream_port_count: config.session.stream_port_count,
            pairing_ttl: Duration::from_secs(config.session.pairing_ttl_secs),
            pin_timeout: Duration::from_secs(config.session.pin_timeout_secs),
            plug_queue_capacity: config.session.plug_queue_capacity,
            stop_grace: Duration::from_secs(config.session.stop_grace_secs),
        }
    }

    /// Settings rooted in an explicit directory, defaults otherwise. Used by
    /// tests and embedding.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = ConfigFile {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            session: SessionConfig::default(),
        };
        config.storage.data_dir = Some(data_dir.into());
        Self::resolve(config)
    }

    pub fn stream_port_range(&self) -> std::ops::Range<u16> {
        self.stream_port_first..self.stream_port_first.saturating_add(self.stream_port_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn defaults_apply_without_config() {
        std::env::remove_var("SELENE_SERVER_HTTP_PORT");

        let temp_dir = TempDir::new().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let settings = Settings::load(None, None, None).unwrap();

        let _ = std::env::set_current_dir(original_dir);

        assert_eq!(settings.http_port, selene_types::DEFAULT_HTTP_PORT);
        assert_eq!(settings.rtsp_port, selene_types::DEFAULT_RTSP_PORT);
        assert_eq!(settings.pairing_ttl, Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn config_file_and_cli_priority() {
        std::env::remove_var("SELENE_SERVER_HTTP_PORT");

        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(".selene.toml"),
            "[server]\nhttp_port = 7000\nhttps_port = 7001",
        )
        .unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        // CLI beats the file, the file beats the default
        let settings = Settings::load(Some(9000), None, None).unwrap();

        let _ = std::env::set_current_dir(original_dir);

        assert_eq!(settings.http_port, 9000);
        assert_eq!(settings.https_port, 7001);
    }

    #[test]
    fn with_data_dir_roots_all_paths() {
        let settings = Settings::with_data_dir("/tmp/selene-test");
        assert_eq!(settings.state_path, PathBuf::from("/tmp/selene-test/state.json"));
        assert_eq!(settings.cert_path, PathBuf::from("/tmp/selene-test/cert.pem"));
        assert_eq!(settings.key_path, PathBuf::from("/tmp/selene-test/key.pem"));
    }

    #[test]
    fn stream_port_range_is_bounded() {
        let mut settings = Settings::with_data_dir("/tmp");
        settings.stream_port_first = 65530;
        settings.stream_port_count = 100;
        let range = settings.stream_port_range();
        assert_eq!(range.end, u16::MAX);
    }
}
