//! Persistent host state: paired clients, apps and host identity.
//!
//! Readers take cheap `Arc` snapshots of the two collections and never block
//! writers; writers build a new snapshot, persist it, then swap. The state
//! file is rewritten atomically (write-temp + rename) after every successful
//! mutation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use selene_types::{App, PairedClient};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::crypto;
use crate::error::HostError;

const STATE_VERSION: u32 = 1;

/// Error type for state-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("app not found: {0}")]
    AppNotFound(String),

    #[error("client already paired")]
    AlreadyPaired,

    #[error("client not paired")]
    NotPaired,

    #[error("corrupt state file {0:?}: {1}")]
    Corrupt(PathBuf, serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

impl From<StoreError> for HostError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AppNotFound(id) => HostError::NotFound(format!("app {}", id)),
            StoreError::AlreadyPaired | StoreError::NotPaired => {
                HostError::PairingFailed(e.to_string())
            }
            StoreError::Io(_) | StoreError::Serialization(_) => HostError::Transient(e.to_string()),
            StoreError::Corrupt(..) | StoreError::Crypto(_) => HostError::Transient(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// On-disk state file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    hostname: String,
    uuid: String,
    support_hevc: bool,
    support_av1: bool,
    paired_clients: Vec<PairedClient>,
    apps: Vec<App>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            hostname: default_hostname(),
            uuid: uuid::Uuid::new_v4().to_string(),
            support_hevc: true,
            support_av1: false,
            paired_clients: Vec::new(),
            apps: Vec::new(),
        }
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "selene".to_string())
}

/// The shared mutable state every session reads from and pairing writes to.
pub struct HostStore {
    state_path: PathBuf,

    hostname: String,
    uuid: String,
    support_hevc: bool,
    support_av1: bool,

    host_cert: X509,
    host_key: PKey<Private>,

    paired_clients: RwLock<Arc<Vec<PairedClient>>>,
    apps: RwLock<Arc<Vec<App>>>,

    /// Writers serialize here; the persisted file reflects every committed
    /// mutation in order.
    persist_lock: Mutex<()>,
}

impl HostStore {
    /// Load the persisted state, or generate defaults if nothing is there:
    /// a fresh uuid, a 2048-bit RSA key, a self-signed certificate, HEVC on,
    /// AV1 off, no apps and an empty paired set.
    ///
    /// A present-but-unparseable state file is the one fatal condition in
    /// the host: it is never silently overwritten.
    pub async fn load_or_default(
        state_path: impl AsRef<Path>,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let state_path = state_path.as_ref().to_path_buf();
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let (state, fresh) = match fs::read_to_string(&state_path).await {
            Ok(contents) if !contents.trim().is_empty() => {
                let state: StateFile = serde_json::from_str(&contents)
                    .map_err(|e| StoreError::Corrupt(state_path.clone(), e))?;
                info!(
                    "Loaded host state from {:?} ({} paired clients, {} apps)",
                    state_path,
                    state.paired_clients.len(),
                    state.apps.len()
                );
                (state, false)
            }
            _ => {
                info!("No host state at {:?}, generating defaults", state_path);
                (StateFile::default(), true)
            }
        };

        let (host_cert, host_key) = Self::load_or_generate_identity(cert_path, key_path).await?;

        let store = Self {
            state_path,
            hostname: state.hostname.clone(),
            uuid: state.uuid.clone(),
            support_hevc: state.support_hevc,
            support_av1: state.support_av1,
            host_cert,
            host_key,
            paired_clients: RwLock::new(Arc::new(state.paired_clients)),
            apps: RwLock::new(Arc::new(state.apps)),
            persist_lock: Mutex::new(()),
        };

        if fresh {
            store.persist().await?;
        }
        Ok(store)
    }

    async fn load_or_generate_identity(
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<(X509, PKey<Private>)> {
        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(cert_path).await?;
            let key_pem = fs::read_to_string(key_path).await?;
            let cert = crypto::cert_from_pem(&cert_pem)?;
            let key = crypto::pkey_from_pem(&key_pem)?;
            debug!("Loaded host certificate from {:?}", cert_path);
            return Ok((cert, key));
        }

        info!("Generating host RSA key and self-signed certificate");
        let key = crypto::generate_key()?;
        let cert = crypto::generate_x509(&key, "Selene")?;

        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(cert_path, crypto::cert_to_pem(&cert)?).await?;
        fs::write(key_path, crypto::pkey_to_pem(&key)?).await?;
        Ok((cert, key))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn support_hevc(&self) -> bool {
        self.support_hevc
    }

    pub fn support_av1(&self) -> bool {
        self.support_av1
    }

    pub fn host_cert(&self) -> &X509 {
        &self.host_cert
    }

    pub fn host_key(&self) -> &PKey<Private> {
        &self.host_key
    }

    /// Snapshot of the paired-client set.
    pub fn paired_clients(&self) -> Arc<Vec<PairedClient>> {
        self.paired_clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the app set.
    pub fn apps(&self) -> Arc<Vec<App>> {
        self.apps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the app set (loaded from an apps config by the front-end).
    pub fn set_apps(&self, apps: Vec<App>) {
        let mut guard = self.apps.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(apps);
    }

    /// Atomically add `client` to the paired set and persist.
    ///
    /// A certificate that already verifies against a stored client is
    /// rejected; two PEM strings are never compared directly.
    pub async fn pair(&self, client: PairedClient) -> Result<()> {
        let guard = self.persist_lock.lock().await;

        if self.get_client_via_ssl(&client.client_cert).is_some() {
            return Err(StoreError::AlreadyPaired);
        }

        let next = {
            let current = self.paired_clients();
            let mut next = current.as_ref().clone();
            next.push(client.clone());
            Arc::new(next)
        };

        self.write_state_file(&next, &self.apps()).await?;
        {
            let mut clients = self
                .paired_clients
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *clients = next;
        }
        drop(guard);

        info!("Paired client {}", client.client_id);
        Ok(())
    }

    /// Atomically remove the client matching `client`'s certificate.
    pub async fn unpair(&self, client: &PairedClient) -> Result<()> {
        let guard = self.persist_lock.lock().await;

        let presented = crypto::cert_from_pem(&client.client_cert)?;
        let current = self.paired_clients();
        let next: Vec<PairedClient> = current
            .iter()
            .filter(|stored| !certs_match(&stored.client_cert, &presented))
            .cloned()
            .collect();

        if next.len() == current.len() {
            return Err(StoreError::NotPaired);
        }

        let next = Arc::new(next);
        self.write_state_file(&next, &self.apps()).await?;
        {
            let mut clients = self
                .paired_clients
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *clients = next;
        }
        drop(guard);

        info!("Unpaired client {}", client.client_id);
        Ok(())
    }

    /// First stored client whose certificate verifies against the presented
    /// one, in insertion order.
    pub fn get_client_via_ssl(&self, client_cert_pem: &str) -> Option<PairedClient> {
        let presented = match crypto::cert_from_pem(client_cert_pem) {
            Ok(cert) => cert,
            Err(e) => {
                trace!("Unparseable client certificate: {}", e);
                return None;
            }
        };
        self.paired_clients()
            .iter()
            .find(|stored| certs_match(&stored.client_cert, &presented))
            .cloned()
    }

    /// App with the given id; `AppNotFound` otherwise.
    pub fn get_app_by_id(&self, app_id: &str) -> Result<App> {
        self.apps()
            .iter()
            .find(|app| app.id == app_id)
            .cloned()
            .ok_or_else(|| StoreError::AppNotFound(app_id.to_string()))
    }

    /// Persist the current snapshots. Serialized with mutations.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        self.write_state_file(&self.paired_clients(), &self.apps())
            .await
    }

    async fn write_state_file(&self, clients: &[PairedClient], apps: &[App]) -> Result<()> {
        let state = StateFile {
            version: STATE_VERSION,
            hostname: self.hostname.clone(),
            uuid: self.uuid.clone(),
            support_hevc: self.support_hevc,
            support_av1: self.support_av1,
            paired_clients: clients.to_vec(),
            apps: apps.to_vec(),
        };
        let json = serde_json::to_string_pretty(&state)?;

        if let Some(parent) = self.state_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }

        // Write to a temporary file first, then rename (atomic operation)
        let temp_path = self.state_path.with_extension("tmp");
        fs::write(&temp_path, json).await?;
        fs::rename(&temp_path, &self.state_path).await?;
        debug!(
            "Wrote host state to {:?} ({} clients, {} apps)",
            self.state_path,
            clients.len(),
            apps.len()
        );
        Ok(())
    }
}

/// Whether the stored PEM verifies against the presented certificate.
fn certs_match(stored_pem: &str, presented: &X509) -> bool {
    let stored = match crypto::cert_from_pem(stored_pem) {
        Ok(cert) => cert,
        Err(e) => {
            warn!("Stored client certificate failed to parse: {}", e);
            return false;
        }
    };
    match crypto::verification_error(&stored, presented) {
        None => true,
        Some(reason) => {
            trace!("X509 certificate verification error: {}", reason);
            false
        }
    }
}
