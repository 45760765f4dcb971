//! The four-phase Moonlight pairing handshake.
//!
//! Each phase arrives as a separate HTTP request. In-flight state lives in a
//! TTL map keyed by the client address (the later phases do not resend the
//! certificate, so the address is the only correlator on the wire). Any
//! phase that decrypts to garbage, fails a comparison or arrives out of
//! order terminates the exchange and evicts its state; nothing here ever
//! touches the process or the paired set until the final verification
//! passes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use selene_types::{AdminEvent, PairedClient, PendingPairRequest};
use tracing::{debug, info, warn};

use crate::broadcast::AdminBroadcaster;
use crate::crypto;
use crate::error::HostError;
use crate::events::{EventBus, PairRequested, SessionEvent};
use crate::store::HostStore;

/// Which request the handshake expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ClientChallenge,
    ServerChallengeResp,
    ClientPairingSecret,
}

struct PairingState {
    client_cert_pem: String,
    aes_key: [u8; 16],
    server_secret: [u8; 16],
    server_challenge: Option<Vec<u8>>,
    client_hash: Option<Vec<u8>>,
    phase: Phase,
    created: Instant,
}

/// Drives pairing handshakes and holds their short-lived state.
pub struct PairingManager {
    bus: Arc<EventBus>,
    broadcaster: AdminBroadcaster,
    ttl: Duration,
    pin_timeout: Duration,

    in_flight: Mutex<HashMap<IpAddr, PairingState>>,
    /// Handshakes waiting for a PIN, keyed by pair secret for the admin API
    pending_pins: Mutex<HashMap<String, Arc<PairRequested>>>,
}

impl PairingManager {
    pub fn new(
        bus: Arc<EventBus>,
        broadcaster: AdminBroadcaster,
        ttl: Duration,
        pin_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            broadcaster,
            ttl,
            pin_timeout,
            in_flight: Mutex::new(HashMap::new()),
            pending_pins: Mutex::new(HashMap::new()),
        }
    }

    /// Phase 1: the client sends its certificate and a random salt.
    ///
    /// Emits a pair request towards the UI, waits (bounded) for the PIN,
    /// derives the exchange key and answers with the host certificate in
    /// hex.
    pub async fn get_server_cert(
        &self,
        store: &HostStore,
        client_ip: IpAddr,
        host_ip: IpAddr,
        salt: &[u8],
        client_cert_pem: String,
    ) -> Result<String, HostError> {
        self.purge_expired();

        if salt.len() != 16 {
            return Err(HostError::PairingFailed(format!(
                "salt must be 16 bytes, got {}",
                salt.len()
            )));
        }
        // reject garbage certificates up front
        crypto::cert_from_pem(&client_cert_pem)
            .map_err(|e| HostError::PairingFailed(format!("unparseable client cert: {}", e)))?;

        let pair_secret = hex::encode(crypto::random_bytes(8));
        let (signal, pin_rx) = PairRequested::new(client_ip, host_ip, pair_secret.clone());
        let signal = Arc::new(signal);

        {
            let mut pending = self
                .pending_pins
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            pending.insert(pair_secret.clone(), signal.clone());
        }
        info!(
            "Pair request from {} (secret {}), waiting for PIN",
            client_ip, pair_secret
        );
        self.bus.publish(SessionEvent::PairRequested(signal));
        self.broadcaster.broadcast(AdminEvent::PairRequested {
            pair_secret: pair_secret.clone(),
            client_ip: client_ip.to_string(),
        });

        let pin = tokio::time::timeout(self.pin_timeout, pin_rx).await;
        {
            let mut pending = self
                .pending_pins
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            pending.remove(&pair_secret);
        }
        let pin = match pin {
            Ok(Ok(pin)) => pin,
            Ok(Err(_)) => {
                return Err(HostError::PairingFailed(
                    "PIN promise dropped before fulfillment".into(),
                ))
            }
            Err(_) => {
                warn!("PIN wait for {} timed out", client_ip);
                return Err(HostError::PairingFailed("PIN wait timed out".into()));
            }
        };

        // aes_key = SHA256(salt || pin)[0..16]
        let mut salted = salt.to_vec();
        salted.extend_from_slice(pin.as_bytes());
        let digest = crypto::sha256(&salted);
        let mut aes_key = [0u8; 16];
        aes_key.copy_from_slice(&digest[..16]);

        let mut server_secret = [0u8; 16];
        server_secret.copy_from_slice(&crypto::random_bytes(16));

        {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            in_flight.insert(
                client_ip,
                PairingState {
                    client_cert_pem,
                    aes_key,
                    server_secret,
                    server_challenge: None,
                    client_hash: None,
                    phase: Phase::ClientChallenge,
                    created: Instant::now(),
                },
            );
        }

        let host_pem = crypto::cert_to_pem(store.host_cert())?;
        Ok(hex::encode_upper(host_pem.as_bytes()))
    }

    /// Phase 2: decrypt the client challenge, answer with
    /// `aes(SHA256(challenge || host_cert_sig || server_challenge) || server_challenge)`.
    pub fn client_challenge(
        &self,
        store: &HostStore,
        client_ip: IpAddr,
        challenge_hex: &str,
    ) -> Result<String, HostError> {
        self.purge_expired();
        let encrypted = hex::decode(challenge_hex)?;
        let host_sig = crypto::cert_signature_bytes(store.host_cert())?;

        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // take the state out; every error path below leaves it evicted
        let mut state = match in_flight.remove(&client_ip) {
            Some(state) if state.phase == Phase::ClientChallenge => state,
            _ => {
                return Err(HostError::PairingFailed(
                    "client challenge out of order".into(),
                ));
            }
        };

        let challenge = match crypto::aes_decrypt_ecb(&state.aes_key, &encrypted, false) {
            Ok(c) if !c.is_empty() => c,
            _ => {
                return Err(HostError::PairingFailed("undecryptable challenge".into()));
            }
        };

        let server_challenge = crypto::random_bytes(16);

        // server_hash = SHA256(challenge || host_cert_signature || server_challenge)
        let mut hashed = challenge;
        hashed.extend_from_slice(&host_sig);
        hashed.extend_from_slice(&server_challenge);
        let server_hash = crypto::sha256(&hashed);

        let mut plain = server_hash.to_vec();
        plain.extend_from_slice(&server_challenge);
        let response = crypto::aes_encrypt_ecb(&state.aes_key, &plain, false)?;

        state.server_challenge = Some(server_challenge);
        state.phase = Phase::ServerChallengeResp;
        in_flight.insert(client_ip, state);
        debug!("Pairing {}: challenge answered", client_ip);
        Ok(hex::encode_upper(response))
    }

    /// Phase 3: store the decrypted client hash, answer with
    /// `aes(server_secret || sign(server_secret))`.
    pub fn server_challenge_resp(
        &self,
        store: &HostStore,
        client_ip: IpAddr,
        resp_hex: &str,
    ) -> Result<String, HostError> {
        self.purge_expired();
        let encrypted = hex::decode(resp_hex)?;

        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // take the state out; every error path below leaves it evicted
        let mut state = match in_flight.remove(&client_ip) {
            Some(state) if state.phase == Phase::ServerChallengeResp => state,
            _ => {
                return Err(HostError::PairingFailed(
                    "server challenge response out of order".into(),
                ));
            }
        };

        let client_hash = match crypto::aes_decrypt_ecb(&state.aes_key, &encrypted, false) {
            Ok(h) if h.len() >= 32 => h[..32].to_vec(),
            _ => {
                return Err(HostError::PairingFailed(
                    "undecryptable client hash".into(),
                ));
            }
        };

        let signature = crypto::sign(&state.server_secret, store.host_key())?;
        let mut plain = state.server_secret.to_vec();
        plain.extend_from_slice(&signature);
        let response = crypto::aes_encrypt_ecb(&state.aes_key, &plain, false)?;

        state.client_hash = Some(client_hash);
        state.phase = Phase::ClientPairingSecret;
        in_flight.insert(client_ip, state);
        debug!("Pairing {}: client hash stored", client_ip);
        Ok(hex::encode_upper(response))
    }

    /// Phase 4: verify the client's secret and signature; on success the
    /// client is inserted into the paired set and persisted.
    pub async fn client_pairing_secret(
        &self,
        store: &HostStore,
        client_ip: IpAddr,
        secret_hex: &str,
        app_state_root: &std::path::Path,
    ) -> Result<PairedClient, HostError> {
        self.purge_expired();
        let payload = hex::decode(secret_hex)?;

        // terminal phase: state is consumed whatever the outcome
        let state = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match in_flight.remove(&client_ip) {
                Some(state) if state.phase == Phase::ClientPairingSecret => state,
                _ => {
                    return Err(HostError::PairingFailed(
                        "client pairing secret out of order".into(),
                    ))
                }
            }
        };

        if payload.len() <= 16 {
            return Err(HostError::PairingFailed("pairing secret too short".into()));
        }
        let (client_secret, signature) = payload.split_at(16);

        let client_cert = crypto::cert_from_pem(&state.client_cert_pem)
            .map_err(|e| HostError::PairingFailed(format!("unparseable client cert: {}", e)))?;
        let client_pubkey = client_cert
            .public_key()
            .map_err(|e| HostError::PairingFailed(format!("client cert has no key: {}", e)))?;

        if !crypto::verify(client_secret, signature, &client_pubkey) {
            warn!("Pairing {}: client secret signature invalid", client_ip);
            return Err(HostError::PairingFailed(
                "client secret signature invalid".into(),
            ));
        }

        let server_challenge = state
            .server_challenge
            .ok_or_else(|| HostError::PairingFailed("missing server challenge".into()))?;
        let client_hash = state
            .client_hash
            .ok_or_else(|| HostError::PairingFailed("missing client hash".into()))?;
        let client_sig = crypto::cert_signature_bytes(&client_cert)?;

        // SHA256(server_challenge || client_cert_signature || client_secret)
        let mut hashed = server_challenge;
        hashed.extend_from_slice(&client_sig);
        hashed.extend_from_slice(client_secret);
        let expected = crypto::sha256(&hashed);

        if expected.as_slice() != client_hash.as_slice() {
            warn!("Pairing {}: hash mismatch (wrong PIN?)", client_ip);
            return Err(HostError::PairingFailed("pairing hash mismatch".into()));
        }

        let client_id = uuid::Uuid::new_v4().to_string();
        let client = PairedClient {
            client_id: client_id.clone(),
            client_cert: state.client_cert_pem,
            app_state_folder: app_state_root
                .join(&client_id)
                .to_string_lossy()
                .into_owned(),
            run_uid: 1000,
            run_gid: 1000,
        };
        store.pair(client.clone()).await.map_err(HostError::from)?;

        self.broadcaster
            .broadcast(AdminEvent::ClientPaired { client_id });
        info!("Pairing {}: completed", client_ip);
        Ok(client)
    }

    /// Fulfill the PIN promise of a pending handshake. Used by the admin
    /// API; true when the secret matched a waiting exchange.
    pub fn fulfill_pin(&self, pair_secret: &str, pin: String) -> bool {
        let pending = self
            .pending_pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match pending.get(pair_secret) {
            Some(signal) => signal.fulfill(pin),
            None => false,
        }
    }

    /// Handshakes currently waiting for their PIN.
    pub fn pending_requests(&self) -> Vec<PendingPairRequest> {
        let pending = self
            .pending_pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        pending
            .values()
            .map(|signal| PendingPairRequest {
                pair_secret: signal.pair_secret.clone(),
                client_ip: signal.client_ip.to_string(),
            })
            .collect()
    }

    /// Drop in-flight exchanges older than the TTL.
    fn purge_expired(&self) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let ttl = self.ttl;
        in_flight.retain(|ip, state| {
            let keep = state.created.elapsed() < ttl;
            if !keep {
                debug!("Evicting expired pairing state for {}", ip);
            }
            keep
        });
    }

    #[cfg(test)]
    fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
