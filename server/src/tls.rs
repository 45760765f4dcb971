//! Mutual-TLS serving for the authenticated Moonlight endpoint.
//!
//! The TLS layer requests a client certificate and accepts any that parses:
//! Moonlight clients present self-signed certificates, and their identity is
//! established at the application layer by X.509 verification against the
//! paired set, never by chain validation here. Each connection's peer
//! certificate and addresses are injected as a request extension.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DistinguishedName, ServerConfig, SignatureScheme};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crypto;

/// Per-connection facts handlers can extract.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub peer: SocketAddr,
    pub local_addr: SocketAddr,
    /// PEM of the certificate the client presented during the handshake
    pub client_cert_pem: Option<String>,
}

/// Accepts any parseable client certificate and leaves identity to the
/// application layer.
#[derive(Debug)]
struct AcceptAnyClientCert {
    supported: WebPkiSupportedAlgorithms,
}

impl AcceptAnyClientCert {
    fn new() -> Self {
        Self {
            supported: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        // pairing-capable clients send one; anything else fails later at
        // the application's Unauthorized check
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// Build the rustls config from the host's PEM cert and key.
pub fn build_server_config(cert_pem: &str, key_pem: &str) -> anyhow::Result<Arc<ServerConfig>> {
    // multiple providers may be linked in; first install wins
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_bytes()).collect::<Result<_, _>>()?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())?
        .ok_or_else(|| anyhow::anyhow!("no private key in PEM"))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert::new()))
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Serve `router` over mutual TLS until cancelled.
pub async fn serve(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    router: Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let acceptor = TlsAcceptor::from(config);
    let local_addr = listener.local_addr()?;
    info!("TLS endpoint listening on {}", local_addr);

    loop {
        let (tcp, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("TLS endpoint shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            };

            let client_cert_pem = {
                let (_, connection) = stream.get_ref();
                connection
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .and_then(|der| match openssl::x509::X509::from_der(der.as_ref()) {
                        Ok(cert) => crypto::cert_to_pem(&cert).ok(),
                        Err(e) => {
                            debug!("Unparseable client certificate from {}: {}", peer, e);
                            None
                        }
                    })
            };

            let service = router.layer(Extension(ClientConnection {
                peer,
                local_addr,
                client_cert_pem,
            }));

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(
                    TokioIo::new(stream),
                    TowerToHyperService::new(service),
                )
                .await
            {
                warn!("TLS connection from {} ended with error: {}", peer, e);
            }
        });
    }
}
