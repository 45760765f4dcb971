//! Thin wrappers over OpenSSL for the GameStream pairing handshake.
//!
//! Everything the handshake needs lives here: CSPRNG bytes, SHA-256,
//! AES-128-ECB with optional padding, RSA-SHA256 signatures, and X.509
//! generation/verification. Certificate identity is always established by
//! X.509 verification, never by comparing PEM strings.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};
use openssl::symm::{Cipher, Crypter, Mode};
use openssl::x509::{X509Builder, X509NameBuilder, X509};

pub const AES_BLOCK_SIZE: usize = 16;
const RSA_KEY_BITS: u32 = 2048;
const CERT_VALIDITY_DAYS: u32 = 365 * 20;

/// `length` random bytes from a cryptographically secure generator.
pub fn random_bytes(length: usize) -> Vec<u8> {
    let mut buf = vec![0u8; length];
    // rand_bytes only fails when the RNG is not seeded, which cannot
    // happen on the platforms this host runs on
    openssl::rand::rand_bytes(&mut buf).unwrap_or_else(|e| {
        panic!("CSPRNG failure: {}", e);
    });
    buf
}

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    openssl::sha::sha256(data)
}

fn aes_ecb(mode: Mode, key: &[u8], data: &[u8], padding: bool) -> Result<Vec<u8>, ErrorStack> {
    let cipher = Cipher::aes_128_ecb();
    let mut crypter = Crypter::new(cipher, mode, key, None)?;
    crypter.pad(padding);

    let mut out = vec![0u8; data.len() + cipher.block_size()];
    let mut written = crypter.update(data, &mut out)?;
    written += crypter.finalize(&mut out[written..])?;
    out.truncate(written);
    Ok(out)
}

/// Encrypt `data` with AES-128-ECB. The handshake works on block-aligned
/// payloads, so padding stays off unless asked for.
pub fn aes_encrypt_ecb(key: &[u8], data: &[u8], padding: bool) -> Result<Vec<u8>, ErrorStack> {
    aes_ecb(Mode::Encrypt, key, data, padding)
}

/// Decrypt `data` with AES-128-ECB.
pub fn aes_decrypt_ecb(key: &[u8], data: &[u8], padding: bool) -> Result<Vec<u8>, ErrorStack> {
    aes_ecb(Mode::Decrypt, key, data, padding)
}

/// RSA-SHA256 (PKCS#1 v1.5) signature of `data`.
pub fn sign(data: &[u8], key: &PKey<Private>) -> Result<Vec<u8>, ErrorStack> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    signer.update(data)?;
    signer.sign_to_vec()
}

/// Verify an RSA-SHA256 signature against a public key.
pub fn verify(data: &[u8], signature: &[u8], key: &PKey<Public>) -> bool {
    let Ok(mut verifier) = Verifier::new(MessageDigest::sha256(), key) else {
        return false;
    };
    if verifier.update(data).is_err() {
        return false;
    }
    verifier.verify(signature).unwrap_or(false)
}

/// Generate a 2048-bit RSA key.
pub fn generate_key() -> Result<PKey<Private>, ErrorStack> {
    let rsa = Rsa::generate(RSA_KEY_BITS)?;
    PKey::from_rsa(rsa)
}

/// Generate a self-signed X.509 certificate for the host.
pub fn generate_x509(key: &PKey<Private>, common_name: &str) -> Result<X509, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(159, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(serial.to_asn1_integer()?.as_ref())?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(Asn1Time::days_from_now(CERT_VALIDITY_DAYS)?.as_ref())?;
    builder.set_pubkey(key)?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Parse a PEM certificate.
pub fn cert_from_pem(pem: &str) -> Result<X509, ErrorStack> {
    X509::from_pem(pem.as_bytes())
}

/// Serialize a certificate to PEM.
pub fn cert_to_pem(cert: &X509) -> Result<String, ErrorStack> {
    let pem = cert.to_pem()?;
    Ok(String::from_utf8_lossy(&pem).into_owned())
}

/// Parse a PEM private key.
pub fn pkey_from_pem(pem: &str) -> Result<PKey<Private>, ErrorStack> {
    PKey::private_key_from_pem(pem.as_bytes())
}

/// Serialize a private key to PEM (PKCS#8).
pub fn pkey_to_pem(key: &PKey<Private>) -> Result<String, ErrorStack> {
    let pem = key.private_key_to_pem_pkcs8()?;
    Ok(String::from_utf8_lossy(&pem).into_owned())
}

/// Verify `presented` against the public key of `trusted`.
///
/// Returns `None` when verification succeeds, otherwise a description of
/// why it failed. This is the only notion of certificate equality the host
/// uses for paired-client identity.
pub fn verification_error(trusted: &X509, presented: &X509) -> Option<String> {
    let public_key = match trusted.public_key() {
        Ok(k) => k,
        Err(e) => return Some(format!("trusted certificate has no usable key: {}", e)),
    };
    match presented.verify(&public_key) {
        Ok(true) => None,
        Ok(false) => Some("signature does not verify against trusted certificate".to_string()),
        Err(e) => Some(format!("verification error: {}", e)),
    }
}

/// Raw signature bytes of a certificate, as used in the pairing hashes.
///
/// rust-openssl does not expose `X509_get0_signature`, so the DER form is
/// re-parsed to pull the signature BIT STRING out.
pub fn cert_signature_bytes(cert: &X509) -> Result<Vec<u8>, crate::error::HostError> {
    let der = cert.to_der()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(&der).map_err(|e| {
        crate::error::HostError::PairingFailed(format!("unparseable certificate: {}", e))
    })?;
    Ok(parsed.signature_value.data.to_vec())
}

/// Hex SHA-256 fingerprint of a certificate's DER form.
pub fn cert_fingerprint(cert: &X509) -> Result<String, ErrorStack> {
    let der = cert.to_der()?;
    Ok(hex::encode(sha256(&der)))
}
