//! Node identity: key pair, PEM public-key handle, derived listen port,
//! self-signed certificate.

use rcgen::{CertificateParams, DnType, DnValue, KeyPair, PKCS_ED25519};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};

/// First port of the dynamic/private range used for leaf listeners.
pub const P2P_PORT_RANGE_START: u16 = 49152;
/// Last port of the dynamic/private range (inclusive).
pub const P2P_PORT_RANGE_END: u16 = 65535;

/// Derive a listening port from the PEM-encoded public key bytes.
///
/// SHA-256 of the bytes, first two digest bytes as a big-endian integer,
/// mapped into the dynamic port range. Pure and deterministic: every node
/// computes the same port for the same key, so a leaf can pick its own
/// listener port without coordination.
pub fn derive_port(public_key_pem: &[u8]) -> u16 {
    let digest = Sha256::digest(public_key_pem);
    let prefix = u16::from_be_bytes([digest[0], digest[1]]) as u32;
    let range = (P2P_PORT_RANGE_END - P2P_PORT_RANGE_START) as u32 + 1;
    P2P_PORT_RANGE_START + (prefix % range) as u16
}

/// Per-process node identity. Generated once at startup, immutable after.
///
/// The PEM public key is the node's global handle; the certificate is
/// self-signed and bound to the same key pair. Peers never validate the
/// certificate chain, so the certificate provides channel encryption only.
pub struct Identity {
    public_key_pem: String,
    p2p_port: u16,
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl Identity {
    /// Generate a fresh Ed25519 key pair and a self-signed certificate for
    /// `host` (DNS name or IP literal).
    pub fn generate(host: &str) -> Result<Self, IdentityError> {
        let key_pair = KeyPair::generate_for(&PKCS_ED25519)?;
        let public_key_pem = key_pair.public_key_pem();
        let p2p_port = derive_port(public_key_pem.as_bytes());

        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name.push(
            DnType::CommonName,
            DnValue::Utf8String(host.to_string()),
        );
        let cert = params.self_signed(&key_pair)?;

        Ok(Self {
            public_key_pem,
            p2p_port,
            cert: cert.der().clone(),
            key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        })
    }

    /// PEM-encoded public key. The node's unique handle on the network.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Listening port derived from the public key.
    pub fn p2p_port(&self) -> u16 {
        self.p2p_port
    }

    /// DER certificate for the TLS server side.
    pub fn certificate(&self) -> CertificateDer<'static> {
        self.cert.clone()
    }

    /// Private key matching the certificate.
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key.clone_key())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
}
