//! TLS channel setup: server side from the node's own identity, client side
//! trusting whatever certificate the peer presents.
//!
//! Every node's certificate is self-signed and no node validates chains or
//! hostnames: trust on first use, with no revocation or pinning. TLS here
//! provides channel encryption only, not peer authentication. Anyone who can
//! reach a node can present any certificate and be accepted.

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::{client, TlsAcceptor, TlsConnector};

use grove_core::Identity;

/// Lazily-initialized crypto provider for rustls, backed by ring.
static CRYPTO_PROVIDER: LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Build the server-side acceptor from the node's certificate and key.
/// Fails if the key does not match the certificate; a node never listens
/// without both.
pub fn acceptor(identity: &Identity) -> Result<TlsAcceptor, rustls::Error> {
    let config = ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![identity.certificate()], identity.private_key())?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the client-side connector. Certificate chain and hostname checks
/// are disabled (see module docs).
pub fn connector() -> Result<TlsConnector, rustls::Error> {
    let config = ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustOnFirstUse))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Dial `addr` and run the TLS handshake. The server name is the peer's IP;
/// it is never verified against the certificate.
pub async fn connect(
    connector: &TlsConnector,
    addr: SocketAddr,
) -> std::io::Result<client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::IpAddress(addr.ip().into());
    connector.connect(name, tcp).await
}

/// Accepts any server certificate. Handshake signatures are still verified
/// against the presented certificate, so the channel is encrypted to whoever
/// holds the matching private key; identity is simply not checked.
#[derive(Debug)]
struct TrustOnFirstUse;

impl ServerCertVerifier for TrustOnFirstUse {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}
