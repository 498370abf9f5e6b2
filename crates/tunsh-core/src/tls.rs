//! TLS configuration for both transports.
//!
//! Every config is built on the ring crypto provider and restricted to
//! TLS 1.3 so the same rustls configs serve QUIC and TLS-over-TCP. The ALPN
//! identifier is set on both sides.

use std::sync::Arc;

use rustls::DigitallySignedStruct;
use rustls::RootCertStore;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;

use crate::constants::{ALPN, IDLE_TIMEOUT, KEEP_ALIVE_INTERVAL};
use crate::error::{Error, Result};

fn tls_error(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Tls {
        message: format!("{context}: {err}"),
    }
}

/// The crypto provider all tunsh TLS configs are built on.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// =============================================================================
// PEM and Certificates
// =============================================================================

/// Read a PEM file, naming the path on failure.
pub fn read_pem_file(path: &std::path::Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| tls_error(&format!("failed to read {}", path.display()), e))
}

/// Load a certificate chain from PEM data.
pub fn load_certs_from_pem(pem_data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem_data);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error("failed to parse certificate", e))?;

    if certs.is_empty() {
        return Err(Error::Tls {
            message: "no certificates found in PEM data".to_string(),
        });
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from PEM data.
pub fn load_key_from_pem(pem_data: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem_data);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error("failed to parse private key", e))?
        .ok_or_else(|| Error::Tls {
            message: "no private key found in PEM data".to_string(),
        })
}

/// Build a root store from trusted CA certificates.
pub fn root_store(certs: impl IntoIterator<Item = CertificateDer<'static>>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| tls_error("invalid CA certificate", e))?;
    }
    Ok(roots)
}

/// Compute the SHA-256 hash of certificate DER bytes.
pub fn cert_hash(cert_der: &[u8]) -> Vec<u8> {
    use sha2::{Digest, Sha256};
    Sha256::digest(cert_der).to_vec()
}

/// Colon-separated uppercase hex, the form `parse_cert_hash` accepts.
pub fn format_cert_hash(hash: &[u8]) -> String {
    hash.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse a hex SHA-256 fingerprint; `:` separators are accepted.
pub fn parse_cert_hash(hex: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = hex.bytes().filter(|b| *b != b':').collect();
    if digits.len() != 64 {
        return Err(Error::Tls {
            message: format!("certificate hash must be 32 hex bytes, got {hex:?}"),
        });
    }
    digits
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| Error::Tls {
                    message: format!("invalid hex in certificate hash {hex:?}"),
                })
        })
        .collect()
}

/// Generate a self-signed certificate for `names`.
pub fn generate_self_signed_cert(
    names: &[&str],
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let certified = rcgen::generate_simple_self_signed(names)
        .map_err(|e| tls_error("failed to generate certificate", e))?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    Ok((certified.cert.der().clone(), key))
}

// =============================================================================
// Server Config
// =============================================================================

/// Server TLS config presenting `certs`, optionally requiring client
/// certificates signed by `client_roots`.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_roots: Option<RootCertStore>,
) -> Result<rustls::ServerConfig> {
    let provider = crypto_provider();
    let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("unsupported protocol versions", e))?;

    let builder = match client_roots {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| tls_error("invalid client CA", e))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| tls_error("failed to create server config", e))?;
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

// =============================================================================
// Client Config
// =============================================================================

/// How a client decides to trust the server certificate.
#[derive(Debug, Clone)]
pub enum ServerTrust {
    /// Verify the chain against these roots and check the server name.
    Roots(RootCertStore),
    /// Accept any certificate whose SHA-256 matches, or any certificate at
    /// all when no hash is given.
    Pinned(Option<Vec<u8>>),
}

/// Client identity presented when the server requires client certificates.
pub type ClientIdentity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Client TLS config.
pub fn client_config(
    trust: ServerTrust,
    identity: Option<ClientIdentity>,
) -> Result<rustls::ClientConfig> {
    let provider = crypto_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("unsupported protocol versions", e))?;

    let builder = match trust {
        ServerTrust::Roots(roots) => builder.with_root_certificates(roots),
        ServerTrust::Pinned(expected_hash) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(CertHashVerifier {
                expected_hash,
                provider,
            })),
    };

    let mut config = match identity {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| tls_error("invalid client certificate", e))?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// Verifier that skips chain validation but still checks handshake
/// signatures, and optionally pins the end-entity certificate hash.
#[derive(Debug)]
struct CertHashVerifier {
    expected_hash: Option<Vec<u8>>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for CertHashVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if let Some(expected) = &self.expected_hash
            && cert_hash(end_entity.as_ref()) != *expected
        {
            return Err(rustls::Error::General(
                "certificate hash mismatch".to_string(),
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// =============================================================================
// QUIC Configs
// =============================================================================

fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_idle_timeout(quinn::IdleTimeout::try_from(IDLE_TIMEOUT).ok());
    Arc::new(transport)
}

/// Wrap a rustls server config for a QUIC endpoint.
pub fn quic_server_config(tls: rustls::ServerConfig) -> Result<quinn::ServerConfig> {
    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(Arc::new(tls))
        .map_err(|e| tls_error("failed to create QUIC server config", e))?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(transport_config());
    Ok(config)
}

/// Wrap a rustls client config for a QUIC endpoint.
pub fn quic_client_config(tls: rustls::ClientConfig) -> Result<quinn::ClientConfig> {
    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(Arc::new(tls))
        .map_err(|e| tls_error("failed to create QUIC client config", e))?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(transport_config());
    Ok(config)
}
