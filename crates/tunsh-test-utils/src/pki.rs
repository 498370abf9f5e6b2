//! Throwaway PKI for tests.
//!
//! Every call to [`TestPki::generate`] mints a fresh CA plus a server
//! certificate (valid for `localhost` and 127.0.0.1) and a client
//! certificate, so tests never share key material.

use std::net::{IpAddr, Ipv4Addr};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};

use tunsh_core::tls::{self, ServerTrust};
use tunsh_core::{Error, Result};

/// Name the server certificate is issued for.
pub const SERVER_NAME: &str = "localhost";

fn pki_error(err: rcgen::Error) -> Error {
    Error::Tls {
        message: format!("test certificate generation failed: {err}"),
    }
}

fn private_key(key: &KeyPair) -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()))
}

/// A CA with one server and one client certificate.
pub struct TestPki {
    ca_cert: CertificateDer<'static>,
    server_cert: CertificateDer<'static>,
    server_key: PrivateKeyDer<'static>,
    client_cert: CertificateDer<'static>,
    client_key: PrivateKeyDer<'static>,
}

impl TestPki {
    /// Mint a fresh CA and leaf certificates.
    pub fn generate() -> Result<Self> {
        let ca_key = KeyPair::generate().map_err(pki_error)?;
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).map_err(pki_error)?;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "tunsh test CA");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = ca_params.self_signed(&ca_key).map_err(pki_error)?;

        let server_key = KeyPair::generate().map_err(pki_error)?;
        let mut server_params =
            CertificateParams::new(vec![SERVER_NAME.to_string()]).map_err(pki_error)?;
        server_params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server = server_params
            .signed_by(&server_key, &ca, &ca_key)
            .map_err(pki_error)?;

        let client_key = KeyPair::generate().map_err(pki_error)?;
        let mut client_params =
            CertificateParams::new(vec!["tunsh-client".to_string()]).map_err(pki_error)?;
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client = client_params
            .signed_by(&client_key, &ca, &ca_key)
            .map_err(pki_error)?;

        Ok(Self {
            ca_cert: ca.der().clone(),
            server_cert: server.der().clone(),
            server_key: private_key(&server_key),
            client_cert: client.der().clone(),
            client_key: private_key(&client_key),
        })
    }

    /// Root store trusting only this CA.
    pub fn roots(&self) -> Result<RootCertStore> {
        tls::root_store([self.ca_cert.clone()])
    }

    /// Name clients should verify the server certificate against.
    pub fn server_name(&self) -> Result<ServerName<'static>> {
        ServerName::try_from(SERVER_NAME.to_string()).map_err(|e| Error::Tls {
            message: format!("invalid server name: {e}"),
        })
    }

    /// Server config that requires a client certificate from this CA.
    pub fn server_config(&self) -> Result<rustls::ServerConfig> {
        tls::server_config(
            vec![self.server_cert.clone()],
            self.server_key.clone_key(),
            Some(self.roots()?),
        )
    }

    /// Client config trusting this CA and presenting the client certificate.
    pub fn client_config(&self) -> Result<rustls::ClientConfig> {
        tls::client_config(
            ServerTrust::Roots(self.roots()?),
            Some((vec![self.client_cert.clone()], self.client_key.clone_key())),
        )
    }

    /// Client config without a client certificate.
    pub fn anonymous_client_config(&self) -> Result<rustls::ClientConfig> {
        tls::client_config(ServerTrust::Roots(self.roots()?), None)
    }
}
