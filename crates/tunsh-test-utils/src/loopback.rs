//! Loopback sessions on 127.0.0.1 for end-to-end tests.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::Endpoint;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};

use tunsh_core::tls::{quic_client_config, quic_server_config};
use tunsh_core::{Error, Result};

use crate::pki::{SERVER_NAME, TestPki};

fn transport_error(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Transport {
        message: format!("{context}: {err}"),
    }
}

/// Both ends of one mutually authenticated QUIC connection.
///
/// The endpoints are kept so their local addresses stay available.
pub struct QuicPair {
    pub server: quinn::Connection,
    pub client: quinn::Connection,
    pub server_endpoint: Endpoint,
    pub client_endpoint: Endpoint,
}

impl QuicPair {
    pub fn server_addr(&self) -> Result<SocketAddr> {
        Ok(self.server_endpoint.local_addr()?)
    }

    pub fn client_addr(&self) -> Result<SocketAddr> {
        Ok(self.client_endpoint.local_addr()?)
    }
}

/// Connect a QUIC client to a fresh server endpoint on a random port.
pub async fn quic_pair(pki: &TestPki) -> Result<QuicPair> {
    quic_pair_with(pki, quic_server_config(pki.server_config()?)?).await
}

/// Like [`quic_pair`], with the server endpoint built from `server_config`.
pub async fn quic_pair_with(pki: &TestPki, server_config: quinn::ServerConfig) -> Result<QuicPair> {
    let localhost: SocketAddr = ([127, 0, 0, 1], 0).into();

    let server_endpoint = Endpoint::server(server_config, localhost)?;
    let server_addr = server_endpoint.local_addr()?;
    let client_endpoint = Endpoint::client(localhost)?;

    let connecting = client_endpoint
        .connect_with(
            quic_client_config(pki.client_config()?)?,
            server_addr,
            SERVER_NAME,
        )
        .map_err(|e| transport_error("failed to start QUIC connect", e))?;

    let accepting = async {
        let incoming = server_endpoint
            .accept()
            .await
            .ok_or_else(|| transport_error("QUIC accept", "endpoint closed"))?;
        incoming
            .await
            .map_err(|e| transport_error("QUIC server handshake", e))
    };
    let (client, server) = tokio::join!(connecting, accepting);

    Ok(QuicPair {
        server: server?,
        client: client.map_err(|e| transport_error("QUIC client handshake", e))?,
        server_endpoint,
        client_endpoint,
    })
}

/// Server and client ends of one mutually authenticated TLS-over-TCP stream.
pub async fn tls_pair(
    pki: &TestPki,
) -> Result<(server::TlsStream<TcpStream>, client::TlsStream<TcpStream>)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
    let (server_tcp, _) = accepted?;
    let client_tcp = connected?;

    let acceptor = TlsAcceptor::from(Arc::new(pki.server_config()?));
    let connector = TlsConnector::from(Arc::new(pki.client_config()?));
    let (server, client) = tokio::join!(
        acceptor.accept(server_tcp),
        connector.connect(pki.server_name()?, client_tcp)
    );

    Ok((
        server.map_err(|e| transport_error("TLS server handshake", e))?,
        client.map_err(|e| transport_error("TLS client handshake", e))?,
    ))
}
