//! Client connection management.
//!
//! Establishes the session over the chosen transport and binds a tonic
//! channel whose connections are streams on that session.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use quinn::{Endpoint, VarInt};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::transport::Channel;
use tracing::{debug, info};

use tunsh_core::constants::CONNECT_TIMEOUT;
use tunsh_core::error::{Error, Result};
use tunsh_core::rpc;
use tunsh_core::tls::quic_client_config;
use tunsh_core::transport::{MuxConfig, MuxDialer};

/// Session transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// QUIC; each RPC connection is one bidirectional stream.
    #[default]
    Quic,
    /// TLS over TCP with yamux streams inside.
    Tls,
}

/// Client connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub server_addr: SocketAddr,
    pub server_name: ServerName<'static>,
    pub transport: Transport,
    pub tls: rustls::ClientConfig,
    pub mux: MuxConfig,
}

/// An established session. The channel stays usable while this is alive.
pub enum ClientSession {
    Quic(Endpoint),
    Mux(MuxDialer),
}

impl ClientSession {
    /// Tear down the session and every stream on it.
    pub async fn close(self) {
        match self {
            ClientSession::Quic(endpoint) => {
                endpoint.close(VarInt::from_u32(0), b"client close");
                endpoint.wait_idle().await;
            }
            ClientSession::Mux(dialer) => dialer.close(),
        }
        debug!("session closed");
    }
}

fn timed_out() -> Error {
    Error::Transport {
        message: format!("connection timed out after {}s", CONNECT_TIMEOUT.as_secs()),
    }
}

/// Connect to the server and bind an RPC channel to the session.
pub async fn connect(config: ConnectionConfig) -> Result<(Channel, ClientSession)> {
    info!(addr = %config.server_addr, transport = ?config.transport, "Connecting to server");
    let established = async {
        match config.transport {
            Transport::Quic => connect_quic(&config).await,
            Transport::Tls => connect_tls(&config).await,
        }
    };
    tokio::time::timeout(CONNECT_TIMEOUT, established)
        .await
        .map_err(|_| timed_out())?
}

async fn connect_quic(config: &ConnectionConfig) -> Result<(Channel, ClientSession)> {
    let bind: SocketAddr = match config.server_addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let endpoint = Endpoint::client(bind)?;

    let conn = endpoint
        .connect_with(
            quic_client_config(config.tls.clone())?,
            config.server_addr,
            &config.server_name.to_str(),
        )
        .map_err(|e| Error::Transport {
            message: format!("failed to initiate connection: {e}"),
        })?
        .await
        .map_err(|e| Error::Transport {
            message: format!("connection failed: {e}"),
        })?;
    info!("QUIC connection established");

    let channel = rpc::quic_channel(conn, &endpoint).await?;
    Ok((channel, ClientSession::Quic(endpoint)))
}

async fn connect_tls(config: &ConnectionConfig) -> Result<(Channel, ClientSession)> {
    let tcp = TcpStream::connect(config.server_addr).await?;
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }

    let connector = TlsConnector::from(Arc::new(config.tls.clone()));
    let tls = connector
        .connect(config.server_name.clone(), tcp)
        .await
        .map_err(|e| Error::Tls {
            message: format!("TLS handshake failed: {e}"),
        })?;
    info!("TLS connection established");

    let (channel, dialer) = rpc::mux_channel(tls, &config.mux).await?;
    Ok((channel, ClientSession::Mux(dialer)))
}
