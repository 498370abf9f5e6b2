//! Accept loops for both transports.
//!
//! Every accepted connection is one session. Each session gets its own
//! tonic server whose connections are the logical streams the client opens.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use quinn::{Endpoint, Incoming, VarInt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tonic::transport::Server;
use tracing::{debug, info, warn};

use tunsh_core::constants::{SERVER_CLOSE_CODE, SERVER_CLOSE_REASON};
use tunsh_core::error::Result;
use tunsh_core::rpc::{self, ServerSecurity};
use tunsh_core::tls::quic_server_config;
use tunsh_core::transport::{MuxConfig, MuxListener, QuicListener};

use crate::service::ShellService;

/// Session transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// QUIC; each RPC connection is one bidirectional stream.
    #[default]
    Quic,
    /// TLS over TCP with yamux streams inside.
    Tls,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub transport: Transport,
    pub tls: rustls::ServerConfig,
    /// Command run when a client names none.
    pub default_command: String,
    pub mux: MuxConfig,
}

enum Acceptor {
    Quic(Endpoint),
    Tls {
        listener: TcpListener,
        acceptor: TlsAcceptor,
    },
}

/// A bound server, ready to accept sessions.
pub struct ShellListener {
    acceptor: Acceptor,
    local_addr: SocketAddr,
    service: ShellService,
    mux: MuxConfig,
}

impl ShellListener {
    /// Bind the configured transport.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let acceptor = match config.transport {
            Transport::Quic => {
                let server_config = quic_server_config(config.tls)?;
                Acceptor::Quic(Endpoint::server(server_config, config.bind_addr)?)
            }
            Transport::Tls => Acceptor::Tls {
                listener: TcpListener::bind(config.bind_addr).await?,
                acceptor: TlsAcceptor::from(Arc::new(config.tls)),
            },
        };

        let local_addr = match &acceptor {
            Acceptor::Quic(endpoint) => endpoint.local_addr()?,
            Acceptor::Tls { listener, .. } => listener.local_addr()?,
        };

        Ok(Self {
            acceptor,
            local_addr,
            service: ShellService::new(config.default_command),
            mux: config.mux,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept sessions until `shutdown` resolves.
    ///
    /// Sessions still open at shutdown are closed.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let transport = match &self.acceptor {
            Acceptor::Quic(_) => "quic",
            Acceptor::Tls { .. } => "tls",
        };
        info!(addr = %self.local_addr, transport, "server listening");

        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "session task panicked");
                    }
                }
                accepted = self.accept() => match accepted {
                    Accepted::Quic(incoming) => {
                        sessions.spawn(serve_quic(incoming, self.local_addr, self.service.clone()));
                    }
                    Accepted::Tls(tcp, peer) => {
                        let Acceptor::Tls { acceptor, .. } = &self.acceptor else {
                            continue;
                        };
                        sessions.spawn(serve_tls(
                            tcp,
                            peer,
                            acceptor.clone(),
                            self.mux.clone(),
                            self.service.clone(),
                        ));
                    }
                    Accepted::Retry => {}
                    Accepted::Closed => break,
                },
            }
        }

        if let Acceptor::Quic(endpoint) = &self.acceptor {
            endpoint.close(VarInt::from_u32(SERVER_CLOSE_CODE), SERVER_CLOSE_REASON);
        }
        sessions.shutdown().await;
        Ok(())
    }

    async fn accept(&self) -> Accepted {
        match &self.acceptor {
            Acceptor::Quic(endpoint) => match endpoint.accept().await {
                Some(incoming) => Accepted::Quic(incoming),
                None => {
                    debug!("QUIC endpoint closed");
                    Accepted::Closed
                }
            },
            Acceptor::Tls { listener, .. } => match listener.accept().await {
                Ok((tcp, peer)) => Accepted::Tls(tcp, peer),
                Err(e) => {
                    // Per-connection failures such as EMFILE; keep listening.
                    warn!(error = %e, "TCP accept failed");
                    Accepted::Retry
                }
            },
        }
    }
}

enum Accepted {
    Quic(Incoming),
    Tls(TcpStream, SocketAddr),
    Retry,
    Closed,
}

fn router(service: ShellService) -> tonic::transport::server::Router {
    Server::builder().add_service(service.into_server())
}

async fn serve_quic(incoming: Incoming, local_addr: SocketAddr, service: ShellService) {
    let peer = incoming.remote_address();
    let conn = match incoming.await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(%peer, error = %e, "QUIC handshake failed");
            return;
        }
    };
    info!(%peer, "QUIC session established");

    let listener = QuicListener::new(conn, local_addr);
    match rpc::serve(listener, router(service), ServerSecurity::Insecure).await {
        Ok(()) => info!(%peer, "QUIC session ended"),
        Err(e) => warn!(%peer, error = %e, "QUIC session failed"),
    }
}

async fn serve_tls(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    mux: MuxConfig,
    service: ShellService,
) {
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
    }

    let tls = match acceptor.accept(tcp).await {
        Ok(tls) => tls,
        Err(e) => {
            warn!(%peer, error = %e, "TLS handshake failed");
            return;
        }
    };
    info!(%peer, "TLS session established");

    let result = async {
        let listener = MuxListener::new(tls, &mux)?;
        rpc::serve(listener, router(service), ServerSecurity::Insecure).await
    };
    match result.await {
        Ok(()) => info!(%peer, "TLS session ended"),
        Err(e) => warn!(%peer, error = %e, "TLS session failed"),
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, only Ctrl-C stops the server");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Ctrl-C handler failed");
            }
        }
        _ = terminate.recv() => {}
    }
}
