//! Binding the transport adapters to tonic.
//!
//! The server side turns a [`Listener`] into tonic's incoming-connection
//! stream; the client side turns a [`Dialer`] into a channel connector.
//! Optionally each logical stream carries its own TLS session on top of
//! the transport security.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::either::Either;
use tonic::transport::server::{Connected, Router};
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::{debug, warn};

use crate::constants::{CONNECT_TIMEOUT, RPC_PLACEHOLDER_URI};
use crate::error::{Error, Result};
use crate::transport::{ConnInfo, Dialer, Listener, MuxConfig, MuxDialer, QuicDialer, SessionAddrs};

// =============================================================================
// Security
// =============================================================================

/// Per-stream security for RPC clients.
#[derive(Debug, Clone)]
pub enum ClientSecurity {
    /// Rely on the transport's own encryption.
    Insecure,
    /// Run a TLS handshake on every logical stream.
    Tls {
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    },
}

impl ClientSecurity {
    /// No per-stream security.
    pub fn insecure() -> Self {
        ClientSecurity::Insecure
    }
}

/// Per-stream security for RPC servers.
#[derive(Debug, Clone)]
pub enum ServerSecurity {
    Insecure,
    Tls(Arc<rustls::ServerConfig>),
}

// =============================================================================
// Client
// =============================================================================

type ClientIo<C> = Either<C, tokio_rustls::client::TlsStream<C>>;

fn endpoint() -> Endpoint {
    Endpoint::from_static(RPC_PLACEHOLDER_URI).connect_timeout(CONNECT_TIMEOUT)
}

fn connector<D: Dialer>(
    dialer: D,
    security: ClientSecurity,
) -> impl tower::Service<
    Uri,
    Response = TokioIo<ClientIo<D::Conn>>,
    Error = Error,
    Future = impl Future<Output = Result<TokioIo<ClientIo<D::Conn>>>> + Send,
> + Clone
+ Send
+ 'static {
    tower::service_fn(move |uri: Uri| {
        let dialer = dialer.clone();
        let security = security.clone();
        async move {
            debug!(%uri, "dialing RPC stream");
            let conn = dialer.dial().await?;
            let io = match security {
                ClientSecurity::Insecure => Either::Left(conn),
                ClientSecurity::Tls {
                    config,
                    server_name,
                } => {
                    let tls = TlsConnector::from(config)
                        .connect(server_name, conn)
                        .await
                        .map_err(|e| Error::Tls {
                            message: format!("stream handshake failed: {e}"),
                        })?;
                    Either::Right(tls)
                }
            };
            Ok(TokioIo::new(io))
        }
    })
}

/// Build an RPC channel whose connections are logical streams opened by
/// `dialer`. The channel target is a placeholder; it is never resolved.
///
/// The first stream is opened before this returns.
pub async fn connect<D: Dialer>(dialer: D, security: ClientSecurity) -> Result<Channel> {
    Ok(endpoint()
        .connect_with_connector(connector(dialer, security))
        .await?)
}

/// Like [`connect`], but no stream is opened until the first call.
pub fn connect_lazy<D: Dialer>(dialer: D, security: ClientSecurity) -> Channel {
    endpoint().connect_with_connector_lazy(connector(dialer, security))
}

/// Channel over an established QUIC connection.
pub async fn quic_channel(conn: quinn::Connection, endpoint: &quinn::Endpoint) -> Result<Channel> {
    let dialer = QuicDialer::new(conn, endpoint.local_addr()?);
    connect(dialer, ClientSecurity::insecure()).await
}

/// Channel over a fresh yamux session on `io`.
pub async fn mux_channel<T>(io: T, config: &MuxConfig) -> Result<(Channel, MuxDialer)>
where
    T: AsyncRead + AsyncWrite + SessionAddrs + Unpin + Send + 'static,
{
    let dialer = MuxDialer::new(io, config)?;
    let channel = connect(dialer.clone(), ClientSecurity::insecure()).await?;
    Ok((channel, dialer))
}

// =============================================================================
// Server
// =============================================================================

/// Server-side connection: the adapted stream, optionally wrapped in TLS.
pub enum ServerConn<C> {
    Plain(C),
    Tls(Box<tokio_rustls::server::TlsStream<C>>),
}

impl<C: Connected<ConnectInfo = ConnInfo>> Connected for ServerConn<C> {
    type ConnectInfo = ConnInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        match self {
            ServerConn::Plain(conn) => conn.connect_info(),
            ServerConn::Tls(tls) => tls.get_ref().0.connect_info(),
        }
    }
}

impl<C: AsyncRead + AsyncWrite + Unpin> AsyncRead for ServerConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerConn::Plain(conn) => Pin::new(conn).poll_read(cx, buf),
            ServerConn::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<C: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ServerConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ServerConn::Plain(conn) => Pin::new(conn).poll_write(cx, buf),
            ServerConn::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerConn::Plain(conn) => Pin::new(conn).poll_flush(cx),
            ServerConn::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerConn::Plain(conn) => Pin::new(conn).poll_shutdown(cx),
            ServerConn::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Accepted connections as a stream for tonic.
///
/// The stream ends at the first accept failure: the session is gone and
/// will never produce another connection. Failed TLS handshakes are
/// yielded as errors and skipped by the server.
pub fn incoming<L: Listener>(
    listener: L,
    security: ServerSecurity,
) -> impl Stream<Item = Result<ServerConn<L::Conn>>> + Send + 'static {
    let acceptor = match security {
        ServerSecurity::Insecure => None,
        ServerSecurity::Tls(config) => Some(TlsAcceptor::from(config)),
    };

    futures::stream::unfold(
        Some((listener, acceptor)),
        |state| async move {
            let (listener, acceptor) = state?;
            let conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(error = %e, "listener closed, no more RPC connections");
                    return None;
                }
            };

            let item = match &acceptor {
                None => Ok(ServerConn::Plain(conn)),
                Some(acceptor) => match acceptor.accept(conn).await {
                    Ok(tls) => Ok(ServerConn::Tls(Box::new(tls))),
                    Err(e) => {
                        warn!(error = %e, "stream TLS handshake failed");
                        Err(Error::Tls {
                            message: format!("stream handshake failed: {e}"),
                        })
                    }
                },
            };
            Some((item, Some((listener, acceptor))))
        },
    )
}

/// Serve `router` on every stream the peer opens until the session ends.
///
/// Returns `Ok` when the listener stops accepting.
pub async fn serve<L: Listener>(listener: L, router: Router, security: ServerSecurity) -> Result<()> {
    router.serve_with_incoming(incoming(listener, security)).await?;
    Ok(())
}

/// Like [`serve`], stopping when `signal` resolves.
pub async fn serve_with_shutdown<L, F>(
    listener: L,
    router: Router,
    security: ServerSecurity,
    signal: F,
) -> Result<()>
where
    L: Listener,
    F: Future<Output = ()> + Send,
{
    router
        .serve_with_incoming_shutdown(incoming(listener, security), signal)
        .await?;
    Ok(())
}
