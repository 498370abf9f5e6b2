//! yamux adapter for reliable byte streams (normally TLS over TCP).
//!
//! A yamux `Connection` must be polled continuously to make progress, so
//! each session gets a driver task that owns it. The listener and dialer
//! talk to the driver over channels: opens are requests answered through a
//! oneshot, inbound streams arrive on an unbounded queue. When the driver
//! stops, the reason is recorded and every later accept or dial fails with
//! [`Error::SessionClosed`].

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::task::Poll;

use futures::future::poll_fn;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

use super::{Dialer, Listener, StreamConn};
use crate::constants::{MUX_MAX_STREAMS, MUX_SPLIT_SEND_SIZE};
use crate::error::{Error, Result};

/// A yamux stream usable with tokio I/O.
pub type MuxStream = Compat<yamux::Stream>;

type OpenReply = oneshot::Sender<std::result::Result<yamux::Stream, yamux::ConnectionError>>;

// =============================================================================
// Configuration
// =============================================================================

/// Session parameters. Both peers must use the same values; the defaults
/// are the tunsh wire profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Maximum concurrent logical streams.
    pub max_streams: usize,
    /// Largest data frame written per stream.
    pub split_send_size: usize,
    /// Allow reading buffered data after the session closed.
    pub read_after_close: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_streams: MUX_MAX_STREAMS,
            split_send_size: MUX_SPLIT_SEND_SIZE,
            read_after_close: true,
        }
    }
}

impl MuxConfig {
    fn to_yamux(&self) -> yamux::Config {
        let mut config = yamux::Config::default();
        config.set_max_num_streams(self.max_streams);
        config.set_split_send_size(self.split_send_size);
        config.set_read_after_close(self.read_after_close);
        config
    }
}

// =============================================================================
// Session Addresses
// =============================================================================

/// Byte streams that know the addresses of their two ends.
pub trait SessionAddrs {
    /// `(local, remote)` addresses.
    fn session_addrs(&self) -> io::Result<(SocketAddr, SocketAddr)>;
}

impl SessionAddrs for TcpStream {
    fn session_addrs(&self) -> io::Result<(SocketAddr, SocketAddr)> {
        Ok((self.local_addr()?, self.peer_addr()?))
    }
}

impl SessionAddrs for tokio_rustls::server::TlsStream<TcpStream> {
    fn session_addrs(&self) -> io::Result<(SocketAddr, SocketAddr)> {
        self.get_ref().0.session_addrs()
    }
}

impl SessionAddrs for tokio_rustls::client::TlsStream<TcpStream> {
    fn session_addrs(&self) -> io::Result<(SocketAddr, SocketAddr)> {
        self.get_ref().0.session_addrs()
    }
}

/// In-memory pipes report unspecified addresses.
impl SessionAddrs for tokio::io::DuplexStream {
    fn session_addrs(&self) -> io::Result<(SocketAddr, SocketAddr)> {
        let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
        Ok((unspecified, unspecified))
    }
}

// =============================================================================
// Session Driver
// =============================================================================

enum Command {
    Open(OpenReply),
    Close,
}

/// Why the session stopped, shared by every handle.
#[derive(Debug, Default)]
struct Termination {
    reason: Mutex<Option<String>>,
}

impl Termination {
    fn set(&self, reason: String) {
        let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        slot.get_or_insert(reason);
    }

    fn error(&self) -> Error {
        let slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        Error::SessionClosed {
            reason: slot.clone().unwrap_or_else(|| "session closed".to_string()),
        }
    }
}

struct Session {
    commands: mpsc::UnboundedSender<Command>,
    termination: Arc<Termination>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

fn start_session<T>(
    io: T,
    config: &MuxConfig,
    mode: yamux::Mode,
) -> Result<(Session, mpsc::UnboundedReceiver<yamux::Stream>)>
where
    T: AsyncRead + AsyncWrite + SessionAddrs + Unpin + Send + 'static,
{
    let (local_addr, remote_addr) = io.session_addrs()?;
    let conn = yamux::Connection::new(TokioAsyncReadCompatExt::compat(io), config.to_yamux(), mode);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let termination = Arc::new(Termination::default());

    tokio::spawn(drive(conn, commands_rx, inbound_tx, termination.clone()));
    debug!(local = %local_addr, remote = %remote_addr, ?mode, "yamux session started");

    Ok((
        Session {
            commands: commands_tx,
            termination,
            local_addr,
            remote_addr,
        },
        inbound_rx,
    ))
}

async fn drive<T>(
    mut conn: yamux::Connection<T>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedSender<yamux::Stream>,
    termination: Arc<Termination>,
) where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    let mut pending: VecDeque<OpenReply> = VecDeque::new();
    let mut closing = false;

    let result = poll_fn(|cx| {
        while !closing {
            match commands.poll_recv(cx) {
                Poll::Ready(Some(Command::Open(reply))) => pending.push_back(reply),
                // All handles dropped or an explicit close.
                Poll::Ready(Some(Command::Close)) | Poll::Ready(None) => closing = true,
                Poll::Pending => break,
            }
        }
        if closing {
            return conn.poll_close(cx).map(|r| r.map(|()| "closed locally".to_string()));
        }

        while let Some(reply) = pending.front() {
            if reply.is_closed() {
                pending.pop_front();
                continue;
            }
            match conn.poll_new_outbound(cx) {
                Poll::Ready(opened) => {
                    if let Some(reply) = pending.pop_front() {
                        let _ = reply.send(opened);
                    }
                }
                Poll::Pending => break,
            }
        }

        loop {
            match conn.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    if inbound.send(stream).is_err() {
                        debug!("dropping inbound yamux stream on dial-only session");
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok("closed by peer".to_string())),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    match result {
        Ok(reason) => {
            debug!(%reason, "yamux session ended");
            termination.set(reason);
        }
        Err(e) => {
            warn!(error = %e, "yamux session failed");
            termination.set(e.to_string());
        }
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Accepts peer-opened yamux streams as connections.
#[derive(Debug)]
pub struct MuxListener {
    commands: mpsc::UnboundedSender<Command>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<yamux::Stream>>,
    termination: Arc<Termination>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl MuxListener {
    /// Start a server-side session over `io`. Must run inside a tokio runtime.
    pub fn new<T>(io: T, config: &MuxConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + SessionAddrs + Unpin + Send + 'static,
    {
        let (session, inbound) = start_session(io, config, yamux::Mode::Server)?;
        Ok(Self {
            commands: session.commands,
            inbound: tokio::sync::Mutex::new(inbound),
            termination: session.termination,
            local_addr: session.local_addr,
            remote_addr: session.remote_addr,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl Listener for MuxListener {
    type Conn = StreamConn<MuxStream>;

    async fn accept(&self) -> Result<Self::Conn> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(stream) => {
                debug!(stream_id = %stream.id(), "accepted yamux stream");
                Ok(StreamConn::new(
                    FuturesAsyncReadCompatExt::compat(stream),
                    self.local_addr,
                    self.remote_addr,
                ))
            }
            None => Err(self.termination.error()),
        }
    }

    fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

// =============================================================================
// Dialer
// =============================================================================

/// Opens a new yamux stream per dial.
///
/// Clones share the session; it closes when the last clone is dropped or
/// [`MuxDialer::close`] is called.
#[derive(Debug, Clone)]
pub struct MuxDialer {
    commands: mpsc::UnboundedSender<Command>,
    termination: Arc<Termination>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl MuxDialer {
    /// Start a client-side session over `io`. Must run inside a tokio runtime.
    pub fn new<T>(io: T, config: &MuxConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + SessionAddrs + Unpin + Send + 'static,
    {
        // Client sessions never accept; inbound streams are dropped.
        let (session, _inbound) = start_session(io, config, yamux::Mode::Client)?;
        Ok(Self {
            commands: session.commands,
            termination: session.termination,
            local_addr: session.local_addr,
            remote_addr: session.remote_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Terminate the session for every clone.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

impl Dialer for MuxDialer {
    type Conn = StreamConn<MuxStream>;

    async fn dial(&self) -> Result<Self::Conn> {
        let (reply, opened) = oneshot::channel();
        self.commands
            .send(Command::Open(reply))
            .map_err(|_| self.termination.error())?;

        let stream = opened
            .await
            .map_err(|_| self.termination.error())?
            .map_err(|e| Error::Transport {
                message: format!("failed to open yamux stream: {e}"),
            })?;
        debug!(stream_id = %stream.id(), "opened yamux stream");
        Ok(StreamConn::new(
            FuturesAsyncReadCompatExt::compat(stream),
            self.local_addr,
            self.remote_addr,
        ))
    }
}
