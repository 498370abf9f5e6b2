//! Transport adapters for tunsh.
//!
//! Both underlying transports multiplex many logical streams over one
//! authenticated session. These adapters present a session as:
//! - a [`Listener`] that yields each peer-opened stream as a [`StreamConn`]
//! - a [`Dialer`] that opens a new stream per call
//!
//! Implementations:
//! - QUIC (quinn): one bidirectional QUIC stream per connection
//! - yamux over any reliable byte stream (normally TLS over TCP)

mod conn;
mod mux;
mod quic;

pub use conn::{ConnInfo, StreamConn};
pub use mux::{MuxConfig, MuxDialer, MuxListener, MuxStream, SessionAddrs};
pub use quic::{QuicDialer, QuicListener, QuicStream};

use std::future::Future;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;

use crate::error::{Error, Result};

/// Bounds every adapted connection satisfies.
pub trait Conn:
    AsyncRead + AsyncWrite + Connected<ConnectInfo = ConnInfo> + Unpin + Send + 'static
{
}

impl<T> Conn for T where
    T: AsyncRead + AsyncWrite + Connected<ConnectInfo = ConnInfo> + Unpin + Send + 'static
{
}

// =============================================================================
// Listener Trait
// =============================================================================

/// Server-side view of a multiplexed session.
pub trait Listener: Send + Sync + 'static {
    /// The connection type produced for each accepted stream.
    type Conn: Conn;

    /// Wait for the peer to open the next stream.
    ///
    /// Fails once the session is closed; a failed accept never recovers.
    fn accept(&self) -> impl Future<Output = Result<Self::Conn>> + Send;

    /// Terminate the whole session. Pending and future accepts fail.
    fn close(&self);

    /// Local address of the session.
    fn local_addr(&self) -> SocketAddr;
}

// =============================================================================
// Dialer Trait
// =============================================================================

/// Client-side view of a multiplexed session.
pub trait Dialer: Clone + Send + Sync + 'static {
    /// The connection type produced for each opened stream.
    type Conn: Conn;

    /// Open a new stream on the session.
    ///
    /// Waits for stream credit if the peer's concurrent stream limit is
    /// reached. Dropping the future abandons the open.
    fn dial(&self) -> impl Future<Output = Result<Self::Conn>> + Send;

    /// Open a new stream, giving up when `cancel` fires.
    ///
    /// `address` is ignored: every stream goes to the session's peer.
    fn dial_context(
        &self,
        cancel: &CancellationToken,
        address: &str,
    ) -> impl Future<Output = Result<Self::Conn>> + Send {
        let _ = address;
        async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                conn = self.dial() => conn,
            }
        }
    }
}
