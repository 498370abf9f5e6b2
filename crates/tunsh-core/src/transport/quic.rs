//! QUIC adapter using Quinn.
//!
//! One QUIC connection is one session; every bidirectional QUIC stream is
//! one logical connection.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use quinn::{Connection, RecvStream, SendStream, VarInt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use super::{Dialer, Listener, StreamConn};
use crate::constants::{SERVER_CLOSE_CODE, SERVER_CLOSE_REASON};
use crate::error::{Error, Result};

fn session_error(err: quinn::ConnectionError) -> Error {
    Error::SessionClosed {
        reason: err.to_string(),
    }
}

// =============================================================================
// QUIC Stream
// =============================================================================

/// A bidirectional QUIC stream joined into one duplex.
#[derive(Debug)]
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
}

impl QuicStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    /// QUIC stream ID.
    pub fn id(&self) -> quinn::StreamId {
        self.send.id()
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.get_mut().recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Accepts peer-opened QUIC streams as connections.
#[derive(Debug, Clone)]
pub struct QuicListener {
    conn: Connection,
    local_addr: SocketAddr,
}

impl QuicListener {
    /// `local_addr` is the address of the endpoint that owns `conn`.
    pub fn new(conn: Connection, local_addr: SocketAddr) -> Self {
        Self { conn, local_addr }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Listener for QuicListener {
    type Conn = StreamConn<QuicStream>;

    async fn accept(&self) -> Result<Self::Conn> {
        let (send, recv) = self.conn.accept_bi().await.map_err(session_error)?;
        debug!(stream_id = ?send.id(), remote = %self.conn.remote_address(), "accepted QUIC stream");
        Ok(StreamConn::new(
            QuicStream::new(send, recv),
            self.local_addr,
            self.conn.remote_address(),
        ))
    }

    fn close(&self) {
        debug!(remote = %self.conn.remote_address(), "closing QUIC session");
        self.conn
            .close(VarInt::from_u32(SERVER_CLOSE_CODE), SERVER_CLOSE_REASON);
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

// =============================================================================
// Dialer
// =============================================================================

/// Opens a new QUIC stream per dial.
#[derive(Debug, Clone)]
pub struct QuicDialer {
    conn: Connection,
    local_addr: SocketAddr,
}

impl QuicDialer {
    /// `local_addr` is the address of the endpoint that owns `conn`.
    pub fn new(conn: Connection, local_addr: SocketAddr) -> Self {
        Self { conn, local_addr }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Dialer for QuicDialer {
    type Conn = StreamConn<QuicStream>;

    async fn dial(&self) -> Result<Self::Conn> {
        let (send, recv) = self.conn.open_bi().await.map_err(session_error)?;
        debug!(stream_id = ?send.id(), "opened QUIC stream");
        Ok(StreamConn::new(
            QuicStream::new(send, recv),
            self.local_addr,
            self.conn.remote_address(),
        ))
    }
}
