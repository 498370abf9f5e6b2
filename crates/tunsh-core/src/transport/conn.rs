//! Duplex connection view of a single logical stream.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{Instant, Sleep, sleep_until};
use tonic::transport::server::Connected;

/// Addresses of the session a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

/// A logical stream presented as an ordinary connection.
///
/// Reads and writes go straight to the stream; addresses come from the
/// owning session. Deadlines are optional per direction: once a deadline
/// passes, operations in that direction fail with
/// [`io::ErrorKind::TimedOut`] until the deadline is cleared or moved.
pub struct StreamConn<S> {
    inner: S,
    info: ConnInfo,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> StreamConn<S> {
    pub fn new(inner: S, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            inner,
            info: ConnInfo {
                local_addr,
                remote_addr,
            },
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.info.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.info.remote_addr
    }

    /// Set both deadlines. `None` clears them.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|at| Box::pin(sleep_until(at)));
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|at| Box::pin(sleep_until(at)));
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> StreamConn<S> {
    /// Close the write half; the peer reads end-of-stream.
    pub async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

fn expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

fn timed_out(direction: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{direction} deadline exceeded"))
}

impl<S: AsyncRead + Unpin> AsyncRead for StreamConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if expired(&mut this.read_deadline, cx) {
            return Poll::Ready(Err(timed_out("read")));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for StreamConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S> Connected for StreamConn<S> {
    type ConnectInfo = ConnInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info
    }
}

impl<S> std::fmt::Debug for StreamConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConn")
            .field("local_addr", &self.info.local_addr)
            .field("remote_addr", &self.info.remote_addr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, duplex};

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:1000".parse().unwrap(),
            "127.0.0.1:2000".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn passes_bytes_through() {
        let (a, b) = duplex(64);
        let (local, remote) = addrs();
        let mut left = StreamConn::new(a, local, remote);
        let mut right = StreamConn::new(b, remote, local);

        left.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(left.local_addr(), local);
        assert_eq!(left.remote_addr(), remote);
        assert_eq!(right.connect_info().local_addr, remote);
    }

    #[tokio::test]
    async fn close_signals_end_of_stream() {
        let (a, b) = duplex(64);
        let (local, remote) = addrs();
        let mut left = StreamConn::new(a, local, remote);
        let mut right = StreamConn::new(b, remote, local);

        left.write_all(b"bye").await.unwrap();
        left.close().await.unwrap();

        let mut out = Vec::new();
        right.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"bye");
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline_times_out() {
        let (a, _b) = duplex(64);
        let (local, remote) = addrs();
        let mut conn = StreamConn::new(a, local, remote);
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));

        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_deadline_restores_reads() {
        let (a, mut b) = duplex(64);
        let (local, remote) = addrs();
        let mut conn = StreamConn::new(a, local, remote);
        conn.set_deadline(Some(Instant::now()));

        let mut buf = [0u8; 2];
        assert_eq!(
            conn.read(&mut buf).await.unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
        assert_eq!(
            conn.write(b"x").await.unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );

        conn.set_deadline(None);
        b.write_all(b"ok").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }
}
