//! Frame helpers shared by the shell client and server.
//!
//! Both ends push [`ShellMsg`] frames into a bounded `mpsc` channel: the
//! client feeds its request stream with plain frames, the server feeds its
//! response stream with `Result<ShellMsg, Status>`. [`FrameItem`] abstracts
//! over the two so the same writer serves both.

use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tonic::Status;

use crate::error::{Error, Result};
use crate::proto::{IoDataType, ShellMsg};

/// Item type of a frame channel.
pub trait FrameItem: Send + 'static {
    /// Wrap an outgoing frame.
    fn from_frame(msg: ShellMsg) -> Self;
}

impl FrameItem for ShellMsg {
    fn from_frame(msg: ShellMsg) -> Self {
        msg
    }
}

impl FrameItem for std::result::Result<ShellMsg, Status> {
    fn from_frame(msg: ShellMsg) -> Self {
        Ok(msg)
    }
}

/// Send one frame, failing once the receiving side is gone.
pub async fn send_frame<T: FrameItem>(tx: &mpsc::Sender<T>, msg: ShellMsg) -> Result<()> {
    tx.send(T::from_frame(msg))
        .await
        .map_err(|_| Error::SessionClosed {
            reason: "frame stream closed".to_string(),
        })
}

// =============================================================================
// Frame Writer
// =============================================================================

/// Byte sink that turns every write into one IO frame of a fixed kind.
///
/// Implements [`AsyncWrite`], so `tokio::io::copy` can pump a reader
/// straight into the frame channel.
pub struct FrameWriter<T: FrameItem> {
    tx: mpsc::Sender<T>,
    poll: PollSender<T>,
    kind: IoDataType,
}

impl<T: FrameItem> FrameWriter<T> {
    pub fn new(tx: mpsc::Sender<T>, kind: IoDataType) -> Self {
        Self {
            poll: PollSender::new(tx.clone()),
            tx,
            kind,
        }
    }

    /// Stream tag applied to written bytes.
    pub fn kind(&self) -> IoDataType {
        self.kind
    }

    /// Send `data` as a single frame.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        send_frame(&self.tx, ShellMsg::io(self.kind, data)).await
    }
}

impl<T: FrameItem> Clone for FrameWriter<T> {
    fn clone(&self) -> Self {
        Self::new(self.tx.clone(), self.kind)
    }
}

impl<T: FrameItem> AsyncWrite for FrameWriter<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();
        if ready!(this.poll.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let frame = T::from_frame(ShellMsg::io(this.kind, buf));
        match this.poll.send_item(frame) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll.close();
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// Window Size
// =============================================================================

/// Read the (rows, cols) of the terminal behind `fd`.
pub fn terminal_size(fd: impl AsFd) -> Result<(u16, u16)> {
    // SAFETY: TIOCGWINSZ fills a winsize struct for a valid descriptor.
    unsafe {
        let mut winsize: libc::winsize = std::mem::zeroed();
        if libc::ioctl(fd.as_fd().as_raw_fd(), libc::TIOCGWINSZ, &mut winsize) != 0 {
            return Err(Error::Pty {
                message: format!("get window size: {}", io::Error::last_os_error()),
            });
        }
        Ok((winsize.ws_row, winsize.ws_col))
    }
}

/// Read the local terminal size behind `fd` and send it as a resize frame.
pub async fn push_window_size<T: FrameItem>(tx: &mpsc::Sender<T>, fd: impl AsFd) -> Result<()> {
    let (rows, cols) = terminal_size(fd)?;
    send_frame(tx, ShellMsg::resize(i32::from(rows), i32::from(cols))).await
}
