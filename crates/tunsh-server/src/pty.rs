//! PTY management for shell sessions.
//!
//! Handles:
//! - Opening a pseudo-terminal pair at the default 24x80 size
//! - Async reads and writes on the master through tokio's reactor
//! - Window size changes
//!
//! Uses the `nix` crate for Unix PTY support and `AsyncFd` so reads and
//! writes wait on readiness instead of polling.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use nix::pty::{OpenptyResult, Winsize, openpty};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

use tunsh_core::constants::{DEFAULT_TERMINAL_COLS, DEFAULT_TERMINAL_ROWS};
use tunsh_core::error::{Error, Result};
use tunsh_core::shell::terminal_size;

fn pty_error(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Pty {
        message: format!("{context}: {err}"),
    }
}

/// A freshly opened pseudo-terminal pair.
///
/// Dropping it closes both ends.
#[derive(Debug)]
pub struct Pty {
    master: PtyMaster,
    slave: OwnedFd,
}

impl Pty {
    /// Open a pseudo-terminal sized 24x80.
    pub fn open() -> Result<Self> {
        let OpenptyResult { master, slave } =
            openpty(None, None).map_err(|e| pty_error("failed to open pty", e))?;

        // On failure both descriptors drop here.
        let master = PtyMaster::new(master)?;
        master.resize(DEFAULT_TERMINAL_ROWS, DEFAULT_TERMINAL_COLS)?;
        debug!(fd = master.fd.as_raw_fd(), "opened pty");
        Ok(Self { master, slave })
    }

    pub fn master(&self) -> &PtyMaster {
        &self.master
    }

    /// A new handle on the slave end, for a child's standard stream.
    pub fn slave_stdio(&self) -> Result<Stdio> {
        let fd = self
            .slave
            .try_clone()
            .map_err(|e| pty_error("failed to duplicate pty slave", e))?;
        Ok(Stdio::from(fd))
    }

    /// Split into the master and the parent's slave descriptor.
    pub fn into_parts(self) -> (PtyMaster, OwnedFd) {
        (self.master, self.slave)
    }
}

/// Shared handle on the master end.
///
/// Reads return the terminal's output and end (EOF) once every slave
/// descriptor is closed; writes are terminal input.
#[derive(Debug, Clone)]
pub struct PtyMaster {
    fd: Arc<AsyncFd<File>>,
}

impl PtyMaster {
    fn new(fd: OwnedFd) -> Result<Self> {
        set_nonblocking(&fd)?;
        let file = File::from(fd);
        let fd = AsyncFd::new(file).map_err(|e| pty_error("failed to create AsyncFd", e))?;
        Ok(Self { fd: Arc::new(fd) })
    }

    /// Set the window size.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: TIOCSWINSZ reads a winsize struct from a valid descriptor.
        let result = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
        if result == -1 {
            return Err(pty_error("failed to resize pty", io::Error::last_os_error()));
        }

        debug!(rows, cols, "pty resized");
        Ok(())
    }

    /// Current (rows, cols).
    pub fn size(&self) -> Result<(u16, u16)> {
        terminal_size(self.fd.get_ref())
    }

    /// Write all of `data` as terminal input.
    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let mut guard = self
                .fd
                .writable()
                .await
                .map_err(|e| pty_error("failed to wait for pty write readiness", e))?;

            match guard.try_io(|inner| inner.get_ref().write(remaining)) {
                Ok(Ok(n)) => remaining = &remaining[n..],
                Ok(Err(e)) => return Err(pty_error("failed to write to pty", e)),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

impl AsFd for PtyMaster {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.fd.get_ref().as_fd()
    }
}

impl AsyncRead for PtyMaster {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                // Linux reports a hung-up slave as EIO rather than EOF.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => {
                    debug!("pty read returned EIO, slave closed");
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Set a file descriptor to non-blocking mode.
fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    use nix::fcntl::{FcntlArg, OFlag, fcntl};

    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)
        .map_err(|e| pty_error("fcntl F_GETFL failed", e))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))
        .map_err(|e| pty_error("fcntl F_SETFL failed", e))?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn opens_at_default_size() {
        let pty = Pty::open().unwrap();
        assert_eq!(
            pty.master().size().unwrap(),
            (DEFAULT_TERMINAL_ROWS, DEFAULT_TERMINAL_COLS)
        );
    }

    #[tokio::test]
    async fn resize_changes_reported_size() {
        let pty = Pty::open().unwrap();
        pty.master().resize(40, 120).unwrap();
        assert_eq!(pty.master().size().unwrap(), (40, 120));
    }

    #[tokio::test]
    async fn input_echoes_back_through_line_discipline() {
        let pty = Pty::open().unwrap();
        let mut master = pty.master().clone();
        master.write_all(b"hi\n").await.unwrap();

        let mut buf = [0u8; 16];
        let n = master.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert!(buf[..n].starts_with(b"hi"));
    }

    #[tokio::test]
    async fn reads_end_after_slave_closes() {
        let (mut master, slave) = Pty::open().unwrap().into_parts();
        drop(slave);

        let mut out = Vec::new();
        master.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }
}
