//! Terminal handling for raw mode I/O.
//!
//! Provides:
//! - Raw terminal mode setup/restore
//! - A stdin reader that never blocks the runtime

use std::io::{self, Read};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::termios::{SetArg, Termios, cfmakeraw, tcgetattr, tcsetattr};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tunsh_core::constants::FRAME_CHANNEL_CAPACITY;
use tunsh_core::error::{Error, Result};

/// Flag indicating if we're in raw mode.
static RAW_MODE_ACTIVE: AtomicBool = AtomicBool::new(false);

fn termios_error(context: &str, err: nix::errno::Errno) -> Error {
    Error::Io(io::Error::new(
        io::Error::from(err).kind(),
        format!("{context}: {err}"),
    ))
}

/// Guard that restores terminal settings on drop.
pub struct RawModeGuard {
    fd: OwnedFd,
    original: Termios,
}

impl RawModeGuard {
    /// Put the terminal behind `fd` in raw mode.
    ///
    /// Returns a guard that restores normal mode on drop.
    pub fn enter_on(fd: impl AsFd) -> Result<Self> {
        let fd = fd.as_fd().try_clone_to_owned()?;
        let original = tcgetattr(&fd).map_err(|e| termios_error("tcgetattr", e))?;

        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&fd, SetArg::TCSAFLUSH, &raw).map_err(|e| termios_error("tcsetattr", e))?;

        RAW_MODE_ACTIVE.store(true, Ordering::SeqCst);
        debug!("Entered raw terminal mode");
        Ok(Self { fd, original })
    }

    /// Check if raw mode is currently active.
    pub fn is_active() -> bool {
        RAW_MODE_ACTIVE.load(Ordering::SeqCst)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        match tcsetattr(&self.fd, SetArg::TCSAFLUSH, &self.original) {
            Ok(()) => debug!("Restored terminal settings"),
            Err(e) => warn!(error = %e, "Failed to restore terminal settings"),
        }
        RAW_MODE_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Async stdin reader.
///
/// A blocking thread reads stdin and sends chunks through a bounded channel,
/// so a pending read never holds up the runtime and a slow session stops the
/// thread from reading ahead. The channel closes at EOF.
pub struct StdinReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl StdinReader {
    /// Start reading the process's stdin.
    pub fn spawn() -> Self {
        Self::spawn_reading(io::stdin())
    }

    /// Read `source` on a dedicated thread.
    fn spawn_reading<R: Read + Send + 'static>(mut source: R) -> Self {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];

            loop {
                match source.read(&mut buf) {
                    Ok(0) => {
                        debug!("stdin EOF");
                        break;
                    }
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            debug!("stdin receiver dropped");
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "stdin read error");
                        break;
                    }
                }
            }
            debug!("stdin reader thread exiting");
        });

        Self { rx }
    }

    /// Reader fed by `rx` instead of the process's stdin.
    pub fn from_receiver(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Next chunk of input, `None` at EOF.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

// =============================================================================
// Tests
// =============================================================================
