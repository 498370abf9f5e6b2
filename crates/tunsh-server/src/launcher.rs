//! Launching commands on a fresh pseudo-terminal.
//!
//! The child gets the pty slave as stdin and stdout, a pipe as stderr, and
//! becomes a session leader with the slave as its controlling terminal.
//! Chroot and credential changes are applied in the child before exec.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use nix::unistd::{Gid, Uid, chdir, chroot, setgid, setgroups, setsid, setuid};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use tunsh_core::constants::DEFAULT_SHELLS;
use tunsh_core::error::{Error, Result};
use tunsh_core::proto::Cmd;

use crate::credentials::{Credential, credentials};
use crate::pty::{Pty, PtyMaster};

// =============================================================================
// Executable Lookup
// =============================================================================

/// Resolve `name` the way a shell would.
///
/// Names containing `/` are used as given; anything else is searched for in
/// `PATH`. The result must be an executable regular file.
pub fn look_path(name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        return Err(Error::NotFound {
            message: "no command given".to_string(),
        });
    }

    if name.contains('/') {
        let path = PathBuf::from(name);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(Error::NotFound {
            message: format!("{name:?} is not an executable file"),
        });
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| Error::NotFound {
            message: format!("executable {name:?} not found in PATH"),
        })
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// First of the usual shells available on this host.
pub fn find_default_shell() -> Option<PathBuf> {
    DEFAULT_SHELLS.iter().find_map(|shell| look_path(shell).ok())
}

// =============================================================================
// Launcher
// =============================================================================

/// Starts commands for shell sessions.
#[derive(Debug, Clone)]
pub struct Launcher {
    default_command: String,
}

impl Launcher {
    /// `default_command` runs when a request names no executable.
    pub fn new(default_command: impl Into<String>) -> Self {
        Self {
            default_command: default_command.into(),
        }
    }

    pub fn default_command(&self) -> &str {
        &self.default_command
    }

    /// Start `cmd` on a new 24x80 pty.
    ///
    /// Fails with [`Error::NotFound`] when the executable cannot be
    /// resolved; nothing is allocated in that case.
    pub fn launch(&self, cmd: &Cmd) -> Result<ProcessHandle> {
        let name = if cmd.path.is_empty() {
            self.default_command.as_str()
        } else {
            cmd.path.as_str()
        };
        let program = look_path(name)?;
        let attrs = cmd.linux.clone().unwrap_or_default();
        let setup = ChildSetup::new(&attrs.chroot, credentials(&attrs))?;

        let pty = Pty::open()?;

        // The command holds copies of the slave until it is dropped.
        let mut child = {
            let mut command = Command::new(&program);
            command
                .args(&cmd.args)
                .stdin(pty.slave_stdio()?)
                .stdout(pty.slave_stdio()?)
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            // SAFETY: the hook only makes async-signal-safe system calls
            // and touches no memory shared with the parent.
            unsafe {
                command.pre_exec(move || setup.apply());
            }
            command.spawn()?
        };

        // Keep no slave descriptor in the parent, so the master reaches EOF
        // once the child and anything it spawned are gone.
        let (master, slave) = pty.into_parts();
        drop(slave);
        let stderr = child.stderr.take();

        info!(
            program = %program.display(),
            args = ?cmd.args,
            pid = child.id(),
            "process started"
        );
        Ok(ProcessHandle::new(child, master, stderr))
    }
}

/// Everything the child applies to itself between fork and exec.
///
/// Credentials are set here rather than through `CommandExt::uid` so the
/// chroot happens while the child still has the privilege to do it.
struct ChildSetup {
    chroot: Option<CString>,
    credential: Option<Credential>,
}

impl ChildSetup {
    fn new(chroot: &str, credential: Option<Credential>) -> Result<Self> {
        let chroot = if chroot.is_empty() {
            None
        } else {
            let path = CString::new(Path::new(chroot).as_os_str().as_bytes()).map_err(|_| {
                Error::Protocol {
                    message: format!("chroot path contains a NUL byte: {chroot:?}"),
                }
            })?;
            Some(path)
        };
        Ok(Self { chroot, credential })
    }

    fn apply(&self) -> io::Result<()> {
        if let Some(root) = &self.chroot {
            chroot(root.as_c_str())?;
            chdir("/")?;
        }

        setsid()?;

        // The slave is already on stdin; make it the controlling terminal.
        // SAFETY: TIOCSCTTY takes an integer argument and no pointers.
        if unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) } == -1 {
            return Err(io::Error::last_os_error());
        }

        if let Some(cred) = self.credential {
            setgroups(&[])?;
            setgid(Gid::from_raw(cred.gid))?;
            setuid(Uid::from_raw(cred.uid))?;
        }
        Ok(())
    }
}

// =============================================================================
// Process Handle
// =============================================================================

/// How a child process ended.
#[derive(Debug, Clone)]
pub enum ExitOutcome {
    Exited(ExitStatus),
    WaitFailed(String),
}

impl ExitOutcome {
    /// `Ok` for a successful exit.
    pub fn into_result(self) -> Result<()> {
        match self {
            ExitOutcome::Exited(status) if status.success() => Ok(()),
            ExitOutcome::Exited(status) => Err(Error::ProcessExit { status }),
            ExitOutcome::WaitFailed(message) => Err(Error::Io(io::Error::other(message))),
        }
    }
}

/// Observer for a child's exit. Clones observe the same child.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<ExitOutcome>>,
}

impl ExitWatch {
    /// Wait until the child has exited and been reaped.
    pub async fn wait(&mut self) -> ExitOutcome {
        let outcome = self
            .rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| (*outcome).clone());
        outcome.unwrap_or_else(|| ExitOutcome::WaitFailed("process reaper stopped".to_string()))
    }

    /// The outcome, if the child has already been reaped.
    pub fn try_outcome(&self) -> Option<ExitOutcome> {
        self.rx.borrow().clone()
    }
}

/// A running child together with its pty master and stderr pipe.
///
/// A reaper task owns the child and waits on it. Dropping the handle kills
/// the child.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    master: Option<PtyMaster>,
    stderr: Option<ChildStderr>,
    kill: Option<oneshot::Sender<()>>,
    exit: ExitWatch,
}

impl ProcessHandle {
    fn new(child: Child, master: PtyMaster, stderr: Option<ChildStderr>) -> Self {
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(reap(child, kill_rx, exit_tx));

        Self {
            pid,
            master: Some(master),
            stderr,
            kill: Some(kill_tx),
            exit: ExitWatch { rx: exit_rx },
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The pty master, until the handle is closed.
    pub fn master(&self) -> Option<&PtyMaster> {
        self.master.as_ref()
    }

    /// Take the read end of the child's stderr pipe.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    /// Kill the child if it is still running, wait for it, and release the
    /// pty master and stderr pipe. Safe to call more than once.
    pub async fn close(&mut self) -> ExitOutcome {
        if let Some(kill) = self.kill.take() {
            // Fails only when the child was already reaped.
            let _ = kill.send(());
        }
        let outcome = self.exit.wait().await;
        self.master = None;
        self.stderr = None;
        debug!(pid = self.pid, ?outcome, "process closed");
        outcome
    }
}

async fn reap(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit: watch::Sender<Option<ExitOutcome>>,
) {
    let pid = child.id();

    // A dropped sender counts as a kill request.
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "kill failed, process already gone");
            }
            child.wait().await
        }
    };

    let outcome = match status {
        Ok(status) => {
            debug!(pid, %status, "process exited");
            ExitOutcome::Exited(status)
        }
        Err(e) => ExitOutcome::WaitFailed(e.to_string()),
    };
    exit.send_replace(Some(outcome));
}
