//! Shell session state machine.
//!
//! A session waits for a COMMAND frame, launches the process, then runs four
//! loops until the first of them finishes:
//! - stdout: pty master → stdout frames
//! - stderr: stderr pipe → stderr frames
//! - input: stdin frames → pty master, resize frames → window size
//! - exit: waits for the process, then for output to drain
//!
//! Whichever loop finishes first decides the outcome; the process is always
//! torn down before [`ShellSession::run`] returns.

use std::io;

use futures::{Stream, StreamExt};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tonic::Status;
use tracing::{debug, info, warn};

use tunsh_core::constants::OUTPUT_DRAIN_GRACE;
use tunsh_core::error::{Error, Result};
use tunsh_core::proto::{Cmd, IoDataType, ShellMsg, ShellMsgType, WinSize};
use tunsh_core::shell::FrameWriter;

use crate::launcher::{ExitWatch, Launcher, ProcessHandle};
use crate::pty::PtyMaster;

/// Frames sent back to the client.
pub type Outbound = mpsc::Sender<std::result::Result<ShellMsg, Status>>;

type OutboundWriter = FrameWriter<std::result::Result<ShellMsg, Status>>;

/// Read the opening frame, which must be a COMMAND.
pub async fn await_command<S>(inbound: &mut S) -> Result<Cmd>
where
    S: Stream<Item = std::result::Result<ShellMsg, Status>> + Unpin,
{
    let msg = match inbound.next().await {
        Some(msg) => msg?,
        None => {
            return Err(Error::Protocol {
                message: "stream ended before a command was sent".to_string(),
            });
        }
    };

    if msg.r#type() != ShellMsgType::Command {
        return Err(Error::Protocol {
            message: format!("unexpected message type: {}", msg.r#type().as_str_name()),
        });
    }
    Ok(msg.into_cmd())
}

// =============================================================================
// Completion
// =============================================================================

/// Single-slot, first-report-wins outcome of a session.
struct Completion {
    tx: mpsc::Sender<Result<()>>,
    rx: mpsc::Receiver<Result<()>>,
}

/// Handle a loop uses to report how it ended. Never blocks.
#[derive(Clone)]
struct Reporter {
    tx: mpsc::Sender<Result<()>>,
}

impl Completion {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self { tx, rx }
    }

    fn reporter(&self) -> Reporter {
        Reporter {
            tx: self.tx.clone(),
        }
    }

    /// First reported outcome. End-of-stream outcomes, and every reporter
    /// going away without a report, count as success.
    async fn wait(self) -> Result<()> {
        let Self { tx, mut rx } = self;
        drop(tx);
        match rx.recv().await {
            None => Ok(()),
            Some(Err(e)) if e.is_end_of_stream() => {
                debug!(reason = %e, "session ended by stream close");
                Ok(())
            }
            Some(outcome) => outcome,
        }
    }
}

impl Reporter {
    fn report(&self, outcome: Result<()>) {
        if let Err(e) = self.tx.try_send(outcome) {
            let dropped = match e {
                mpsc::error::TrySendError::Full(outcome) => outcome,
                mpsc::error::TrySendError::Closed(outcome) => outcome,
            };
            debug!(?dropped, "session already completing, outcome dropped");
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// A launched process bound to one shell RPC.
#[derive(Debug)]
pub struct ShellSession {
    process: ProcessHandle,
}

impl ShellSession {
    /// Launch `cmd`. Nothing runs until [`run`](Self::run).
    pub fn start(launcher: &Launcher, cmd: &Cmd) -> Result<Self> {
        let process = launcher.launch(cmd)?;
        Ok(Self { process })
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Pump frames between `inbound`, the process and `outbound` until the
    /// session ends, then tear the process down.
    pub async fn run<S>(mut self, inbound: S, outbound: Outbound) -> Result<()>
    where
        S: Stream<Item = std::result::Result<ShellMsg, Status>> + Unpin + Send + 'static,
    {
        let result = self.pump(inbound, outbound).await;
        let outcome = self.process.close().await;
        info!(pid = self.process.pid(), ?outcome, ok = result.is_ok(), "session closed");
        result
    }

    async fn pump<S>(&mut self, inbound: S, outbound: Outbound) -> Result<()>
    where
        S: Stream<Item = std::result::Result<ShellMsg, Status>> + Unpin + Send + 'static,
    {
        let master = self.process.master().cloned().ok_or_else(|| Error::Pty {
            message: "process already closed".to_string(),
        })?;
        let stderr = self.process.take_stderr();

        let stdout_writer = FrameWriter::new(outbound.clone(), IoDataType::Stdout);
        let stderr_writer = FrameWriter::new(outbound, IoDataType::Stderr);

        let completion = Completion::new();
        let mut tasks = JoinSet::new();

        let (stdout_done, stdout_drained) = oneshot::channel();
        let (stderr_done, stderr_drained) = oneshot::channel();

        tasks.spawn(pump_output(
            "stdout",
            master.clone(),
            stdout_writer,
            completion.reporter(),
            stdout_done,
        ));
        match stderr {
            Some(stderr) => {
                tasks.spawn(pump_output(
                    "stderr",
                    stderr,
                    stderr_writer.clone(),
                    completion.reporter(),
                    stderr_done,
                ));
            }
            None => {
                let _ = stderr_done.send(());
            }
        }
        tasks.spawn(pump_input(
            inbound,
            master,
            stderr_writer,
            self.process.exit_watch(),
            completion.reporter(),
        ));
        tasks.spawn(wait_exit(
            self.process.exit_watch(),
            [stdout_drained, stderr_drained],
            completion.reporter(),
        ));

        let result = completion.wait().await;
        tasks.shutdown().await;
        result
    }
}

// =============================================================================
// Loops
// =============================================================================

/// Copy `source` into frames. Reaching EOF is signalled on `drained`
/// rather than reported, so the exit loop decides when output is complete.
async fn pump_output<R>(
    name: &'static str,
    mut source: R,
    mut sink: OutboundWriter,
    reporter: Reporter,
    drained: oneshot::Sender<()>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    match tokio::io::copy(&mut source, &mut sink).await {
        Ok(bytes) => {
            debug!(stream = name, bytes, "output drained");
            let _ = drained.send(());
        }
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            reporter.report(Err(Error::SessionClosed {
                reason: format!("{name} frames no longer read"),
            }));
        }
        Err(e) => {
            warn!(stream = name, error = %e, "output pump failed");
            reporter.report(Err(Error::Io(e)));
        }
    }
}

/// Forward client frames to the process.
///
/// A clean end of the client's stream gives the process up to
/// `OUTPUT_DRAIN_GRACE` to exit. If it does, the exit loop reports once its
/// output is drained; otherwise the session ends and the process is killed.
async fn pump_input<S>(
    mut inbound: S,
    master: PtyMaster,
    errors: OutboundWriter,
    mut exit: ExitWatch,
    reporter: Reporter,
) where
    S: Stream<Item = std::result::Result<ShellMsg, Status>> + Unpin + Send + 'static,
{
    match forward_input(&mut inbound, &master, &errors).await {
        Ok(()) => {
            drop(master);
            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, exit.wait()).await.is_err() {
                debug!("process still running after client closed, ending session");
                reporter.report(Ok(()));
            }
        }
        Err(e) => {
            debug!(error = %e, "input pump stopped");
            reporter.report(Err(e));
        }
    }
}

async fn forward_input<S>(inbound: &mut S, master: &PtyMaster, errors: &OutboundWriter) -> Result<()>
where
    S: Stream<Item = std::result::Result<ShellMsg, Status>> + Unpin,
{
    while let Some(msg) = inbound.next().await {
        let msg = msg?;
        match msg.r#type() {
            ShellMsgType::Io => {
                if let Some(io) = msg.io_data() {
                    master.write_all(&io.data).await?;
                }
            }
            ShellMsgType::Resize => {
                if let Err(e) = resize(master, msg.win_size()) {
                    warn!(error = %e, "resize failed");
                    errors.send(format!("resize terminal: {e}\n").as_bytes()).await?;
                }
            }
            other => debug!(kind = other.as_str_name(), "ignoring frame"),
        }
    }
    debug!("client closed its stream");
    Ok(())
}

fn resize(master: &PtyMaster, size: WinSize) -> Result<()> {
    let invalid = || Error::Protocol {
        message: format!("invalid window size {}x{}", size.rows, size.cols),
    };
    let rows = u16::try_from(size.rows).map_err(|_| invalid())?;
    let cols = u16::try_from(size.cols).map_err(|_| invalid())?;
    master.resize(rows, cols)
}

async fn wait_exit(mut exit: ExitWatch, drained: [oneshot::Receiver<()>; 2], reporter: Reporter) {
    let outcome = exit.wait().await;
    debug!(?outcome, "process exited, draining output");

    if tokio::time::timeout(OUTPUT_DRAIN_GRACE, futures::future::join_all(drained))
        .await
        .is_err()
    {
        debug!("output still open after exit, giving up on it");
    }
    reporter.report(outcome.into_result());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio_stream::wrappers::ReceiverStream;

    type Inbound = mpsc::Sender<std::result::Result<ShellMsg, Status>>;
    type Responses = mpsc::Receiver<std::result::Result<ShellMsg, Status>>;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn launcher() -> Launcher {
        Launcher::new("sh")
    }

    fn spawn_session(
        cmd: Cmd,
    ) -> (Inbound, Responses, tokio::task::JoinHandle<Result<()>>, Option<u32>) {
        let session = ShellSession::start(&launcher(), &cmd).unwrap();
        let pid = session.pid();
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(64);
        let handle = tokio::spawn(session.run(ReceiverStream::new(in_rx), out_tx));
        (in_tx, out_rx, handle, pid)
    }

    /// Collect stdout and stderr until the response stream ends.
    async fn collect(mut responses: Responses) -> (Vec<u8>, Vec<u8>) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(msg) = responses.recv().await {
            let msg = msg.unwrap();
            let io = msg.io_data().unwrap();
            match io.r#type() {
                IoDataType::Stdout => stdout.extend_from_slice(&io.data),
                IoDataType::Stderr => stderr.extend_from_slice(&io.data),
                other => panic!("unexpected stream {other:?}"),
            }
        }
        (stdout, stderr)
    }

    /// Read frames until one of the given kind contains `needle`.
    async fn read_until(responses: &mut Responses, kind: IoDataType, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            let msg = responses.recv().await.unwrap().unwrap();
            let io = msg.io_data().unwrap();
            if io.r#type() == kind {
                seen.push_str(&String::from_utf8_lossy(&io.data));
            }
        }
        seen
    }

    #[tokio::test]
    async fn completion_keeps_first_report() {
        let completion = Completion::new();
        let reporter = completion.reporter();
        reporter.report(Err(Error::Cancelled));
        reporter.report(Ok(()));
        reporter.report(Err(Error::Protocol {
            message: "late".to_string(),
        }));
        drop(reporter);
        assert!(matches!(completion.wait().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn completion_normalizes_end_of_stream() {
        let completion = Completion::new();
        completion.reporter().report(Err(Error::SessionClosed {
            reason: "gone".to_string(),
        }));
        assert!(completion.wait().await.is_ok());
    }

    #[tokio::test]
    async fn completion_without_reports_is_success() {
        let completion = Completion::new();
        drop(completion.reporter());
        assert!(completion.wait().await.is_ok());
    }

    #[tokio::test]
    async fn await_command_accepts_command_first() {
        let mut inbound = futures::stream::iter(vec![Ok(ShellMsg::command(Cmd::new(
            "sh",
            ["-c", "true"],
        )))]);
        let cmd = await_command(&mut inbound).await.unwrap();
        assert_eq!(cmd.path, "sh");
    }

    #[tokio::test]
    async fn await_command_rejects_other_frames() {
        let mut inbound = futures::stream::iter(vec![Ok(ShellMsg::resize(24, 80))]);
        let err = await_command(&mut inbound).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert!(err.to_string().contains("unexpected message type"));
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn await_command_rejects_empty_stream() {
        let mut inbound = futures::stream::iter(Vec::<std::result::Result<ShellMsg, Status>>::new());
        assert!(matches!(
            await_command(&mut inbound).await,
            Err(Error::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn echo_output_arrives_on_stdout_only() {
        let (inbound, responses, handle, _) = spawn_session(Cmd::new("echo", ["hello"]));

        let (stdout, stderr) = tokio::time::timeout(TIMEOUT, collect(responses))
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&stdout).trim(), "hello");
        assert!(stderr.is_empty());

        tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap().unwrap();
        drop(inbound);
    }

    #[tokio::test]
    async fn output_survives_client_close_right_after_command() {
        for _ in 0..10 {
            let (inbound, responses, handle, _) = spawn_session(Cmd::new("echo", ["hello"]));
            drop(inbound);

            let (stdout, _) = tokio::time::timeout(TIMEOUT, collect(responses))
                .await
                .unwrap();
            assert_eq!(String::from_utf8_lossy(&stdout).trim(), "hello");
            tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn stderr_is_tagged() {
        let (_inbound, responses, handle, _) =
            spawn_session(Cmd::new("sh", ["-c", "echo oops >&2"]));

        let (stdout, stderr) = tokio::time::timeout(TIMEOUT, collect(responses))
            .await
            .unwrap();
        assert!(stdout.is_empty());
        assert_eq!(String::from_utf8_lossy(&stderr).trim(), "oops");
        tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn output_written_just_before_exit_is_delivered() {
        let (_inbound, responses, handle, _) = spawn_session(Cmd::new(
            "sh",
            ["-c", "i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done"],
        ));

        let (stdout, _) = tokio::time::timeout(TIMEOUT, collect(responses))
            .await
            .unwrap();
        let stdout = String::from_utf8_lossy(&stdout);
        assert!(stdout.contains("line0"));
        assert!(stdout.contains("line199"));
        tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn stdin_frames_reach_the_process() {
        let (inbound, mut responses, handle, _) = spawn_session(Cmd::new("sh", ["-c", "read line; echo got:$line"]));

        inbound
            .send(Ok(ShellMsg::io(IoDataType::Stdin, b"ping\n".as_slice())))
            .await
            .unwrap();

        let seen = tokio::time::timeout(TIMEOUT, read_until(&mut responses, IoDataType::Stdout, "got:ping"))
            .await
            .unwrap();
        assert!(seen.contains("got:ping"));
        tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn failing_process_reports_exit_status() {
        let (_inbound, responses, handle, _) = spawn_session(Cmd::new("sh", ["-c", "exit 7"]));
        let _ = tokio::time::timeout(TIMEOUT, collect(responses)).await.unwrap();

        let err = tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap().unwrap_err();
        match err {
            Error::ProcessExit { status } => assert_eq!(status.code(), Some(7)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn resize_changes_terminal_size() {
        let (inbound, mut responses, handle, _) =
            spawn_session(Cmd::new("sh", ["-c", "read go; stty size"]));

        inbound.send(Ok(ShellMsg::resize(40, 120))).await.unwrap();
        inbound
            .send(Ok(ShellMsg::io(IoDataType::Stdin, b"go\n".as_slice())))
            .await
            .unwrap();

        let seen = tokio::time::timeout(TIMEOUT, read_until(&mut responses, IoDataType::Stdout, "40 120"))
            .await
            .unwrap();
        assert!(seen.contains("40 120"));
        tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn invalid_resize_is_reported_and_session_continues() {
        let (inbound, mut responses, handle, _) =
            spawn_session(Cmd::new("sh", ["-c", "read line; echo still:$line"]));

        inbound.send(Ok(ShellMsg::resize(-1, 80))).await.unwrap();
        let warning = tokio::time::timeout(TIMEOUT, read_until(&mut responses, IoDataType::Stderr, "\n"))
            .await
            .unwrap();
        assert!(warning.starts_with("resize terminal:"));

        inbound
            .send(Ok(ShellMsg::io(IoDataType::Stdin, b"here\n".as_slice())))
            .await
            .unwrap();
        let seen = tokio::time::timeout(TIMEOUT, read_until(&mut responses, IoDataType::Stdout, "still:here"))
            .await
            .unwrap();
        assert!(seen.contains("still:here"));
        tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn closing_the_client_stream_kills_the_process() {
        let (inbound, _responses, handle, pid) = spawn_session(Cmd::new("sleep", ["30"]));
        let pid = nix::unistd::Pid::from_raw(pid.unwrap() as i32);

        let started = std::time::Instant::now();
        drop(inbound);
        tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap().unwrap();
        assert!(started.elapsed() < OUTPUT_DRAIN_GRACE + Duration::from_secs(3));

        // The session waits for the child, so it is reaped by now.
        assert_eq!(
            nix::sys::signal::kill(pid, None),
            Err(nix::errno::Errno::ESRCH)
        );
    }

    #[tokio::test]
    async fn client_error_ends_the_session_with_that_error() {
        let (inbound, _responses, handle, _) = spawn_session(Cmd::new("sleep", ["30"]));
        inbound.send(Err(Status::aborted("client gone"))).await.unwrap();

        let err = tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap().unwrap_err();
        assert_eq!(err.code(), tonic::Code::Aborted);
    }
}
