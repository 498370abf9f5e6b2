//! Interactive session driver.
//!
//! Runs one `Shell` call: sends the command frame, keeps the remote window
//! size in sync with the local terminal, forwards local input and writes
//! remote output until the server ends the stream.

use std::os::fd::OwnedFd;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use tunsh_core::constants::{FRAME_CHANNEL_CAPACITY, RESIZE_DEBOUNCE};
use tunsh_core::error::{Error, Result};
use tunsh_core::proto::shell_client::ShellClient;
use tunsh_core::proto::{Cmd, IoDataType, ShellMsg};
use tunsh_core::shell::{FrameWriter, push_window_size, send_frame};

use crate::terminal::StdinReader;

/// End-of-file character of a canonical-mode terminal.
const EOF_CHAR: u8 = 0x04;

/// Run `cmd` remotely and pump its streams until the call ends.
///
/// `window` is the local terminal, when there is one. Its size is sent at
/// start and after every SIGWINCH. Without a terminal, local EOF is passed
/// on as an EOF character so the remote side sees end of input.
pub async fn attach<O, E>(
    channel: Channel,
    cmd: Cmd,
    input: StdinReader,
    stdout: &mut O,
    stderr: &mut E,
    window: Option<OwnedFd>,
) -> Result<()>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let (tx, rx) = mpsc::channel::<ShellMsg>(FRAME_CHANNEL_CAPACITY);
    send_frame(&tx, ShellMsg::command(cmd)).await?;

    let interactive = window.is_some();
    if let Some(fd) = &window
        && let Err(e) = push_window_size(&tx, fd).await
    {
        warn!(error = %e, "failed to read local window size");
    }

    let mut responses = ShellClient::new(channel)
        .shell(ReceiverStream::new(rx))
        .await?
        .into_inner();
    info!("shell session started");

    let mut tasks = JoinSet::new();
    if let Some(fd) = window {
        tasks.spawn(track_window(tx.clone(), fd));
    }
    tasks.spawn(forward_input(
        FrameWriter::new(tx.clone(), IoDataType::Stdin),
        input,
        interactive,
    ));

    let result = async {
        while let Some(msg) = responses.message().await? {
            let Some(io) = msg.io_data() else {
                debug!(kind = ?msg.r#type(), "ignoring non-io frame");
                continue;
            };
            match io.r#type() {
                IoDataType::Stdout => {
                    stdout.write_all(&io.data).await?;
                    stdout.flush().await?;
                }
                IoDataType::Stderr => {
                    stderr.write_all(&io.data).await?;
                    stderr.flush().await?;
                }
                other => debug!(kind = ?other, "ignoring io frame"),
            }
        }
        Ok::<(), Error>(())
    }
    .await;

    tasks.shutdown().await;
    drop(tx);
    info!(ok = result.is_ok(), "shell session ended");
    result
}

/// Forward local input as stdin frames.
///
/// The request stream stays open after local EOF: the server treats the end
/// of its inbound stream as the end of the session.
async fn forward_input(
    writer: FrameWriter<ShellMsg>,
    mut input: StdinReader,
    interactive: bool,
) {
    while let Some(data) = input.read().await {
        if writer.send(&data).await.is_err() {
            return;
        }
    }
    debug!("local input closed");
    if !interactive && writer.send(&[EOF_CHAR]).await.is_err() {
        return;
    }
    // Hold the sender until the session ends and this task is aborted.
    std::future::pending::<()>().await;
}

/// Push the local window size after each SIGWINCH, debounced.
async fn track_window(tx: mpsc::Sender<ShellMsg>, fd: OwnedFd) {
    let mut winch = match signal(SignalKind::window_change()) {
        Ok(winch) => winch,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGWINCH, resizes are not forwarded");
            return;
        }
    };

    while winch.recv().await.is_some() {
        tokio::time::sleep(RESIZE_DEBOUNCE).await;
        match push_window_size(&tx, &fd).await {
            Ok(()) => {}
            Err(e) if e.is_end_of_stream() => return,
            Err(e) => warn!(error = %e, "failed to push window size"),
        }
    }
}
