//! Descriptor accounting for sessions the client abandons mid-run.
//!
//! Kept in its own test binary: counting `/proc/self/fd` is only meaningful
//! while no other test in the process opens descriptors.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use tunsh_core::proto::Cmd;
use tunsh_server::Launcher;
use tunsh_server::session::ShellSession;

const TIMEOUT: Duration = Duration::from_secs(15);

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

/// Start `sleep 30`, close the client stream at once, wait for the session.
async fn abandoned_session(launcher: &Launcher) {
    let session = ShellSession::start(launcher, &Cmd::new("sleep", ["30"])).unwrap();
    let (inbound, inbound_rx) = mpsc::channel(4);
    let (outbound, _responses) = mpsc::channel(64);
    let run = tokio::spawn(session.run(ReceiverStream::new(inbound_rx), outbound));

    drop(inbound);
    tokio::time::timeout(TIMEOUT, run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn abandoned_sessions_release_pty_and_pipe_descriptors() {
    let launcher = Launcher::new("sh");

    // The first spawn sets up process-wide state such as the SIGCHLD pipe.
    abandoned_session(&launcher).await;
    let before = open_fds();

    for _ in 0..3 {
        abandoned_session(&launcher).await;
    }

    assert_eq!(open_fds(), before, "descriptors leaked across sessions");
}
