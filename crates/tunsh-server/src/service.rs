//! tonic implementation of the `Shell` service.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use tunsh_core::constants::FRAME_CHANNEL_CAPACITY;
use tunsh_core::proto::ShellMsg;
use tunsh_core::proto::shell_server::{Shell, ShellServer};
use tunsh_core::transport::ConnInfo;

use crate::launcher::Launcher;
use crate::session::{ShellSession, await_command};

/// Serves one pty-backed process per `Shell` call.
#[derive(Debug, Clone)]
pub struct ShellService {
    launcher: Arc<Launcher>,
}

impl ShellService {
    /// `default_command` runs when a call names no executable.
    pub fn new(default_command: impl Into<String>) -> Self {
        Self {
            launcher: Arc::new(Launcher::new(default_command)),
        }
    }

    /// Wrap in the generated tonic server.
    pub fn into_server(self) -> ShellServer<Self> {
        ShellServer::new(self)
    }
}

#[tonic::async_trait]
impl Shell for ShellService {
    type ShellStream = ReceiverStream<Result<ShellMsg, Status>>;

    async fn shell(
        &self,
        request: Request<Streaming<ShellMsg>>,
    ) -> Result<Response<Self::ShellStream>, Status> {
        let peer = request.extensions().get::<ConnInfo>().copied();
        let mut inbound = request.into_inner();

        // Protocol and launch failures become the call's status.
        let cmd = await_command(&mut inbound).await.inspect_err(|e| {
            warn!(error = %e, ?peer, "rejecting shell call");
        })?;
        let session = ShellSession::start(&self.launcher, &cmd).inspect_err(|e| {
            warn!(error = %e, path = %cmd.path, ?peer, "launch failed");
        })?;

        info!(
            path = %cmd.path,
            pid = session.pid(),
            remote = ?peer.map(|p| p.remote_addr),
            "shell session started"
        );

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            if let Err(e) = session.run(inbound, tx.clone()).await {
                warn!(error = %e, "shell session failed");
                let _ = tx.send(Err(e.into())).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
