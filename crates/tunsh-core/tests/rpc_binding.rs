//! Integration tests for serving and calling RPCs over the adapters.
//!
//! A small echo implementation of the shell service stands in for the real
//! one: it answers the command frame with the caller's address as seen
//! through the adapter, then echoes IO payloads back as stdout.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status, Streaming};

use tunsh_core::proto::shell_client::ShellClient;
use tunsh_core::proto::shell_server::{Shell, ShellServer};
use tunsh_core::proto::{Cmd, IoDataType, ShellMsg, ShellMsgType};
use tunsh_core::rpc::{self, ClientSecurity, ServerSecurity};
use tunsh_core::transport::{ConnInfo, Listener, MuxConfig, MuxDialer, MuxListener, QuicDialer, QuicListener};
use tunsh_test_utils::{TestPki, init_test_tracing, quic_pair, tls_pair};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

type ShellStream = Pin<Box<dyn Stream<Item = Result<ShellMsg, Status>> + Send>>;

struct EchoShell;

#[tonic::async_trait]
impl Shell for EchoShell {
    type ShellStream = ShellStream;

    async fn shell(
        &self,
        request: Request<Streaming<ShellMsg>>,
    ) -> Result<Response<Self::ShellStream>, Status> {
        let peer = request
            .extensions()
            .get::<ConnInfo>()
            .map(|info| info.remote_addr.to_string())
            .unwrap_or_default();
        let output = request.into_inner().map(move |msg| {
            let msg = msg?;
            Ok(match msg.r#type() {
                ShellMsgType::Command => ShellMsg::io(IoDataType::Stdout, peer.clone()),
                _ => ShellMsg::io(
                    IoDataType::Stdout,
                    msg.io_data().map(|io| io.data.clone()).unwrap_or_default(),
                ),
            })
        });
        Ok(Response::new(Box::pin(output)))
    }
}

fn router() -> tonic::transport::server::Router {
    Server::builder().add_service(ShellServer::new(EchoShell))
}

/// Run one call: command, then `payload`; returns the two stdout frames.
async fn call(channel: Channel, payload: &str) -> (String, String) {
    let (tx, rx) = mpsc::channel(4);
    tx.send(ShellMsg::command(Cmd::new("echo", Vec::<String>::new())))
        .await
        .unwrap();
    tx.send(ShellMsg::io(IoDataType::Stdin, payload)).await.unwrap();

    let mut client = ShellClient::new(channel);
    let mut responses = client
        .shell(ReceiverStream::new(rx))
        .await
        .unwrap()
        .into_inner();

    let mut frames = Vec::new();
    for _ in 0..2 {
        let msg = responses.message().await.unwrap().unwrap();
        let io = msg.io_data().unwrap();
        assert_eq!(io.r#type(), IoDataType::Stdout);
        frames.push(String::from_utf8(io.data.clone()).unwrap());
    }
    drop(tx);
    assert!(responses.message().await.unwrap().is_none());
    (frames.remove(0), frames.remove(0))
}

#[tokio::test]
async fn rpc_over_quic() {
    init_test_tracing();
    let pki = TestPki::generate().unwrap();
    let pair = quic_pair(&pki).await.unwrap();
    let listener = QuicListener::new(pair.server.clone(), pair.server_addr().unwrap());
    tokio::spawn(rpc::serve(listener, router(), ServerSecurity::Insecure));

    let dialer = QuicDialer::new(pair.client.clone(), pair.client_addr().unwrap());
    let channel = rpc::connect(dialer, ClientSecurity::insecure()).await.unwrap();

    let (peer, echoed) = timeout(TEST_TIMEOUT, call(channel, "ping")).await.unwrap();
    assert_eq!(peer, pair.client_addr().unwrap().to_string());
    assert_eq!(echoed, "ping");
}

#[tokio::test]
async fn rpc_over_quic_helper_channel() {
    let pki = TestPki::generate().unwrap();
    let pair = quic_pair(&pki).await.unwrap();
    let listener = QuicListener::new(pair.server.clone(), pair.server_addr().unwrap());
    tokio::spawn(rpc::serve(listener, router(), ServerSecurity::Insecure));

    let channel = rpc::quic_channel(pair.client.clone(), &pair.client_endpoint)
        .await
        .unwrap();
    let (_, echoed) = timeout(TEST_TIMEOUT, call(channel, "helper")).await.unwrap();
    assert_eq!(echoed, "helper");
}

#[tokio::test]
async fn rpc_over_mux_on_tls() {
    init_test_tracing();
    let pki = TestPki::generate().unwrap();
    let (server_tls, client_tls) = tls_pair(&pki).await.unwrap();
    let client_addr = client_tls.get_ref().0.local_addr().unwrap();

    let listener = MuxListener::new(server_tls, &MuxConfig::default()).unwrap();
    tokio::spawn(rpc::serve(listener, router(), ServerSecurity::Insecure));

    let (channel, _dialer) = rpc::mux_channel(client_tls, &MuxConfig::default())
        .await
        .unwrap();
    let (peer, echoed) = timeout(TEST_TIMEOUT, call(channel, "pong")).await.unwrap();
    assert_eq!(peer, client_addr.to_string());
    assert_eq!(echoed, "pong");
}

#[tokio::test]
async fn rpc_with_per_stream_tls() {
    let pki = TestPki::generate().unwrap();
    let (server_io, client_io) = tokio::io::duplex(256 * 1024);
    let listener = MuxListener::new(server_io, &MuxConfig::default()).unwrap();
    let server_security = ServerSecurity::Tls(Arc::new(pki.server_config().unwrap()));
    tokio::spawn(rpc::serve(listener, router(), server_security));

    let dialer = MuxDialer::new(client_io, &MuxConfig::default()).unwrap();
    let security = ClientSecurity::Tls {
        config: Arc::new(pki.client_config().unwrap()),
        server_name: pki.server_name().unwrap(),
    };
    let channel = rpc::connect(dialer, security).await.unwrap();
    let (_, echoed) = timeout(TEST_TIMEOUT, call(channel, "secret")).await.unwrap();
    assert_eq!(echoed, "secret");
}

#[tokio::test]
async fn lazy_channel_dials_on_first_call() {
    let (server_io, client_io) = tokio::io::duplex(256 * 1024);
    let listener = MuxListener::new(server_io, &MuxConfig::default()).unwrap();
    tokio::spawn(rpc::serve(listener, router(), ServerSecurity::Insecure));

    let dialer = MuxDialer::new(client_io, &MuxConfig::default()).unwrap();
    let channel = rpc::connect_lazy(dialer, ClientSecurity::insecure());
    let (_, echoed) = timeout(TEST_TIMEOUT, call(channel, "lazy")).await.unwrap();
    assert_eq!(echoed, "lazy");
}

#[tokio::test]
async fn serve_returns_when_listener_closes() {
    let pki = TestPki::generate().unwrap();
    let pair = quic_pair(&pki).await.unwrap();
    let listener = QuicListener::new(pair.server.clone(), pair.server_addr().unwrap());
    let handle = listener.clone();
    let server = tokio::spawn(rpc::serve(listener, router(), ServerSecurity::Insecure));

    handle.close();
    let result = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    assert!(result.is_ok(), "got {result:?}");
}

#[tokio::test]
async fn serve_with_shutdown_stops_on_signal() {
    let (server_io, _client_io) = tokio::io::duplex(1024);
    let listener = MuxListener::new(server_io, &MuxConfig::default()).unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(rpc::serve_with_shutdown(
        listener,
        router(),
        ServerSecurity::Insecure,
        async move {
            let _ = stop_rx.await;
        },
    ));

    stop_tx.send(()).unwrap();
    let result = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    assert!(result.is_ok(), "got {result:?}");
}

#[tokio::test]
async fn connect_fails_on_closed_session() {
    let (server_io, client_io) = tokio::io::duplex(1024);
    let listener = MuxListener::new(server_io, &MuxConfig::default()).unwrap();
    let dialer = MuxDialer::new(client_io, &MuxConfig::default()).unwrap();
    dialer.close();
    // Wait for the close to take effect on both ends.
    assert!(timeout(TEST_TIMEOUT, listener.accept()).await.unwrap().is_err());

    let result = timeout(TEST_TIMEOUT, rpc::connect(dialer, ClientSecurity::insecure()))
        .await
        .unwrap();
    assert!(result.is_err());
}
