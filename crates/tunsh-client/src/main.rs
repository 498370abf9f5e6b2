//! tunsh client binary entry point.

use std::io::{self, IsTerminal};
use std::os::fd::AsFd;

use clap::Parser;
use tracing::{error, info, warn};

use tunsh_client::{Cli, ConnectionConfig, RawModeGuard, StdinReader, attach, connect};
use tunsh_core::transport::MuxConfig;

fn main() {
    let cli = Cli::parse();

    let log_format = cli.log_format.into();
    if let Err(e) = tunsh_core::init_logging(cli.verbose, cli.log_file.as_deref(), log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "tunsh client starting");

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("tunsh: failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = rt.block_on(run(&cli));
    // The stdin thread may be parked in a read; don't wait for it.
    rt.shutdown_background();

    if let Err(e) = result {
        error!(error = %e, "Session failed");
        eprintln!("tunsh: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> tunsh_core::Result<()> {
    let config = ConnectionConfig {
        server_addr: cli.server_addr()?,
        server_name: cli.server_name()?,
        transport: cli.transport.into(),
        tls: cli.client_tls_config()?,
        mux: MuxConfig::default(),
    };
    let (channel, session) = connect(config).await?;

    let stdin = io::stdin();
    let window = if stdin.is_terminal() {
        Some(stdin.as_fd().try_clone_to_owned()?)
    } else {
        None
    };
    // Restored on drop, before any error is printed.
    let _raw = match &window {
        Some(fd) => match RawModeGuard::enter_on(fd) {
            Ok(guard) => Some(guard),
            Err(e) => {
                warn!(error = %e, "failed to enter raw mode");
                None
            }
        },
        None => None,
    };

    let result = attach(
        channel,
        cli.shell_command(),
        StdinReader::spawn(),
        &mut tokio::io::stdout(),
        &mut tokio::io::stderr(),
        window,
    )
    .await;

    session.close().await;
    result
}
