//! tunsh server binary entry point.

use clap::Parser;
use tracing::{error, info, warn};

use tunsh_server::{Cli, ShellListener, shutdown_signal};

fn main() {
    let cli = Cli::parse();

    let log_format = cli.log_format.into();
    if let Err(e) = tunsh_core::init_logging(cli.verbose, cli.log_file.as_deref(), log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "tunsh-server starting");

    if !cli.has_tls_config() && !cli.self_signed {
        warn!("No TLS certificate configured. Use --cert/--key or --self-signed");
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("tunsh-server: failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(&cli)) {
        error!(error = %e, "Server failed");
        eprintln!("tunsh-server: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> tunsh_core::Result<()> {
    let config = cli.server_config()?;
    info!(
        addr = %config.bind_addr,
        transport = ?config.transport,
        default_command = %config.default_command,
        "Binding server"
    );

    let listener = ShellListener::bind(config).await?;
    listener.run_until(shutdown_signal()).await?;

    info!("Server stopped");
    Ok(())
}
