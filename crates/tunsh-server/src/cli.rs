//! Server CLI implementation.
//!
//! Provides command-line argument parsing for the tunsh server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use tracing::{info, warn};

use tunsh_core::constants::DEFAULT_PORT;
use tunsh_core::error::{Error, Result};
use tunsh_core::tls::{
    cert_hash, format_cert_hash, generate_self_signed_cert, load_certs_from_pem,
    load_key_from_pem, read_pem_file, root_store, server_config,
};
use tunsh_core::transport::MuxConfig;

use crate::launcher::find_default_shell;
use crate::server::{ServerConfig, Transport};

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for tunsh_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => tunsh_core::LogFormat::Text,
            CliLogFormat::Json => tunsh_core::LogFormat::Json,
        }
    }
}

/// Session transport for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliTransport {
    /// QUIC over UDP.
    #[default]
    Quic,
    /// TLS over TCP, multiplexed with yamux.
    Tls,
}

impl From<CliTransport> for Transport {
    fn from(transport: CliTransport) -> Self {
        match transport {
            CliTransport::Quic => Transport::Quic,
            CliTransport::Tls => Transport::Tls,
        }
    }
}

/// tunsh server - remote shells over QUIC or TLS.
#[derive(Debug, Parser)]
#[command(
    name = "tunsh-server",
    version,
    about = "tunsh server - remote shells over QUIC or TLS"
)]
pub struct Cli {
    /// Session transport
    #[arg(short = 't', long = "transport", default_value = "quic", env = "TUNSH_TRANSPORT")]
    pub transport: CliTransport,

    /// Address to listen on
    #[arg(short = 'b', long = "bind", default_value = "0.0.0.0", env = "TUNSH_BIND")]
    pub bind_addr: IpAddr,

    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_PORT, env = "TUNSH_PORT")]
    pub port: u16,

    /// TLS certificate file (PEM format)
    #[arg(short = 'c', long = "cert", value_name = "FILE", env = "TUNSH_CERT")]
    pub cert_file: Option<PathBuf>,

    /// TLS private key file (PEM format)
    #[arg(short = 'k', long = "key", value_name = "FILE", env = "TUNSH_KEY")]
    pub key_file: Option<PathBuf>,

    /// Require client certificates signed by this CA (PEM format)
    #[arg(long = "client-ca", value_name = "FILE", env = "TUNSH_CLIENT_CA")]
    pub client_ca: Option<PathBuf>,

    /// Generate a self-signed certificate if none provided
    #[arg(long = "self-signed")]
    pub self_signed: bool,

    /// Command run when a client names none (default: bash, else sh)
    #[arg(long = "shell", value_name = "PATH", env = "TUNSH_SHELL")]
    pub shell: Option<String>,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}

impl Cli {
    /// Get the socket address to bind to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Check if TLS credentials are provided.
    pub fn has_tls_config(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }

    /// Command for requests that name none.
    pub fn default_command(&self) -> Option<String> {
        match &self.shell {
            Some(shell) => Some(shell.clone()),
            None => find_default_shell().map(|path| path.to_string_lossy().into_owned()),
        }
    }

    /// Build the TLS config from the certificate options.
    pub fn server_tls_config(&self) -> Result<rustls::ServerConfig> {
        let (certs, key) = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => (
                load_certs_from_pem(&read_pem_file(cert)?)?,
                load_key_from_pem(&read_pem_file(key)?)?,
            ),
            (None, None) if self.self_signed => {
                let (cert, key) = generate_self_signed_cert(&["localhost"])?;
                info!(
                    sha256 = %format_cert_hash(&cert_hash(cert.as_ref())),
                    "generated self-signed certificate"
                );
                (vec![cert], key)
            }
            (None, None) => {
                return Err(Error::Tls {
                    message: "no certificate configured, use --cert/--key or --self-signed"
                        .to_string(),
                });
            }
            _ => {
                return Err(Error::Tls {
                    message: "--cert and --key must be given together".to_string(),
                });
            }
        };

        let client_roots = match &self.client_ca {
            Some(path) => Some(root_store(load_certs_from_pem(&read_pem_file(path)?)?)?),
            None => {
                warn!("no --client-ca given, clients are not authenticated");
                None
            }
        };

        server_config(certs, key, client_roots)
    }

    /// Full server configuration.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let default_command = self.default_command().ok_or_else(|| Error::NotFound {
            message: "no shell found in PATH, use --shell".to_string(),
        })?;

        Ok(ServerConfig {
            bind_addr: self.socket_addr(),
            transport: self.transport.into(),
            tls: self.server_tls_config()?,
            default_command,
            mux: MuxConfig::default(),
        })
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            transport: CliTransport::Quic,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            cert_file: None,
            key_file: None,
            client_ca: None,
            self_signed: false,
            shell: None,
            verbose: 0,
            log_file: None,
            log_format: CliLogFormat::Text,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn default_values() {
        let cli = Cli::try_parse_from(["tunsh-server"]).unwrap();
        assert_eq!(cli.transport, CliTransport::Quic);
        assert_eq!(cli.bind_addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(cli.port, DEFAULT_PORT);
        assert_eq!(cli.verbose, 0);
        assert!(!cli.self_signed);
        assert_eq!(cli.log_format, CliLogFormat::Text);
    }

    #[test]
    fn parse_bind_port_and_transport() {
        let cli = Cli::try_parse_from([
            "tunsh-server",
            "-t",
            "tls",
            "-b",
            "127.0.0.1",
            "-p",
            "8443",
        ])
        .unwrap();
        assert_eq!(Transport::from(cli.transport), Transport::Tls);
        assert_eq!(
            cli.socket_addr(),
            "127.0.0.1:8443".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn parse_tls_files() {
        let cli = Cli::try_parse_from([
            "tunsh-server",
            "-c",
            "/etc/tunsh/cert.pem",
            "-k",
            "/etc/tunsh/key.pem",
            "--client-ca",
            "/etc/tunsh/ca.pem",
        ])
        .unwrap();
        assert_eq!(cli.cert_file, Some(PathBuf::from("/etc/tunsh/cert.pem")));
        assert_eq!(cli.key_file, Some(PathBuf::from("/etc/tunsh/key.pem")));
        assert_eq!(cli.client_ca, Some(PathBuf::from("/etc/tunsh/ca.pem")));
        assert!(cli.has_tls_config());
    }

    #[test]
    fn parse_verbosity_and_log_format() {
        let cli = Cli::try_parse_from(["tunsh-server", "-vv", "--log-format", "json"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_format, CliLogFormat::Json);
    }

    #[test]
    fn explicit_shell_is_the_default_command() {
        let cli = Cli::try_parse_from(["tunsh-server", "--shell", "/bin/zsh"]).unwrap();
        assert_eq!(cli.default_command().as_deref(), Some("/bin/zsh"));
    }

    #[test]
    fn default_command_falls_back_to_path_shell() {
        let cli = Cli::default();
        let shell = cli.default_command().unwrap();
        assert!(shell.ends_with("bash") || shell.ends_with("sh"));
    }

    #[test]
    fn tls_config_requires_certificates() {
        let cli = Cli::default();
        assert!(matches!(cli.server_tls_config(), Err(Error::Tls { .. })));

        let cli = Cli {
            cert_file: Some(PathBuf::from("/nonexistent/cert.pem")),
            ..Cli::default()
        };
        assert!(matches!(cli.server_tls_config(), Err(Error::Tls { .. })));
    }

    #[test]
    fn self_signed_builds_a_config() {
        let cli = Cli {
            self_signed: true,
            ..Cli::default()
        };
        let config = cli.server_tls_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![tunsh_core::constants::ALPN.to_vec()]);
    }

    #[test]
    fn pem_files_build_a_config() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = write_temp(&certified.cert.pem());
        let key = write_temp(&certified.key_pair.serialize_pem());
        let ca = write_temp(&certified.cert.pem());

        let cli = Cli {
            cert_file: Some(cert.path().to_path_buf()),
            key_file: Some(key.path().to_path_buf()),
            client_ca: Some(ca.path().to_path_buf()),
            ..Cli::default()
        };
        assert!(cli.server_tls_config().is_ok());
    }

    #[test]
    fn missing_pem_file_is_reported_with_its_path() {
        let cli = Cli {
            cert_file: Some(PathBuf::from("/nonexistent/cert.pem")),
            key_file: Some(PathBuf::from("/nonexistent/key.pem")),
            ..Cli::default()
        };
        let err = cli.server_tls_config().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }
}
