//! Client CLI implementation.
//!
//! Provides command-line argument parsing for the tunsh client.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use rustls::pki_types::ServerName;

use tunsh_core::constants::DEFAULT_PORT;
use tunsh_core::error::{Error, Result};
use tunsh_core::proto::{Cmd, SysProcAttrLinux};
use tunsh_core::tls::{
    ClientIdentity, ServerTrust, client_config, load_certs_from_pem, load_key_from_pem,
    parse_cert_hash, read_pem_file, root_store,
};

use crate::connect::Transport;

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

/// tunsh - interactive remote shells over QUIC or TLS.
#[derive(Debug, Parser)]
#[command(
    name = "tunsh",
    version,
    about = "tunsh - interactive remote shells over QUIC or TLS"
)]
pub struct Cli {
    /// Server to connect to
    #[arg(value_name = "HOST[:PORT]")]
    pub destination: String,

    /// Command to run remotely (default: the server's shell)
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,

    /// Port used when the destination names none
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Session transport
    #[arg(short = 't', long = "transport", default_value = "quic", env = "TUNSH_TRANSPORT")]
    pub transport: CliTransport,

    /// Name to verify the server certificate against (default: the host)
    #[arg(long = "server-name", value_name = "NAME")]
    pub server_name: Option<String>,

    /// Verify the server against this CA (PEM format)
    #[arg(long = "ca", value_name = "FILE", env = "TUNSH_CA", group = "trust")]
    pub ca_file: Option<PathBuf>,

    /// Accept only a server certificate with this SHA-256 fingerprint
    #[arg(long = "pin-sha256", value_name = "HEX", group = "trust")]
    pub pin_sha256: Option<String>,

    /// Skip server certificate verification
    #[arg(long = "insecure", group = "trust")]
    pub insecure: bool,

    /// Client certificate file (PEM format)
    #[arg(short = 'c', long = "cert", value_name = "FILE", env = "TUNSH_CERT")]
    pub cert_file: Option<PathBuf>,

    /// Client private key file (PEM format)
    #[arg(short = 'k', long = "key", value_name = "FILE", env = "TUNSH_KEY")]
    pub key_file: Option<PathBuf>,

    /// Directory the remote process is confined to
    #[arg(long = "chroot", value_name = "DIR")]
    pub chroot: Option<String>,

    /// Numeric user the remote process runs as
    #[arg(long = "uid")]
    pub uid: Option<u32>,

    /// Numeric group the remote process runs as
    #[arg(long = "gid")]
    pub gid: Option<u32>,

    /// User name the remote process runs as
    #[arg(short = 'u', long = "user", value_name = "NAME")]
    pub user: Option<String>,

    /// Group name the remote process runs as
    #[arg(short = 'g', long = "group", value_name = "NAME")]
    pub group: Option<String>,

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
    /// Split the destination into host and port.
    ///
    /// Accepts `host`, `host:port`, `[v6]:port` and a bare IPv6 address.
    pub fn host_and_port(&self) -> (String, u16) {
        let dest = self.destination.as_str();
        if let Ok(addr) = dest.parse::<SocketAddr>() {
            return (addr.ip().to_string(), addr.port());
        }
        if let Some((host, port)) = dest.rsplit_once(':')
            && !host.contains(':')
            && let Ok(port) = port.parse::<u16>()
        {
            return (host.to_string(), port);
        }
        let host = dest.trim_start_matches('[').trim_end_matches(']');
        (host.to_string(), self.port)
    }

    /// Resolve the destination to a socket address.
    pub fn server_addr(&self) -> Result<SocketAddr> {
        let (host, port) = self.host_and_port();
        (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| Error::Transport {
                message: format!("failed to resolve {host}: {e}"),
            })?
            .next()
            .ok_or_else(|| Error::Transport {
                message: format!("no addresses found for {host}"),
            })
    }

    /// Name the server certificate is checked against.
    pub fn server_name(&self) -> Result<ServerName<'static>> {
        let name = match &self.server_name {
            Some(name) => name.clone(),
            None => self.host_and_port().0,
        };
        ServerName::try_from(name.clone()).map_err(|e| Error::Tls {
            message: format!("invalid server name {name:?}: {e}"),
        })
    }

    /// How the server certificate is trusted.
    pub fn server_trust(&self) -> Result<ServerTrust> {
        if let Some(path) = &self.ca_file {
            return Ok(ServerTrust::Roots(root_store(load_certs_from_pem(
                &read_pem_file(path)?,
            )?)?));
        }
        if let Some(hex) = &self.pin_sha256 {
            return Ok(ServerTrust::Pinned(Some(parse_cert_hash(hex)?)));
        }
        if self.insecure {
            return Ok(ServerTrust::Pinned(None));
        }
        Err(Error::Tls {
            message: "no server verification configured, use --ca, --pin-sha256 or --insecure"
                .to_string(),
        })
    }

    /// Client certificate and key, when configured.
    pub fn client_identity(&self) -> Result<Option<ClientIdentity>> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Ok(Some((
                load_certs_from_pem(&read_pem_file(cert)?)?,
                load_key_from_pem(&read_pem_file(key)?)?,
            ))),
            (None, None) => Ok(None),
            _ => Err(Error::Tls {
                message: "--cert and --key must be given together".to_string(),
            }),
        }
    }

    /// Build the TLS config from the trust and identity options.
    pub fn client_tls_config(&self) -> Result<rustls::ClientConfig> {
        client_config(self.server_trust()?, self.client_identity()?)
    }

    /// Launch attributes, `None` when no option asks for any.
    pub fn launch_attrs(&self) -> Option<SysProcAttrLinux> {
        if self.chroot.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.user.is_none()
            && self.group.is_none()
        {
            return None;
        }
        Some(SysProcAttrLinux {
            chroot: self.chroot.clone().unwrap_or_default(),
            uid: self.uid.unwrap_or_default(),
            gid: self.gid.unwrap_or_default(),
            username: self.user.clone().unwrap_or_default(),
            groupname: self.group.clone().unwrap_or_default(),
        })
    }

    /// The command frame payload. An empty path asks for the server's shell.
    pub fn shell_command(&self) -> Cmd {
        let (path, args) = match self.command.split_first() {
            Some((path, args)) => (path.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        Cmd {
            linux: self.launch_attrs(),
            ..Cmd::new(path, args)
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
    use tunsh_core::tls::{cert_hash, format_cert_hash, generate_self_signed_cert};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("tunsh").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn destination_is_required() {
        assert!(Cli::try_parse_from(["tunsh"]).is_err());
    }

    #[test]
    fn default_values() {
        let cli = parse(&["example.com"]);
        assert_eq!(cli.transport, CliTransport::Quic);
        assert_eq!(cli.port, DEFAULT_PORT);
        assert!(cli.command.is_empty());
        assert_eq!(cli.log_format, CliLogFormat::Text);
        assert!(cli.launch_attrs().is_none());
    }

    #[test]
    fn host_and_port_forms() {
        assert_eq!(
            parse(&["example.com"]).host_and_port(),
            ("example.com".to_string(), DEFAULT_PORT)
        );
        assert_eq!(
            parse(&["example.com:8443"]).host_and_port(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            parse(&["-p", "9000", "example.com"]).host_and_port(),
            ("example.com".to_string(), 9000)
        );
        assert_eq!(
            parse(&["[::1]:7000"]).host_and_port(),
            ("::1".to_string(), 7000)
        );
        assert_eq!(parse(&["::1"]).host_and_port(), ("::1".to_string(), DEFAULT_PORT));
    }

    #[test]
    fn server_addr_resolves_literal_addresses() {
        let cli = parse(&["127.0.0.1:5000"]);
        assert_eq!(
            cli.server_addr().unwrap(),
            "127.0.0.1:5000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn server_name_defaults_to_host() {
        let cli = parse(&["shell.example.com:8443"]);
        assert_eq!(
            cli.server_name().unwrap(),
            ServerName::try_from("shell.example.com").unwrap()
        );

        let cli = parse(&["--server-name", "localhost", "127.0.0.1"]);
        assert_eq!(
            cli.server_name().unwrap(),
            ServerName::try_from("localhost").unwrap()
        );
    }

    #[test]
    fn trailing_command_keeps_hyphenated_args() {
        let cli = parse(&["host", "ls", "-la", "/tmp"]);
        let cmd = cli.shell_command();
        assert_eq!(cmd.path, "ls");
        assert_eq!(cmd.args, vec!["-la", "/tmp"]);
        assert!(cmd.linux.is_none());
    }

    #[test]
    fn no_command_asks_for_the_default_shell() {
        let cmd = parse(&["host"]).shell_command();
        assert!(cmd.path.is_empty());
        assert!(cmd.args.is_empty());
    }

    #[test]
    fn launch_attrs_are_sent_when_requested() {
        let cli = parse(&["--chroot", "/srv/jail", "-u", "alice", "-g", "staff", "host", "sh"]);
        let linux = cli.shell_command().linux.unwrap();
        assert_eq!(linux.chroot, "/srv/jail");
        assert_eq!(linux.username, "alice");
        assert_eq!(linux.groupname, "staff");
        assert_eq!(linux.uid, 0);
        assert_eq!(linux.gid, 0);

        let linux = parse(&["--uid", "1000", "--gid", "100", "host"])
            .launch_attrs()
            .unwrap();
        assert_eq!((linux.uid, linux.gid), (1000, 100));
    }

    #[test]
    fn trust_options_conflict() {
        assert!(Cli::try_parse_from(["tunsh", "--insecure", "--pin-sha256", "aa", "host"]).is_err());
        assert!(Cli::try_parse_from(["tunsh", "--ca", "ca.pem", "--insecure", "host"]).is_err());
    }

    #[test]
    fn trust_is_required() {
        let cli = parse(&["host"]);
        assert!(matches!(cli.server_trust(), Err(Error::Tls { .. })));
    }

    #[test]
    fn insecure_and_pinned_trust() {
        let cli = parse(&["--insecure", "host"]);
        assert!(matches!(cli.server_trust().unwrap(), ServerTrust::Pinned(None)));

        let (cert, _) = generate_self_signed_cert(&["localhost"]).unwrap();
        let hash = cert_hash(cert.as_ref());
        let cli = parse(&["--pin-sha256", &format_cert_hash(&hash), "host"]);
        match cli.server_trust().unwrap() {
            ServerTrust::Pinned(Some(pinned)) => assert_eq!(pinned, hash),
            other => panic!("unexpected trust {other:?}"),
        }
        assert!(cli.client_tls_config().is_ok());
    }

    #[test]
    fn bad_pin_is_rejected() {
        let cli = parse(&["--pin-sha256", "not-hex", "host"]);
        assert!(cli.server_trust().is_err());
    }

    #[test]
    fn missing_ca_file_is_reported_with_its_path() {
        let cli = parse(&["--ca", "/nonexistent/ca.pem", "host"]);
        let err = cli.server_trust().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn identity_needs_both_files() {
        let cli = parse(&["--insecure", "-c", "/tmp/cert.pem", "host"]);
        assert!(matches!(cli.client_identity(), Err(Error::Tls { .. })));
        assert!(parse(&["host"]).client_identity().unwrap().is_none());
    }
}
