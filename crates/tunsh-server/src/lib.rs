//! tunsh-server: Server library for tunsh remote shells.
//!
//! Provides:
//! - PTY allocation and process launch with chroot and credential changes
//! - The `Shell` RPC service and its session state machine
//! - Accept loops for QUIC and TLS+yamux sessions

pub mod cli;
pub mod credentials;
pub mod launcher;
pub mod pty;
pub mod server;
pub mod service;
pub mod session;

pub use cli::Cli;
pub use launcher::{Launcher, ProcessHandle};
pub use server::{ServerConfig, ShellListener, Transport, shutdown_signal};
pub use service::ShellService;
