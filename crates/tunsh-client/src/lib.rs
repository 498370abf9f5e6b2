//! tunsh-client: Client library for tunsh remote shells.
//!
//! Provides:
//! - Session establishment over QUIC or TLS+yamux
//! - Raw-mode terminal handling and a non-blocking stdin reader
//! - The interactive session driver

pub mod cli;
pub mod connect;
pub mod session;
pub mod terminal;

pub use cli::Cli;
pub use connect::{ClientSession, ConnectionConfig, Transport, connect};
pub use session::attach;
pub use terminal::{RawModeGuard, StdinReader};
