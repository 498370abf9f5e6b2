//! tunsh-core: Shared library for tunsh transports, RPC binding and wire types.
//!
//! This crate provides:
//! - Adapters that present QUIC streams and yamux sessions as a
//!   listener/dialer pair of ordinary duplex connections
//! - Binding of those adapters to a tonic server and channel
//! - The shell wire schema and frame helpers shared by client and server
//! - TLS configuration helpers
//! - Logging setup

pub mod constants;
pub mod error;
pub mod logging;
pub mod proto;
pub mod rpc;
pub mod shell;
pub mod tls;
pub mod transport;

pub use error::{Error, Result};
pub use logging::{LogFormat, init_logging};
