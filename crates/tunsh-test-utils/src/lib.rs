//! tunsh-test-utils: Test infrastructure for tunsh.
//!
//! Provides:
//! - TestPki: a throwaway CA with server and client certificates
//! - Loopback QUIC connections and TLS-over-TCP streams on 127.0.0.1
//! - A once-only tracing subscriber for tests

mod loopback;
mod pki;

pub use loopback::{QuicPair, quic_pair, quic_pair_with, tls_pair};
pub use pki::TestPki;

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test-writer tracing subscriber honoring `RUST_LOG`.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
