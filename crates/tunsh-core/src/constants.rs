//! Protocol and configuration constants for tunsh.

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// ALPN identifier for QUIC and TLS connections.
pub const ALPN: &[u8] = b"tunsh/1";

/// Placeholder target for RPC channels. The dialer ignores it.
pub const RPC_PLACEHOLDER_URI: &str = "http://127.0.0.1";

/// Application error code used when a QUIC listener closes its connection.
pub const SERVER_CLOSE_CODE: u32 = 0;

/// Reason phrase sent alongside [`SERVER_CLOSE_CODE`].
pub const SERVER_CLOSE_REASON: &[u8] = b"server close";

/// Default server port for both QUIC and TLS transports.
pub const DEFAULT_PORT: u16 = 4433;

// =============================================================================
// Multiplexer Constants
// =============================================================================

/// Maximum concurrent logical streams per yamux session.
pub const MUX_MAX_STREAMS: usize = 512;

/// Largest single data frame a yamux stream writes.
pub const MUX_SPLIT_SEND_SIZE: usize = 16 * 1024;

// =============================================================================
// Terminal Constants
// =============================================================================

/// Initial pseudo-terminal rows.
pub const DEFAULT_TERMINAL_ROWS: u16 = 24;

/// Initial pseudo-terminal columns.
pub const DEFAULT_TERMINAL_COLS: u16 = 80;

/// Shells tried, in order, when no default command is configured.
pub const DEFAULT_SHELLS: &[&str] = &["bash", "sh"];

/// Buffered frames between a session and its RPC stream.
pub const FRAME_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Timing Constants
// =============================================================================

/// Timeout for establishing a logical RPC connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on waiting for buffered output after the process exits.
pub const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Debounce applied to local window-change signals.
pub const RESIZE_DEBOUNCE: Duration = Duration::from_millis(100);

/// QUIC idle timeout.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// QUIC keep-alive interval.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
