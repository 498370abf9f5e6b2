//! Error types for tunsh-core.

use std::process::ExitStatus;

use thiserror::Error;
use tonic::{Code, Status};

/// Main error type for tunsh operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation or malformed message.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Executable or other named resource could not be resolved.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// PTY error.
    #[error("pty error: {message}")]
    Pty { message: String },

    /// Transport layer error.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The underlying session ended; no further streams can be exchanged.
    #[error("session closed: {reason}")]
    SessionClosed { reason: String },

    /// Operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// TLS configuration or handshake error.
    #[error("tls error: {message}")]
    Tls { message: String },

    /// Child process exited unsuccessfully.
    #[error("process exited: {status}")]
    ProcessExit { status: ExitStatus },

    /// RPC transport failure.
    #[error("rpc transport error: {0}")]
    Rpc(#[from] tonic::transport::Error),

    /// RPC call failed with a status.
    #[error("rpc status: {0}")]
    Status(#[from] Status),
}

impl Error {
    /// Returns true if this error only signals that a stream ended.
    ///
    /// Sessions treat these as a clean shutdown rather than a failure.
    pub fn is_end_of_stream(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            Error::SessionClosed { .. } => true,
            _ => false,
        }
    }

    /// RPC status code reported to the caller for this error.
    pub fn code(&self) -> Code {
        match self {
            Error::Protocol { .. } => Code::InvalidArgument,
            Error::NotFound { .. } => Code::NotFound,
            Error::Cancelled => Code::Cancelled,
            Error::SessionClosed { .. } | Error::Transport { .. } | Error::Rpc(_) => {
                Code::Unavailable
            }
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => Code::NotFound,
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Code::PermissionDenied
            }
            Error::Status(status) => status.code(),
            Error::Io(_) | Error::Pty { .. } | Error::Tls { .. } | Error::ProcessExit { .. } => {
                Code::Internal
            }
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Status(status) => status,
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

/// Convenience result type for tunsh operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_protocol() {
        let err = Error::Protocol {
            message: "unexpected message type: Io".into(),
        };
        assert_eq!(err.to_string(), "protocol error: unexpected message type: Io");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            Error::Protocol { message: "bad".into() }.code(),
            Code::InvalidArgument
        );
        assert_eq!(
            Error::NotFound { message: "zsh".into() }.code(),
            Code::NotFound
        );
        assert_eq!(Error::Cancelled.code(), Code::Cancelled);
        assert_eq!(
            Error::SessionClosed { reason: "gone".into() }.code(),
            Code::Unavailable
        );
    }

    #[test]
    fn status_passes_through_unchanged() {
        let status: Status = Error::Status(Status::aborted("stop")).into();
        assert_eq!(status.code(), Code::Aborted);
        assert_eq!(status.message(), "stop");
    }

    #[test]
    fn status_carries_display_message() {
        let status: Status = Error::NotFound {
            message: "executable \"nope\"".into(),
        }
        .into();
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("nope"));
    }

    #[test]
    fn end_of_stream_errors() {
        assert!(Error::Io(std::io::ErrorKind::UnexpectedEof.into()).is_end_of_stream());
        assert!(Error::SessionClosed { reason: "eof".into() }.is_end_of_stream());

        assert!(!Error::Io(std::io::ErrorKind::BrokenPipe.into()).is_end_of_stream());
        assert!(!Error::Cancelled.is_end_of_stream());
        assert!(!Error::Protocol { message: "bad".into() }.is_end_of_stream());
    }
}
