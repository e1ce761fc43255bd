//! Embedding failure taxonomy
//!
//! Errors are classified where they happen (socket I/O, frame parsing) so the
//! retry policy and the run summary never inspect message strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Category of an embedding failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmbeddingErrorKind {
    Timeout,
    SocketNotFound,
    SocketClosed,
    ConnectionRefused,
    ConnectionReset,
    BrokenPipe,
    JsonParse,
    InvalidResponse,
    ServerError,
    ServerOverload,
    Unknown,
}

impl EmbeddingErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::SocketNotFound => "SOCKET_NOT_FOUND",
            Self::SocketClosed => "SOCKET_CLOSED",
            Self::ConnectionRefused => "CONNECTION_REFUSED",
            Self::ConnectionReset => "CONNECTION_RESET",
            Self::BrokenPipe => "BROKEN_PIPE",
            Self::JsonParse => "JSON_PARSE",
            Self::InvalidResponse => "INVALID_RESPONSE",
            Self::ServerError => "SERVER_ERROR",
            Self::ServerOverload => "SERVER_OVERLOAD",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Map an I/O error kind from the socket layer.
    pub fn from_io(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => Self::SocketNotFound,
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Self::ConnectionReset
            }
            io::ErrorKind::BrokenPipe => Self::BrokenPipe,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::UnexpectedEof => Self::SocketClosed,
            _ => Self::Unknown,
        }
    }

    /// Failures that suggest a busy server get a wider retry backoff.
    pub fn widens_backoff(&self) -> bool {
        matches!(self, Self::Timeout | Self::ServerOverload)
    }
}

impl fmt::Display for EmbeddingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified embedding failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct EmbeddingError {
    pub kind: EmbeddingErrorKind,
    pub message: String,
}

impl EmbeddingError {
    pub fn new(kind: EmbeddingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(EmbeddingErrorKind::Timeout, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(EmbeddingErrorKind::SocketClosed, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(EmbeddingErrorKind::InvalidResponse, message)
    }
}

impl From<io::Error> for EmbeddingError {
    fn from(err: io::Error) -> Self {
        Self::new(EmbeddingErrorKind::from_io(err.kind()), err.to_string())
    }
}

impl From<serde_json::Error> for EmbeddingError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(EmbeddingErrorKind::JsonParse, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let cases = [
            (io::ErrorKind::NotFound, EmbeddingErrorKind::SocketNotFound),
            (
                io::ErrorKind::ConnectionRefused,
                EmbeddingErrorKind::ConnectionRefused,
            ),
            (
                io::ErrorKind::ConnectionReset,
                EmbeddingErrorKind::ConnectionReset,
            ),
            (io::ErrorKind::BrokenPipe, EmbeddingErrorKind::BrokenPipe),
            (io::ErrorKind::TimedOut, EmbeddingErrorKind::Timeout),
            (io::ErrorKind::UnexpectedEof, EmbeddingErrorKind::SocketClosed),
            (io::ErrorKind::Other, EmbeddingErrorKind::Unknown),
        ];
        for (io_kind, expected) in cases {
            let err: EmbeddingError = io::Error::new(io_kind, "boom").into();
            assert_eq!(err.kind, expected, "{io_kind:?}");
        }
    }

    #[test]
    fn test_json_errors_are_parse_failures() {
        let err: EmbeddingError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert_eq!(err.kind, EmbeddingErrorKind::JsonParse);
    }

    #[test]
    fn test_kind_serializes_as_taxonomy_name() {
        let json = serde_json::to_string(&EmbeddingErrorKind::ServerOverload).unwrap();
        assert_eq!(json, "\"SERVER_OVERLOAD\"");
        assert_eq!(EmbeddingErrorKind::ConnectionReset.as_str(), "CONNECTION_RESET");
    }

    #[test]
    fn test_backoff_widening() {
        assert!(EmbeddingErrorKind::Timeout.widens_backoff());
        assert!(EmbeddingErrorKind::ServerOverload.widens_backoff());
        assert!(!EmbeddingErrorKind::BrokenPipe.widens_backoff());
    }
}
