//! Unified error types for rtsp-core

use std::fmt;
use std::io;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the connection core
#[derive(Debug)]
pub enum Error {
    /// I/O error during network operations
    Io(io::Error),
    /// Invalid configuration
    Config(String),
    /// Protocol violation reported by the RTSP layer
    Protocol(String),
    /// Interleaved channel id already registered on this connection
    ChannelInUse(u8),
    /// Connection was closed
    ConnectionClosed,
    /// Accepted socket speaks a protocol the server does not handle
    #[cfg(feature = "sctp")]
    UnknownProtocol(i32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::ChannelInUse(ch) => write!(f, "Interleaved channel {} already in use", ch),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            #[cfg(feature = "sctp")]
            Error::UnknownProtocol(proto) => write!(f, "Unknown socket protocol: {}", proto),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;
    use std::io;

    #[test]
    fn test_error_display() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        let err = Error::Io(io_err);
        assert!(err.to_string().contains("I/O error"));

        let err = Error::Config("timeout ratio".into());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("timeout ratio"));

        let err = Error::Protocol("bad request line".into());
        assert!(err.to_string().contains("Protocol error"));
        assert!(err.to_string().contains("bad request line"));

        let err = Error::ChannelInUse(2);
        assert!(err.to_string().contains("channel 2"));

        let err = Error::ConnectionClosed;
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_error_source() {
        // Only Io error should have a source
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err = Error::Io(io_err);
        assert!(StdError::source(&err).is_some());

        let err = Error::ConnectionClosed;
        assert!(StdError::source(&err).is_none());

        let err = Error::Config("x".into());
        assert!(StdError::source(&err).is_none());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
