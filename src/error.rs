//! Error types for bridge operations.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur while talking to the command processor.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Outbound payload could not be serialized.
    #[error("Failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// Inbound frame could not be decoded.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Declared frame length is over the accepted ceiling.
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Peer closed the stream or the transport dropped mid-read.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Operation timed out before any byte of the frame was transferred.
    #[error("Operation timed out")]
    Timeout,

    /// Operation timed out part-way through a frame.
    #[error("Stream desynchronized after {transferred} bytes of a partial frame")]
    Desynchronized { transferred: usize },

    /// No live transport.
    #[error("Not connected")]
    NotConnected,

    /// Transport could not be established.
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Create a new malformed message error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    /// Create a new connection lost error.
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    /// Check if this error is a clean I/O timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Check if the peer can no longer be trusted to be in sync with us.
    ///
    /// Undecodable and oversized frames are treated the same as a closed
    /// stream: the only way forward is a fresh connection.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::MalformedMessage(_) | Self::PayloadTooLarge { .. }
        )
    }

    /// Check if this error is recoverable (a later retry may succeed).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Encode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::PayloadTooLarge {
            size: 200,
            max: 100,
        };
        assert_eq!(
            format!("{err}"),
            "Payload too large: 200 bytes exceeds maximum of 100 bytes"
        );

        let err = BridgeError::connection_lost("peer closed the connection");
        assert_eq!(format!("{err}"), "Connection lost: peer closed the connection");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "test");
        let err: BridgeError = io_err.into();
        assert!(matches!(err, BridgeError::Io(_)));
        assert!(!err.is_connection_loss());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_classification() {
        assert!(BridgeError::Timeout.is_timeout());
        assert!(BridgeError::malformed("bad json").is_connection_loss());
        assert!(BridgeError::PayloadTooLarge { size: 1, max: 0 }.is_connection_loss());
        assert!(!BridgeError::Desynchronized { transferred: 2 }.is_connection_loss());

        let encode = serde_json::from_str::<u8>("x").unwrap_err();
        assert!(!BridgeError::Encode(encode).is_recoverable());
        assert!(BridgeError::NotConnected.is_recoverable());
    }
}
