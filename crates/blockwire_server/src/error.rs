//! Error types for the socket driver.

use blockwire_protocol::{ProtocolError, RequestError};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while serving or linking.
#[derive(Error, Debug)]
pub enum ServerError {
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent bytes the protocol cannot parse, or a registration
    /// was invalid.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A request got no response.
    #[error("request failed: {0}")]
    Request(#[from] RequestError),
}

impl ServerError {
    /// Returns true if the peer broke the protocol.
    pub fn is_desync(&self) -> bool {
        matches!(self, ServerError::Protocol(e) if !e.is_registration())
    }

    /// Returns true if the connection went away under a request.
    pub fn is_collapsed(&self) -> bool {
        matches!(
            self,
            ServerError::Request(RequestError::Collapsed { .. } | RequestError::Closed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::from(ProtocolError::UnknownOpcode(3)).is_desync());
        assert!(!ServerError::from(ProtocolError::ReservedOpcode(0)).is_desync());
        assert!(ServerError::from(RequestError::collapsed("gone")).is_collapsed());
        assert!(!ServerError::from(std::io::Error::other("x")).is_collapsed());
    }

    #[test]
    fn error_display() {
        let err = ServerError::from(RequestError::collapsed("peer reset"));
        assert_eq!(
            err.to_string(),
            "request failed: connection collapsed: peer reset"
        );
    }
}
