//! Connection manager errors

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::transport::TransportError;

/// Errors surfaced to the host application
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// A connect was requested while another connection is in progress or open
    #[error("Connection manager busy ({0})")]
    Busy(ConnectionState),

    /// Operation requires an open connection
    #[error("No connection is open")]
    NotConnected,

    /// The open attempt did not yield a handle
    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: TransportError,
    },

    /// The connect attempt was torn down before it became ready
    #[error("Connect cancelled by disconnect")]
    Cancelled,

    /// The send was discarded by overflow trimming or teardown
    #[error("Send dropped before transmission")]
    Dropped,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type LinkResult<T> = Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_failed_keeps_source() {
        let err = LinkError::OpenFailed {
            path: "COM-TEST".to_string(),
            source: TransportError::ConnectionFailed("busy".to_string()),
        };

        assert_eq!(
            err.to_string(),
            "Failed to open COM-TEST: Connection failed: busy"
        );
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Connection failed: busy"));
    }

    #[test]
    fn test_transport_error_conversion() {
        let err: LinkError = TransportError::NotConnected.into();
        assert_eq!(err, LinkError::Transport(TransportError::NotConnected));
    }
}
