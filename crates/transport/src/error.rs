//! Error types for transports

use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The address could not be used to open a link
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The remote side actively refused the connection
    #[error("Connection refused: {0}")]
    Refused(String),

    /// The link could not be established or used in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// TLS negotiation or certificate validation failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// The server rejected the upgrade request with an authorization status
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The link is closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Create a timeout error
    pub fn timeout(context: impl Into<String>) -> Self {
        Self::Timeout(context.into())
    }

    /// Create an invalid address error
    pub fn invalid_address(context: impl Into<String>) -> Self {
        Self::InvalidAddress(context.into())
    }

    /// Whether the error means the link is gone for good.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}
