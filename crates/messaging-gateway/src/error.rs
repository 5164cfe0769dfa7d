//! Error types for the messaging gateway

use std::time::Duration;

use proven_transport::subject::SubjectError;
use proven_transport::{EndpointError, TransportError};
use thiserror::Error;

/// Gateway operation errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Endpoint URL failed validation
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(#[from] EndpointError),

    /// Credentials are inconsistent
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Subject is not a valid concrete subject
    #[error("Invalid subject '{subject}': {reason}")]
    InvalidSubject {
        /// The offending subject
        subject: String,
        /// Why it was rejected
        reason: SubjectError,
    },

    /// Pattern is not a valid subscription pattern
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern
        pattern: String,
        /// Why it was rejected
        reason: SubjectError,
    },

    /// Payload exceeds the broker's advertised limit
    #[error("Payload of {size} bytes exceeds broker limit of {max} bytes")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Broker limit
        max: usize,
    },

    /// An identical pattern is already subscribed on this connection
    #[error("Pattern '{0}' is already subscribed")]
    DuplicatePattern(String),

    /// No usable connection
    #[error("Not connected")]
    NotConnected,

    /// The broker refused the connection
    #[error("Connection refused: {0}")]
    Refused(String),

    /// Handshake or request did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Backpressure wait exceeded the publish timeout
    #[error("Publish timed out after {0:?} waiting for outbound capacity")]
    PublishTimeout(Duration),

    /// The broker rejected the credentials
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// TLS negotiation failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Outbound buffer is full and the gateway is configured to fail fast
    #[error("Outbound buffer is full")]
    Overloaded,

    /// The operation was cancelled by `disconnect`
    #[error("Operation cancelled")]
    Cancelled,

    /// Anything else
    #[error("Connection failed: {0}")]
    Unknown(String),
}

impl GatewayError {
    /// Whether this is a caller input error that retrying cannot fix.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidEndpoint(_)
                | Self::InvalidCredentials(_)
                | Self::InvalidSubject { .. }
                | Self::InvalidPattern { .. }
                | Self::PayloadTooLarge { .. }
                | Self::DuplicatePattern(_)
        )
    }

    /// A message suitable for showing to an end user.
    #[must_use]
    pub fn friendly_message(&self) -> String {
        match self {
            Self::Refused(_) => "Connection refused: the broker refused the connection. \
                 Check that it is running and reachable at the given URL."
                .to_string(),
            Self::Timeout(_) => "Connection timeout: the broker did not answer in time. \
                 Check your network and the server URL."
                .to_string(),
            Self::AuthRejected(_) => "Authentication failed: the broker rejected the \
                 credentials or token."
                .to_string(),
            Self::Tls(_) => "SSL/TLS error: the server certificate could not be validated. \
                 It may be self-signed or issued for another host."
                .to_string(),
            Self::Unknown(detail) => format!("Connection failed: {detail}"),
            other => other.to_string(),
        }
    }

    pub(crate) fn invalid_subject(subject: &str, reason: SubjectError) -> Self {
        Self::InvalidSubject {
            subject: subject.to_string(),
            reason,
        }
    }

    pub(crate) fn invalid_pattern(pattern: &str, reason: SubjectError) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        }
    }

    /// Classify a `-ERR` received while establishing a connection.
    pub(crate) fn from_server_error(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("authorization") || lower.contains("authentication") {
            Self::AuthRejected(message.to_string())
        } else {
            Self::Unknown(format!("server rejected connection: {message}"))
        }
    }
}

impl From<TransportError> for GatewayError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Refused(detail) => Self::Refused(detail),
            TransportError::Timeout(detail) => Self::Timeout(detail),
            TransportError::Tls(detail) => Self::Tls(detail),
            TransportError::Unauthorized(detail) => Self::AuthRejected(detail),
            TransportError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => Self::Refused(e.to_string()),
                std::io::ErrorKind::TimedOut => Self::Timeout(e.to_string()),
                _ => Self::Unknown(e.to_string()),
            },
            TransportError::ConnectionClosed => {
                Self::Unknown("connection closed by the server".to_string())
            }
            TransportError::InvalidAddress(detail) | TransportError::Other(detail) => {
                let lower = detail.to_ascii_lowercase();
                if lower.contains("certificate") || lower.contains("ssl") || lower.contains("tls") {
                    Self::Tls(detail)
                } else {
                    Self::Unknown(detail)
                }
            }
        }
    }
}

/// Result type alias
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_classified() {
        assert!(matches!(
            GatewayError::from(TransportError::Refused("nope".to_string())),
            GatewayError::Refused(_)
        ));
        assert!(matches!(
            GatewayError::from(TransportError::Unauthorized("401".to_string())),
            GatewayError::AuthRejected(_)
        ));
        assert!(matches!(
            GatewayError::from(TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::TimedOut
            ))),
            GatewayError::Timeout(_)
        ));
        assert!(matches!(
            GatewayError::from(TransportError::Other(
                "invalid peer certificate: UnknownIssuer".to_string()
            )),
            GatewayError::Tls(_)
        ));
        assert!(matches!(
            GatewayError::from(TransportError::Other("boom".to_string())),
            GatewayError::Unknown(_)
        ));
    }

    #[test]
    fn test_server_errors_are_classified() {
        assert!(matches!(
            GatewayError::from_server_error("Authorization Violation"),
            GatewayError::AuthRejected(_)
        ));
        assert!(matches!(
            GatewayError::from_server_error("Maximum Connections Exceeded"),
            GatewayError::Unknown(_)
        ));
    }

    #[test]
    fn test_friendly_messages_keep_detail_for_unknown() {
        let error = GatewayError::Unknown("socket reset".to_string());
        assert!(error.friendly_message().contains("socket reset"));

        let refused = GatewayError::Refused("ECONNREFUSED".to_string());
        assert!(refused.friendly_message().starts_with("Connection refused"));
    }

    #[test]
    fn test_validation_errors() {
        assert!(GatewayError::DuplicatePattern("a".to_string()).is_validation());
        assert!(GatewayError::invalid_subject("a.*", SubjectError::Wildcard).is_validation());
        assert!(!GatewayError::NotConnected.is_validation());
        assert!(!GatewayError::Cancelled.is_validation());
    }
}
