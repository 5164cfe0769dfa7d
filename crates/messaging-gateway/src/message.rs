//! Messages, identifiers and publish options

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

/// Identifies one logical connection; survives reconnects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Prefix of reply subjects owned by this connection.
    pub(crate) fn inbox_prefix(&self) -> String {
        format!("_INBOX.{}", self.0.simple())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a subscription within its connection
///
/// This is the `sid` used on the wire. Identifiers are never reused within a
/// connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// sid of the connection's reply inbox
    pub(crate) const INBOX: Self = Self(0);

    pub(crate) const fn new(sid: u64) -> Self {
        Self(sid)
    }

    /// The wire `sid`.
    #[must_use]
    pub const fn sid(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A delivered message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Concrete subject the message was published to
    pub subject: String,
    /// Opaque body
    pub payload: Bytes,
    /// Reply subject, if the publisher expects an answer
    pub reply_to: Option<String>,
    /// Per-subscription delivery sequence (1-based)
    pub sequence: Option<u64>,
}

impl Message {
    /// Payload as UTF-8 text, if it is valid.
    #[must_use]
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Lifecycle of a subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SubscriptionState {
    /// Receiving deliveries
    Active,
    /// Connection is closing; queued frames are being flushed
    Draining,
    /// No further deliveries
    Closed,
}

/// Read-only view of a subscription
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    /// Identifier
    pub id: SubscriptionId,
    /// Subject pattern
    pub pattern: String,
    /// Current state
    pub state: SubscriptionState,
    /// Successful handler invocations
    pub delivered: u64,
    /// Failed, panicked or timed out handler invocations
    pub failed: u64,
}

/// Options for a single publish
#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    /// Reply subject to attach
    pub reply_to: Option<String>,
    /// Wait this long for a reply on a connection-owned inbox subject
    pub await_reply: Option<Duration>,
}

impl PublishOptions {
    /// Attach a reply subject.
    #[must_use]
    pub fn reply_to(subject: impl Into<String>) -> Self {
        Self {
            reply_to: Some(subject.into()),
            await_reply: None,
        }
    }

    /// Turn the publish into a request waiting up to `timeout` for a reply.
    #[must_use]
    pub const fn request(timeout: Duration) -> Self {
        Self {
            reply_to: None,
            await_reply: Some(timeout),
        }
    }
}

/// Result of a publish
#[derive(Clone, Debug)]
pub struct PublishReceipt {
    /// Connection the message went out on
    pub connection_id: ConnectionId,
    /// Per-connection publish sequence (1-based)
    pub sequence: u64,
    /// Destination subject
    pub subject: String,
    /// Payload size in bytes
    pub payload_len: usize,
    /// Reply, when the publish was a request
    pub reply: Option<Message>,
}
