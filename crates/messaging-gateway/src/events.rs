//! State and event notification for observers of the gateway

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::message::{ConnectionId, SubscriptionId};

const EVENT_BUFFER: usize = 256;

/// Externally visible gateway state
///
/// `Idle → Connecting → Connected ⇄ Reconnecting → Closed`, with `Errored`
/// reachable from `Connecting`, `Connected` and `Reconnecting`, and `Closed`
/// reachable from anywhere through `disconnect`. Missed heartbeats pass
/// through `Errored` on the way from `Connected` to `Reconnecting`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum GatewayState {
    /// Never connected
    Idle,
    /// Initial handshake in progress
    Connecting,
    /// Link is up
    Connected,
    /// Link was lost; reconnect attempts are running
    Reconnecting,
    /// Closed by `disconnect`
    Closed,
    /// Connect failed, heartbeats went unanswered or reconnection was
    /// exhausted
    Errored,
}

/// State of the connection owned by the transport connector
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Not yet connected
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Link is up
    Connected,
    /// Link was lost; reconnect attempts are running
    Reconnecting,
    /// `disconnect` is flushing queued frames
    Closing,
    /// Closed
    Closed,
    /// Failure; terminal unless reconnection follows a heartbeat timeout
    Errored,
}

impl ConnectionState {
    /// Whether publishes are accepted in this state.
    #[must_use]
    pub const fn accepts_publish(self) -> bool {
        matches!(self, Self::Connected | Self::Reconnecting)
    }
}

/// Notifications for the layer driving the gateway
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Gateway state changed
    StateChanged {
        /// Previous state
        from: GatewayState,
        /// New state
        to: GatewayState,
    },
    /// A reconnect attempt is about to start
    ReconnectAttempt {
        /// Connection being restored
        connection_id: ConnectionId,
        /// 1-based attempt number
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// A reconnect attempt succeeded
    Reconnected {
        /// Restored connection
        connection_id: ConnectionId,
        /// Attempt that succeeded
        attempt: u32,
    },
    /// All reconnect attempts failed
    ReconnectFailed {
        /// Lost connection
        connection_id: ConnectionId,
        /// Attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },
    /// Heartbeats went unanswered
    HeartbeatTimeout {
        /// Affected connection
        connection_id: ConnectionId,
        /// Unanswered probes
        missed: u32,
    },
    /// A subscription was created
    SubscriptionAdded {
        /// Subscription
        id: SubscriptionId,
        /// Its pattern
        pattern: String,
    },
    /// A subscription was removed
    SubscriptionRemoved {
        /// Subscription
        id: SubscriptionId,
        /// Its pattern
        pattern: String,
    },
    /// The broker rejected a subscription; it has been closed
    SubscriptionFailed {
        /// Subscription
        id: SubscriptionId,
        /// Its pattern
        pattern: String,
        /// Broker message
        reason: String,
    },
    /// A handler failed, panicked or timed out
    DeliveryFailed {
        /// Subscription
        id: SubscriptionId,
        /// Subject of the message
        subject: String,
        /// What went wrong
        reason: String,
    },
}

/// Fans state changes and events out to observers
#[derive(Debug)]
pub(crate) struct Notifier {
    state: watch::Sender<GatewayState>,
    events: broadcast::Sender<GatewayEvent>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(GatewayState::Idle);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self { state, events }
    }

    pub(crate) fn state(&self) -> GatewayState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, to: GatewayState) {
        let from = self.state.send_replace(to);
        if from != to {
            debug!("Gateway state {:?} -> {:?}", from, to);
            self.emit(GatewayEvent::StateChanged { from, to });
        }
    }

    pub(crate) fn emit(&self, event: GatewayEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn watch(&self) -> watch::Receiver<GatewayState> {
        self.state.subscribe()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }
}
