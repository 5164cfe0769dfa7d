//! Gateway facade

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use proven_transport::{Endpoint, Transport};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::{ConnectionOptions, GatewayConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{ConnectionState, GatewayEvent, GatewayState, Notifier};
use crate::handler::MessageHandler;
use crate::message::{ConnectionId, PublishOptions, PublishReceipt, SubscriptionId, SubscriptionInfo};
use crate::session::{ConnectionSnapshot, Session};

/// Payload published by [`Gateway::create_topic`]
pub const TOPIC_CREATED_PAYLOAD: &str = "Topic created";

/// Read-only view of the whole gateway
#[derive(Clone, Debug, Serialize)]
pub struct GatewaySnapshot {
    /// Gateway state
    pub state: GatewayState,
    /// The current connection, if any
    pub connection: Option<ConnectionSnapshot>,
    /// Subscriptions of the current connection
    pub subscriptions: Vec<SubscriptionInfo>,
}

/// Single entry point for connecting, publishing and subscribing
///
/// One gateway drives at most one logical connection. Calling
/// [`connect`](Self::connect) while connected closes the current connection
/// first.
pub struct Gateway<T>
where
    T: Transport,
{
    transport: Arc<T>,
    config: GatewayConfig,
    notifier: Arc<Notifier>,
    current: RwLock<Option<Arc<Session>>>,
    /// Serializes `connect` and `disconnect`
    transition: Mutex<()>,
}

impl<T> Gateway<T>
where
    T: Transport,
{
    /// Create a gateway with the default [`GatewayConfig`].
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, GatewayConfig::default())
    }

    /// Create a gateway with `config`.
    pub fn with_config(transport: T, config: GatewayConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            notifier: Arc::new(Notifier::new()),
            current: RwLock::new(None),
            transition: Mutex::new(()),
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Connect to the broker described by `options`.
    ///
    /// # Errors
    ///
    /// Validation errors ([`GatewayError::InvalidEndpoint`],
    /// [`GatewayError::InvalidCredentials`]) leave the gateway untouched.
    /// Handshake failures move the gateway to [`GatewayState::Errored`].
    pub async fn connect(&self, options: ConnectionOptions) -> GatewayResult<ConnectionId> {
        let _transition = self.transition.lock().await;

        let endpoint = Endpoint::parse(&options.endpoint)?;
        let credentials = options.credentials()?;

        let previous = self.current.write().take();
        if let Some(previous) = previous {
            info!("Closing connection {} before reconnecting", previous.id);
            previous.close().await;
        }

        info!(
            "Connecting to {} using {} authentication",
            endpoint,
            credentials.mode()
        );

        let transport: Arc<dyn Transport> = self.transport.clone();
        let session = Arc::new(Session::new(
            transport,
            endpoint,
            options,
            credentials,
            self.config.clone(),
            self.notifier.clone(),
        ));
        session.set_state(ConnectionState::Connecting);

        match session.open_link().await {
            Ok(link) => {
                *self.current.write() = Some(session.clone());
                session.set_state(ConnectionState::Connected);
                session.start(link);
                info!("Connected to {} as {}", session.endpoint, session.id);
                Ok(session.id)
            }
            Err(e) => {
                warn!(
                    "Failed to connect to {}: {}",
                    session.endpoint,
                    e.friendly_message()
                );
                session.set_state(ConnectionState::Errored);
                Err(e)
            }
        }
    }

    /// Flush queued frames, close every subscription and close the link.
    ///
    /// Idempotent. Pending reconnect attempts and blocked publishes are
    /// cancelled.
    pub async fn disconnect(&self) {
        let _transition = self.transition.lock().await;

        let session = self.current.write().take();
        match session {
            Some(session) => {
                session.close().await;
                info!("Disconnected from {}", session.endpoint);
            }
            None => debug!("Disconnect without a connection"),
        }

        self.notifier.set_state(GatewayState::Closed);
    }

    /// Publish `payload` to `subject`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotConnected`] unless connected or
    /// reconnecting, [`GatewayError::InvalidSubject`] for a malformed
    /// subject, and backpressure errors per [`GatewayConfig::backpressure`].
    pub async fn publish(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        options: PublishOptions,
    ) -> GatewayResult<PublishReceipt> {
        let session = self.session()?;
        session.publish(subject, payload.into(), options).await
    }

    /// Make `subject` known to the broker by publishing a marker message.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish).
    pub async fn create_topic(&self, subject: &str) -> GatewayResult<PublishReceipt> {
        self.publish(subject, TOPIC_CREATED_PAYLOAD, PublishOptions::default())
            .await
    }

    /// Register `handler` for subjects matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidPattern`],
    /// [`GatewayError::NotConnected`] or [`GatewayError::DuplicatePattern`].
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: impl MessageHandler,
    ) -> GatewayResult<SubscriptionId> {
        let session = self.session()?;
        session.subscribe(pattern, Arc::new(handler)).await
    }

    /// Remove a subscription. Unknown identifiers are ignored.
    pub async fn unsubscribe(&self, id: SubscriptionId) {
        let session = self.current.read().clone();
        if let Some(session) = session {
            session.unsubscribe(id).await;
        }
    }

    /// Current gateway state.
    pub fn state(&self) -> GatewayState {
        self.notifier.state()
    }

    /// Identifier of the current connection.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.current.read().as_ref().map(|session| session.id)
    }

    /// Observe state changes.
    pub fn watch_state(&self) -> watch::Receiver<GatewayState> {
        self.notifier.watch()
    }

    /// Receive gateway events emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.notifier.subscribe()
    }

    /// Point-in-time view of the gateway.
    pub fn snapshot(&self) -> GatewaySnapshot {
        let session = self.current.read().clone();
        GatewaySnapshot {
            state: self.state(),
            connection: session.as_ref().map(|session| session.snapshot()),
            subscriptions: session
                .as_ref()
                .map(|session| session.subscriptions())
                .unwrap_or_default(),
        }
    }

    fn session(&self) -> GatewayResult<Arc<Session>> {
        self.current.read().clone().ok_or(GatewayError::NotConnected)
    }
}

impl<T> Drop for Gateway<T>
where
    T: Transport,
{
    fn drop(&mut self) {
        if let Some(session) = self.current.get_mut().take() {
            session.abort();
        }
    }
}
