//! In-memory transport implementation for testing
//!
//! A [`MemoryTransport`] opens links to a [`MemoryBroker`] living in the same
//! process. The broker speaks the same client protocol a real broker does over
//! WebSocket, so everything above the transport runs unchanged.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;

pub use broker::{BrokerAuth, DEFAULT_MAX_PAYLOAD, MemoryBroker};

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use proven_transport::{Config, Connection, Endpoint, Transport, TransportError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Memory transport implementation
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    config: Config,
}

impl MemoryTransport {
    /// Create a transport whose links all lead to `broker`
    #[must_use]
    pub fn new(broker: MemoryBroker) -> Self {
        Self::with_config(broker, Config::default())
    }

    /// Create a transport with explicit buffer limits
    #[must_use]
    pub const fn with_config(broker: MemoryBroker, config: Config) -> Self {
        Self { broker, config }
    }

    /// The broker behind this transport
    #[must_use]
    pub const fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        if self.broker.is_refusing() {
            debug!("Memory broker refused connection to {}", endpoint);
            return Err(TransportError::Refused(format!(
                "memory broker at {endpoint} is not accepting connections"
            )));
        }

        let capacity = self.config.inbound_buffer.max(1);
        let (client_to_server_tx, client_to_server_rx) = flume::bounded(capacity);
        let (server_to_client_tx, server_to_client_rx) = flume::bounded(capacity);
        let token = CancellationToken::new();

        self.broker
            .open_session(client_to_server_rx, server_to_client_tx, token.clone());

        let conn = MemoryConnection {
            id: Uuid::new_v4(),
            sender: client_to_server_tx,
            receiver: server_to_client_rx,
            session: token,
            closed: CancellationToken::new(),
        };

        info!("Memory connection {} established to {}", conn.id, endpoint);

        Ok(Box::new(conn))
    }
}

/// Client side of a memory link
///
/// `session` is shared with the broker and ends the link from either side.
/// `closed` only tracks a local close, so frames the broker queued before
/// hanging up can still be read.
struct MemoryConnection {
    id: Uuid,
    sender: flume::Sender<Bytes>,
    receiver: flume::Receiver<Bytes>,
    session: CancellationToken,
    closed: CancellationToken,
}

impl Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() || self.session.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        debug!("Memory connection {} sending {} bytes", self.id, data.len());

        tokio::select! {
            biased;
            () = self.session.cancelled() => Err(TransportError::ConnectionClosed),
            sent = self.sender.send_async(data) => sent.map_err(|_| TransportError::ConnectionClosed),
        }
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        // Once the broker side hangs up, buffered frames drain before the
        // channel reports disconnection.
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
            received = self.receiver.recv_async() => received.map_err(|_| TransportError::ConnectionClosed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.is_cancelled() {
            debug!("Closing memory connection {}", self.id);
            self.closed.cancel();
            self.session.cancel();
        }
        Ok(())
    }
}
