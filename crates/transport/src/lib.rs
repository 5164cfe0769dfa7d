//! Generic transport abstraction for broker communication
//!
//! This crate provides a transport-agnostic interface for talking to a
//! NATS-style message broker. Specific transport implementations (WebSocket,
//! in-memory, etc.) are provided in separate crates.
//!
//! Besides the traits, the crate carries everything both ends of a link need
//! to agree on:
//! - Endpoint validation (`ws://` and `wss://` only, no embedded credentials)
//! - Subject and subject-pattern rules
//! - The client protocol codec (control lines, payload framing)
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod subject;

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

pub use endpoint::{Endpoint, EndpointError, Scheme};
pub use error::TransportError;

/// Transport trait for establishing physical links to a broker
///
/// A transport only knows how to open a byte pipe to an endpoint. Handshake,
/// authentication, heartbeats and reconnection are layered on top by the
/// caller.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new physical connection to the given endpoint.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError>;
}

/// A single physical, bidirectional link
///
/// Sending and receiving may happen concurrently from different tasks.
/// Frame boundaries are not meaningful to the protocol: a received chunk may
/// hold several protocol operations or only part of one.
#[async_trait]
pub trait Connection: Debug + Send + Sync + 'static {
    /// Send a chunk of protocol bytes.
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Receive the next chunk of protocol bytes.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the peer has gone.
    async fn recv(&self) -> Result<Bytes, TransportError>;

    /// Close the link. Closing an already closed link is a no-op.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Configuration shared by transports
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum size of a single received frame in bytes
    pub max_frame_size: usize,
    /// Number of inbound chunks buffered per connection
    pub inbound_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 8 * 1024 * 1024, // 8MB
            inbound_buffer: 256,
        }
    }
}
