//! WebSocket transport for broker links
//!
//! Opens `ws://` and `wss://` client connections with `tokio-tungstenite`.
//! TLS uses rustls with the bundled web PKI roots. The read and write halves
//! of the socket are locked independently so a reader task can wait on
//! `recv` while other tasks keep sending.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod probe;

pub use probe::{DEFAULT_PROBE_TIMEOUT, ProbeReport, probe};

use std::fmt::Debug;
use std::io;
use std::sync::Once;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use proven_transport::{Config, Connection, Endpoint, Transport, TransportError};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

static CRYPTO_PROVIDER: Once = Once::new();

fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        // Fails only if another provider is already installed, which is fine.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// WebSocket transport implementation
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    config: Config,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport with default limits
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new WebSocket transport with the given limits
    #[must_use]
    pub const fn with_config(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        if endpoint.scheme().is_secure() {
            install_crypto_provider();
        }

        debug!("Connecting to WebSocket at {}", endpoint);

        let ws_config = WebSocketConfig::default()
            .max_frame_size(Some(self.config.max_frame_size))
            .max_message_size(Some(self.config.max_frame_size));

        let (ws_stream, response) =
            connect_async_with_config(endpoint.url().as_str(), Some(ws_config), true)
                .await
                .map_err(classify_error)?;

        debug!(
            "WebSocket upgrade to {} completed with status {}",
            endpoint,
            response.status()
        );

        Ok(Box::new(WebSocketConnection::new(
            endpoint.to_string(),
            ws_stream,
        )))
    }
}

/// Map a tungstenite failure onto the transport error classes.
fn classify_error(error: WsError) -> TransportError {
    match error {
        WsError::Io(e) => classify_io(e),
        WsError::Tls(e) => TransportError::Tls(e.to_string()),
        WsError::Http(response) => {
            let status = response.status();
            match status.as_u16() {
                401 | 403 => TransportError::Unauthorized(format!("upgrade rejected with {status}")),
                _ => TransportError::Other(format!("upgrade rejected with {status}")),
            }
        }
        WsError::Url(e) => TransportError::invalid_address(e.to_string()),
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
        other => TransportError::Other(other.to_string()),
    }
}

fn classify_io(error: io::Error) -> TransportError {
    let is_tls = error
        .get_ref()
        .is_some_and(|inner| inner.is::<rustls::Error>());

    match error.kind() {
        _ if is_tls => TransportError::Tls(error.to_string()),
        io::ErrorKind::ConnectionRefused => TransportError::Refused(error.to_string()),
        io::ErrorKind::TimedOut => TransportError::timeout(error.to_string()),
        _ => TransportError::Io(error),
    }
}

/// A client-side WebSocket connection
struct WebSocketConnection {
    endpoint: String,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    closed: RwLock<bool>,
}

impl WebSocketConnection {
    fn new(endpoint: String, ws_stream: WsStream) -> Self {
        let (sink, stream) = ws_stream.split();
        Self {
            endpoint,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: RwLock::new(false),
        }
    }

    async fn mark_closed(&self) {
        *self.closed.write().await = true;
    }
}

impl Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if *self.closed.read().await {
            return Err(TransportError::ConnectionClosed);
        }

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Binary(data)).await {
            let error = classify_error(e);
            if error.is_closed() {
                self.mark_closed().await;
            }
            return Err(error);
        }

        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        let mut stream = self.stream.lock().await;

        loop {
            if *self.closed.read().await {
                return Err(TransportError::ConnectionClosed);
            }

            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Bytes::copy_from_slice(text.as_str().as_bytes()));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("WebSocket {} closed by peer: {:?}", self.endpoint, frame);
                    self.mark_closed().await;
                    return Err(TransportError::ConnectionClosed);
                }
                // Control frames are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let error = classify_error(e);
                    warn!("WebSocket {} receive failed: {}", self.endpoint, error);
                    self.mark_closed().await;
                    return Err(error);
                }
                None => {
                    self.mark_closed().await;
                    return Err(TransportError::ConnectionClosed);
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut closed = self.closed.write().await;
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("WebSocket {} close handshake failed: {}", self.endpoint, e);
        }

        Ok(())
    }
}
