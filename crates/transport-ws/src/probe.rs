use std::time::{Duration, Instant};

use proven_transport::protocol::{Decoder, ServerInfo, ServerOp};
use proven_transport::{Endpoint, Transport, TransportError};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::WebSocketTransport;

/// Default bound for a reachability probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a successful probe
#[derive(Clone, Debug)]
pub struct ProbeReport {
    /// The probed endpoint
    pub endpoint: String,
    /// Whether the link used TLS
    pub secure: bool,
    /// Time from start until the greeting (or the deadline)
    pub elapsed: Duration,
    /// The broker greeting, if one arrived before the deadline
    pub server_info: Option<ServerInfo>,
}

impl ProbeReport {
    /// Whether the endpoint greeted like a broker.
    #[must_use]
    pub const fn is_broker(&self) -> bool {
        self.server_info.is_some()
    }
}

/// Check that a WebSocket upgrade to `endpoint` succeeds within `wait`.
///
/// The probe does not authenticate. It waits for the remainder of `wait` for
/// an `INFO` greeting, then closes the socket.
///
/// # Errors
///
/// Returns the classified [`TransportError`] if the upgrade fails, or
/// [`TransportError::Timeout`] if it does not complete in time.
pub async fn probe(endpoint: &Endpoint, wait: Duration) -> Result<ProbeReport, TransportError> {
    let started = Instant::now();
    let transport = WebSocketTransport::new();

    let connection = timeout(wait, transport.connect(endpoint))
        .await
        .map_err(|_| {
            TransportError::timeout(format!("no WebSocket upgrade from {endpoint} within {wait:?}"))
        })??;

    let remaining = wait.saturating_sub(started.elapsed());
    let mut decoder = Decoder::new();
    let greeting = timeout(remaining, async {
        loop {
            let chunk = connection.recv().await?;
            decoder.extend(&chunk);
            let op = decoder
                .next_server_op()
                .map_err(|e| TransportError::Other(e.to_string()))?;
            match op {
                Some(ServerOp::Info(info)) => return Ok::<_, TransportError>(Some(*info)),
                Some(_) => return Ok(None),
                None => {}
            }
        }
    })
    .await;

    let server_info = match greeting {
        Ok(Ok(info)) => info,
        Ok(Err(e)) => {
            debug!("Probe of {} got no greeting: {}", endpoint, e);
            None
        }
        Err(_) => None,
    };

    let _ = connection.close().await;

    let report = ProbeReport {
        endpoint: endpoint.to_string(),
        secure: endpoint.scheme().is_secure(),
        elapsed: started.elapsed(),
        server_info,
    };

    info!(
        "Probe of {} succeeded in {:?} (broker greeting: {})",
        report.endpoint,
        report.elapsed,
        report.is_broker()
    );

    Ok(report)
}
