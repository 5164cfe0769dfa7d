use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use proven_transport::protocol::{ClientOp, ConnectInfo, Decoder, ServerInfo, ServerOp};
use proven_transport::{Connection, Endpoint, Transport};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{GatewayError, GatewayResult};
use crate::message::SubscriptionId;

/// A physical link that completed the handshake
#[derive(Debug)]
pub(crate) struct Established {
    pub conn: Arc<dyn Connection>,
    /// Holds anything the broker sent after the handshake `PONG`
    pub decoder: Decoder,
    pub server_info: ServerInfo,
}

/// Open a link and complete `INFO` / `CONNECT` / `PING` / `PONG` within `limit`.
pub(crate) async fn establish(
    transport: &dyn Transport,
    endpoint: &Endpoint,
    connect: &ConnectInfo,
    limit: Duration,
) -> GatewayResult<Established> {
    let attempt = async {
        let conn: Arc<dyn Connection> = Arc::from(transport.connect(endpoint).await?);

        match handshake(conn.as_ref(), connect).await {
            Ok((decoder, server_info)) => Ok(Established {
                conn,
                decoder,
                server_info,
            }),
            Err(e) => {
                let _ = conn.close().await;
                Err(e)
            }
        }
    };

    timeout(limit, attempt).await.map_err(|_| {
        GatewayError::Timeout(format!(
            "handshake with {endpoint} did not complete within {limit:?}"
        ))
    })?
}

async fn handshake(
    conn: &dyn Connection,
    connect: &ConnectInfo,
) -> GatewayResult<(Decoder, ServerInfo)> {
    let mut decoder = Decoder::new();

    let mut info = match next_op(conn, &mut decoder).await? {
        ServerOp::Info(info) => *info,
        ServerOp::Err(message) => return Err(GatewayError::from_server_error(&message)),
        other => {
            return Err(GatewayError::Unknown(format!(
                "expected INFO greeting, got {other:?}"
            )));
        }
    };
    debug!(
        "Broker {} (version {}) greeted us",
        info.server_id, info.version
    );
    decoder.set_max_payload(info.max_payload);

    let mut frame = BytesMut::new();
    frame.extend_from_slice(&encode(&ClientOp::Connect(Box::new(connect.clone())))?);
    frame.extend_from_slice(&encode(&ClientOp::Ping)?);
    conn.send(frame.freeze()).await?;

    // The broker answers PING only once CONNECT was accepted
    loop {
        match next_op(conn, &mut decoder).await? {
            ServerOp::Pong => return Ok((decoder, info)),
            ServerOp::Err(message) => return Err(GatewayError::from_server_error(&message)),
            ServerOp::Ping => conn.send(encode(&ClientOp::Pong)?).await?,
            ServerOp::Info(update) => {
                decoder.set_max_payload(update.max_payload);
                info = *update;
            }
            op @ (ServerOp::Ok | ServerOp::Msg { .. }) => {
                trace!("Ignoring {:?} during handshake", op);
            }
        }
    }
}

async fn next_op(conn: &dyn Connection, decoder: &mut Decoder) -> GatewayResult<ServerOp> {
    loop {
        if let Some(op) = decoder
            .next_server_op()
            .map_err(|e| GatewayError::Unknown(format!("protocol error: {e}")))?
        {
            return Ok(op);
        }

        let chunk = conn.recv().await?;
        decoder.extend(&chunk);
    }
}

/// Subscribe the reply inbox and every active subscription in one frame.
pub(crate) async fn resubscribe(
    conn: &dyn Connection,
    inbox: &str,
    active: &[(SubscriptionId, String)],
) -> GatewayResult<()> {
    let mut frame = BytesMut::new();
    frame.extend_from_slice(&encode(&ClientOp::Sub {
        subject: inbox.to_string(),
        sid: SubscriptionId::INBOX.sid(),
    })?);
    for (id, pattern) in active {
        frame.extend_from_slice(&encode(&ClientOp::Sub {
            subject: pattern.clone(),
            sid: id.sid(),
        })?);
    }

    conn.send(frame.freeze()).await?;

    if !active.is_empty() {
        debug!("Re-issued {} subscription(s)", active.len());
    }
    Ok(())
}

pub(crate) fn encode(op: &ClientOp) -> GatewayResult<bytes::Bytes> {
    op.encode()
        .map_err(|e| GatewayError::Unknown(format!("failed to encode frame: {e}")))
}
