use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;
use proven_transport::Connection;
use proven_transport::protocol::{ClientOp, Decoder, ServerOp};
use tokio::time::{Duration, Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, trace, warn};

use super::handshake::{Established, encode};
use crate::message::SubscriptionId;
use crate::registry::InboundMessage;
use crate::session::Session;

const PERMISSIONS_VIOLATION: &str = "Permissions Violation for Subscription to";

/// Why a link stopped
#[derive(Debug)]
pub(crate) enum LinkExit {
    /// Shutdown was requested and queued frames were flushed
    Shutdown,
    /// The transport failed or the broker hung up
    Lost(String),
    /// This many heartbeats went unanswered
    HeartbeatTimeout(u32),
}

/// Heartbeat bookkeeping shared by the read and write halves of a link
#[derive(Debug, Default)]
struct Liveness {
    /// Pings sent since the broker was last heard from
    outstanding: AtomicU32,
    /// The reader is parked on a full dispatch queue and cannot see `PONG`s
    stalled: AtomicBool,
}

impl Liveness {
    fn heard_from_broker(&self) {
        self.outstanding.store(0, Ordering::Release);
    }

    fn stall(&self) {
        self.stalled.store(true, Ordering::Release);
    }

    /// Pings sent before or during a stall prove nothing either way.
    fn resume(&self) {
        self.outstanding.store(0, Ordering::Release);
        self.stalled.store(false, Ordering::Release);
    }

    fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }
}

/// Pump frames in both directions until the link dies or shutdown is
/// requested. The connection is closed on return.
pub(crate) async fn run(session: &Session, link: Established) -> LinkExit {
    let Established {
        conn, mut decoder, ..
    } = link;
    let liveness = Liveness::default();

    let exit = tokio::select! {
        biased;
        () = session.shutdown.cancelled() => None,
        exit = read_loop(session, conn.as_ref(), &mut decoder, &liveness) => Some(exit),
        exit = write_loop(session, conn.as_ref(), &liveness) => Some(exit),
    };

    let exit = match exit {
        Some(exit) => exit,
        None => {
            drain(session, conn.as_ref(), &mut decoder).await;
            LinkExit::Shutdown
        }
    };

    if let Err(e) = conn.close().await {
        trace!("Closing link for connection {}: {}", session.id, e);
    }
    exit
}

async fn read_loop(
    session: &Session,
    conn: &dyn Connection,
    decoder: &mut Decoder,
    liveness: &Liveness,
) -> LinkExit {
    loop {
        loop {
            match decoder.next_server_op() {
                Ok(Some(op)) => {
                    if let ServerOp::Info(info) = &op {
                        decoder.set_max_payload(info.max_payload);
                    }
                    if let Some(exit) = handle_op(session, conn, op, liveness).await {
                        return exit;
                    }
                }
                Ok(None) => break,
                Err(e) => return LinkExit::Lost(format!("protocol error: {e}")),
            }
        }

        match conn.recv().await {
            Ok(chunk) => {
                liveness.heard_from_broker();
                decoder.extend(&chunk);
            }
            Err(e) => return LinkExit::Lost(e.to_string()),
        }
    }
}

async fn handle_op(
    session: &Session,
    conn: &dyn Connection,
    op: ServerOp,
    liveness: &Liveness,
) -> Option<LinkExit> {
    match op {
        ServerOp::Msg {
            subject,
            sid,
            reply_to,
            payload,
        } => {
            let inbound = InboundMessage {
                subject,
                sid,
                reply_to,
                payload,
            };
            if sid == SubscriptionId::INBOX.sid() {
                session.pipeline.complete_reply(inbound);
            } else {
                dispatch(session, inbound, liveness).await;
            }
        }
        ServerOp::Ping => {
            if let Err(e) = send_op(conn, &ClientOp::Pong).await {
                return Some(LinkExit::Lost(e));
            }
        }
        ServerOp::Pong => liveness.heard_from_broker(),
        ServerOp::Info(info) => session.update_server_info(*info),
        ServerOp::Ok => {}
        ServerOp::Err(message) => return handle_server_error(session, &message),
    }
    None
}

/// Hand `inbound` to the dispatch task, waiting while the queue is full.
async fn dispatch(session: &Session, inbound: InboundMessage, liveness: &Liveness) {
    let sent = match session.dispatch.try_send(inbound) {
        Ok(()) => Ok(()),
        Err(flume::TrySendError::Full(inbound)) => {
            trace!("Dispatch queue of connection {} is full", session.id);
            liveness.stall();
            let sent = session.dispatch.send_async(inbound).await.map_err(|_| ());
            liveness.resume();
            sent
        }
        Err(flume::TrySendError::Disconnected(_)) => Err(()),
    };

    if sent.is_err() {
        trace!("Dispatch stopped; dropping message");
    }
}

fn handle_server_error(session: &Session, message: &str) -> Option<LinkExit> {
    if let Some(rest) = message.strip_prefix(PERMISSIONS_VIOLATION) {
        let subject = rest.trim().trim_matches('"');
        if session.registry.fail_subject(subject, message).is_none() {
            warn!("Broker rejected unknown subscription '{}'", subject);
        }
        return None;
    }

    if message.to_ascii_lowercase().contains("stale connection") {
        return Some(LinkExit::Lost(message.to_string()));
    }

    warn!("Broker error on connection {}: {}", session.id, message);
    None
}

async fn write_loop(session: &Session, conn: &dyn Connection, liveness: &Liveness) -> LinkExit {
    let period = session
        .options
        .heartbeat_interval()
        .max(Duration::from_millis(1));
    let max_missed = session.options.max_missed_heartbeats.max(1);

    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = session.outbound.recv_async() => {
                let Ok(frame) = frame else {
                    return LinkExit::Shutdown;
                };
                if let Err(e) = conn.send(frame).await {
                    return LinkExit::Lost(e.to_string());
                }
            }
            _ = heartbeat.tick() => {
                if liveness.is_stalled() {
                    trace!(
                        "Heartbeat on connection {} skipped while dispatch is full",
                        session.id
                    );
                    continue;
                }
                let missed = liveness.outstanding.load(Ordering::Acquire);
                if missed >= max_missed {
                    return LinkExit::HeartbeatTimeout(missed);
                }
                liveness.outstanding.fetch_add(1, Ordering::AcqRel);
                trace!("Heartbeat on connection {} ({} outstanding)", session.id, missed);
                if let Err(e) = send_op(conn, &ClientOp::Ping).await {
                    return LinkExit::Lost(e);
                }
            }
        }
    }
}

/// Flush whatever is still queued, bounded by the drain grace.
async fn drain(session: &Session, conn: &dyn Connection, decoder: &mut Decoder) {
    let grace = session.config.drain_grace();

    match timeout(grace, flush(session, conn, decoder)).await {
        Ok(Ok(flushed)) => debug!(
            "Connection {} drained {} queued frame(s)",
            session.id, flushed
        ),
        Ok(Err(e)) => debug!("Connection {} drain cut short: {}", session.id, e),
        Err(_) => warn!(
            "Connection {} drain grace of {:?} elapsed",
            session.id, grace
        ),
    }
}

/// Send the queue, then wait for a `PING`/`PONG` round trip so the broker
/// has processed everything before the link closes.
async fn flush(
    session: &Session,
    conn: &dyn Connection,
    decoder: &mut Decoder,
) -> Result<usize, String> {
    let mut flushed = 0;
    while let Ok(frame) = session.outbound.try_recv() {
        conn.send(frame).await.map_err(|e| e.to_string())?;
        flushed += 1;
    }
    send_op(conn, &ClientOp::Ping).await?;

    loop {
        while let Some(op) = decoder.next_server_op().map_err(|e| e.to_string())? {
            match op {
                ServerOp::Pong => return Ok(flushed),
                ServerOp::Msg {
                    subject,
                    sid,
                    reply_to,
                    payload,
                } => {
                    let inbound = InboundMessage {
                        subject,
                        sid,
                        reply_to,
                        payload,
                    };
                    if sid == SubscriptionId::INBOX.sid() {
                        session.pipeline.complete_reply(inbound);
                    } else {
                        let _ = session.dispatch.try_send(inbound);
                    }
                }
                _ => {}
            }
        }

        let chunk = conn.recv().await.map_err(|e| e.to_string())?;
        decoder.extend(&chunk);
    }
}

async fn send_op(conn: &dyn Connection, op: &ClientOp) -> Result<(), String> {
    let frame: Bytes = encode(op).map_err(|e| e.to_string())?;
    conn.send(frame).await.map_err(|e| e.to_string())
}
