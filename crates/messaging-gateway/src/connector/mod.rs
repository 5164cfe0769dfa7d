//! Transport connector
//!
//! Owns the physical link of a [`Session`]: the handshake, the read and write
//! pumps with heartbeats, and reconnection with capped exponential backoff.

mod handshake;
mod link;

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::events::{ConnectionState, GatewayEvent};
use crate::session::Session;

pub(crate) use handshake::{Established, establish, resubscribe};
use link::LinkExit;

/// Run links for `session` until shutdown or until reconnection gives up.
pub(crate) async fn supervise(session: Arc<Session>, link: Established) {
    let mut link = link;

    loop {
        match link::run(&session, link).await {
            LinkExit::Shutdown => return,
            LinkExit::Lost(reason) => {
                warn!("Connection {} lost: {}", session.id, reason);
            }
            LinkExit::HeartbeatTimeout(missed) => {
                warn!(
                    "Connection {} missed {} heartbeat(s); treating link as dead",
                    session.id, missed
                );
                session.notifier.emit(GatewayEvent::HeartbeatTimeout {
                    connection_id: session.id,
                    missed,
                });
                // Missed heartbeats surface as Errored before reconnection starts
                session.set_state(ConnectionState::Errored);
            }
        }

        match reconnect(&session).await {
            Some(next) => link = next,
            None => return,
        }
    }
}

async fn reconnect(session: &Session) -> Option<Established> {
    let max_attempts = session.options.max_reconnect_attempts;
    if max_attempts == 0 {
        error!(
            "Connection {} lost and reconnection is disabled",
            session.id
        );
        session.fail(0, "reconnection disabled".to_string());
        return None;
    }

    session.set_state(ConnectionState::Reconnecting);

    let mut last_error = String::new();
    for attempt in 1..=max_attempts {
        let delay = session
            .options
            .reconnect_delay(attempt, session.config.max_reconnect_interval());
        session.notifier.emit(GatewayEvent::ReconnectAttempt {
            connection_id: session.id,
            attempt,
            delay,
        });
        info!(
            "Reconnecting {} to {} in {:?} (attempt {}/{})",
            session.id, session.endpoint, delay, attempt, max_attempts
        );

        let result = tokio::select! {
            biased;
            () = session.shutdown.cancelled() => return None,
            result = async {
                sleep(delay).await;
                session.open_link().await
            } => result,
        };

        match result {
            Ok(link) => {
                info!(
                    "Connection {} restored on attempt {}",
                    session.id, attempt
                );
                session.set_state(ConnectionState::Connected);
                session.notifier.emit(GatewayEvent::Reconnected {
                    connection_id: session.id,
                    attempt,
                });
                return Some(link);
            }
            Err(e) => {
                warn!(
                    "Reconnect attempt {} for {} failed: {}",
                    attempt, session.id, e
                );
                last_error = e.friendly_message();
            }
        }
    }

    error!(
        "Giving up on connection {} after {} attempt(s): {}",
        session.id, max_attempts, last_error
    );
    session.fail(max_attempts, last_error);
    None
}
