//! One logical connection and everything it owns

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use proven_transport::protocol::{ClientOp, ConnectInfo, ServerInfo};
use proven_transport::subject::validate_pattern;
use proven_transport::{Endpoint, Transport};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConnectionOptions, Credentials, GatewayConfig};
use crate::connector::{self, Established};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{ConnectionState, GatewayEvent, GatewayState, Notifier};
use crate::handler::MessageHandler;
use crate::message::{
    ConnectionId, PublishOptions, PublishReceipt, SubscriptionId, SubscriptionInfo,
};
use crate::publish::PublishPipeline;
use crate::registry::{InboundMessage, SubscriptionRegistry};

/// Read-only view of the current connection
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionSnapshot {
    /// Connection identifier
    pub id: ConnectionId,
    /// Broker endpoint
    pub endpoint: String,
    /// Connection state
    pub state: ConnectionState,
    /// Latest server greeting
    pub server_info: ServerInfo,
    /// Last publish sequence assigned
    pub last_sequence: u64,
}

pub(crate) struct Session {
    pub(crate) id: ConnectionId,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) endpoint: Endpoint,
    pub(crate) options: ConnectionOptions,
    pub(crate) config: GatewayConfig,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) pipeline: PublishPipeline,
    pub(crate) outbound: flume::Receiver<Bytes>,
    pub(crate) dispatch: flume::Sender<InboundMessage>,
    /// Stops the link and any reconnect attempt; the link drains first
    pub(crate) shutdown: CancellationToken,
    credentials: Credentials,
    state: RwLock<ConnectionState>,
    server_info: RwLock<ServerInfo>,
    dispatch_rx: flume::Receiver<InboundMessage>,
    /// Stops the dispatch task
    closed: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        options: ConnectionOptions,
        credentials: Credentials,
        config: GatewayConfig,
        notifier: Arc<Notifier>,
    ) -> Self {
        let id = ConnectionId::new();
        let (outbound_tx, outbound_rx) = flume::bounded(config.outbound_queue_size.max(1));
        let (dispatch_tx, dispatch_rx) = flume::bounded(config.dispatch_queue_size.max(1));

        Self {
            id,
            transport,
            endpoint,
            options,
            registry: SubscriptionRegistry::new(config.handler_timeout(), notifier.clone()),
            pipeline: PublishPipeline::new(id, outbound_tx, &config),
            config,
            notifier,
            outbound: outbound_rx,
            dispatch: dispatch_tx,
            shutdown: CancellationToken::new(),
            credentials,
            state: RwLock::new(ConnectionState::Disconnected),
            server_info: RwLock::new(ServerInfo::default()),
            dispatch_rx,
            closed: CancellationToken::new(),
            supervisor: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Move the connection to `state` and mirror it on the gateway.
    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!("Connection {} {:?} -> {:?}", self.id, previous, state);
        }

        let gateway = match state {
            ConnectionState::Connecting => Some(GatewayState::Connecting),
            ConnectionState::Connected => Some(GatewayState::Connected),
            ConnectionState::Reconnecting => Some(GatewayState::Reconnecting),
            ConnectionState::Closed => Some(GatewayState::Closed),
            ConnectionState::Errored => Some(GatewayState::Errored),
            ConnectionState::Disconnected | ConnectionState::Closing => None,
        };
        if let Some(gateway) = gateway {
            self.notifier.set_state(gateway);
        }
    }

    pub(crate) fn update_server_info(&self, info: ServerInfo) {
        debug!(
            "Connection {} server {} (max payload {})",
            self.id, info.server_id, info.max_payload
        );
        self.pipeline.set_max_payload(info.max_payload);
        *self.server_info.write() = info;
    }

    fn connect_info(&self) -> ConnectInfo {
        let mut info = ConnectInfo {
            verbose: false,
            pedantic: false,
            lang: Some("rust".to_string()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            name: Some(self.config.client_name.clone()),
            protocol: 1,
            echo: true,
            ..ConnectInfo::default()
        };

        match &self.credentials {
            Credentials::None => {}
            Credentials::Token(token) => info.auth_token = Some(token.clone()),
            Credentials::UserPassword { username, password } => {
                info.user = Some(username.clone());
                info.pass = Some(password.clone());
            }
        }

        info
    }

    /// Open a physical link, handshake and re-issue every subscription.
    pub(crate) async fn open_link(&self) -> GatewayResult<Established> {
        let link = connector::establish(
            self.transport.as_ref(),
            &self.endpoint,
            &self.connect_info(),
            self.options.timeout(),
        )
        .await?;

        self.update_server_info(link.server_info.clone());

        let active = self.registry.active();
        if let Err(e) =
            connector::resubscribe(link.conn.as_ref(), &self.pipeline.inbox_pattern(), &active)
                .await
        {
            let _ = link.conn.close().await;
            return Err(e);
        }

        Ok(link)
    }

    /// Spawn the dispatch task and the link supervisor.
    pub(crate) fn start(self: &Arc<Self>, link: Established) {
        let session = self.clone();
        tokio::spawn(async move { session.run_dispatch().await });

        let handle = tokio::spawn(connector::supervise(self.clone(), link));
        *self.supervisor.lock() = Some(handle);
    }

    async fn run_dispatch(&self) {
        loop {
            tokio::select! {
                biased;
                () = self.closed.cancelled() => break,
                inbound = self.dispatch_rx.recv_async() => match inbound {
                    Ok(inbound) => self.registry.deliver(inbound).await,
                    Err(_) => break,
                },
            }
        }
        debug!("Dispatch for connection {} stopped", self.id);
    }

    pub(crate) async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> GatewayResult<SubscriptionId> {
        validate_pattern(pattern).map_err(|e| GatewayError::invalid_pattern(pattern, e))?;
        if self.state() != ConnectionState::Connected {
            return Err(GatewayError::NotConnected);
        }

        let id = self.registry.insert(pattern, handler)?;
        let frame = ClientOp::Sub {
            subject: pattern.to_string(),
            sid: id.sid(),
        }
        .encode()
        .map_err(|e| GatewayError::Unknown(e.to_string()))?;

        if let Err(e) = self.pipeline.enqueue_control(frame).await {
            self.registry.remove(id);
            return Err(e);
        }

        info!("Subscribed to '{}' as subscription {}", pattern, id);
        self.notifier.emit(GatewayEvent::SubscriptionAdded {
            id,
            pattern: pattern.to_string(),
        });
        Ok(id)
    }

    pub(crate) async fn unsubscribe(&self, id: SubscriptionId) {
        let Some(pattern) = self.registry.remove(id) else {
            return;
        };

        info!("Unsubscribed subscription {} from '{}'", id, pattern);
        self.notifier
            .emit(GatewayEvent::SubscriptionRemoved { id, pattern });

        // Queued frames outlive a reconnect and reach the broker after the
        // resubscription, which may still have carried this sid.
        let frame = ClientOp::Unsub {
            sid: id.sid(),
            max_msgs: None,
        }
        .encode();
        match frame {
            Ok(frame) => {
                if let Err(e) = self.pipeline.enqueue_control(frame).await {
                    debug!("UNSUB for subscription {} not sent: {}", id, e);
                }
            }
            Err(e) => debug!("UNSUB for subscription {} not encoded: {}", id, e),
        }
    }

    pub(crate) async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> GatewayResult<PublishReceipt> {
        if !self.state().accepts_publish() {
            return Err(GatewayError::NotConnected);
        }
        self.pipeline.publish(subject, payload, options).await
    }

    pub(crate) fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            endpoint: self.endpoint.to_string(),
            state: self.state(),
            server_info: self.server_info.read().clone(),
            last_sequence: self.pipeline.last_sequence(),
        }
    }

    pub(crate) fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry.snapshot()
    }

    /// Reconnection gave up: fail everything and settle in `Errored`.
    pub(crate) fn fail(&self, attempts: u32, reason: String) {
        self.pipeline.fail();
        self.registry.close_all();
        self.closed.cancel();
        self.set_state(ConnectionState::Errored);
        self.notifier.emit(GatewayEvent::ReconnectFailed {
            connection_id: self.id,
            attempts,
            reason,
        });
    }

    /// Graceful close: flush queued frames within the drain grace, then
    /// close every subscription.
    pub(crate) async fn close(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }

        self.set_state(ConnectionState::Closing);
        self.registry.drain();
        self.pipeline.cancel();
        self.shutdown.cancel();

        let supervisor = self.supervisor.lock().take();
        if let Some(mut supervisor) = supervisor {
            // The link flushes for at most the drain grace; allow the same
            // again for the close handshake.
            let limit = self.config.drain_grace() * 2;
            if timeout(limit, &mut supervisor).await.is_err() {
                warn!(
                    "Connection {} did not shut down within {:?}; aborting",
                    self.id, limit
                );
                supervisor.abort();
            }
        }

        self.registry.close_all();
        self.closed.cancel();
        self.set_state(ConnectionState::Closed);
    }

    /// Stop background work without waiting.
    pub(crate) fn abort(&self) {
        self.pipeline.cancel();
        self.shutdown.cancel();
        self.closed.cancel();
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use proven_transport_memory::{MemoryBroker, MemoryTransport};

    use crate::handler::{HandlerError, handler_fn};
    use crate::message::Message;

    fn session(broker: &MemoryBroker) -> Arc<Session> {
        Arc::new(Session::new(
            Arc::new(MemoryTransport::new(broker.clone())),
            Endpoint::parse("ws://broker.test").unwrap(),
            ConnectionOptions::new("ws://broker.test"),
            Credentials::None,
            GatewayConfig::default(),
            Arc::new(Notifier::new()),
        ))
    }

    fn user_subscriptions(broker: &MemoryBroker) -> Vec<String> {
        broker
            .subscriptions()
            .into_iter()
            .filter(|subject| !subject.starts_with("_INBOX."))
            .collect()
    }

    async fn wait_for_subscriptions(broker: &MemoryBroker, expected: &[&str]) {
        timeout(Duration::from_secs(5), async {
            while user_subscriptions(broker) != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Timed out waiting for broker subscriptions");
    }

    #[tokio::test]
    async fn test_unsubscribe_between_resubscribe_and_connected() {
        let broker = MemoryBroker::new();
        let session = session(&broker);
        let handler = handler_fn(|_message: Message| async { Ok::<(), HandlerError>(()) });
        let id = session.registry.insert("orders.*", Arc::new(handler)).unwrap();

        // A reconnect has re-issued SUB but not yet reported Connected
        session.set_state(ConnectionState::Reconnecting);
        let link = session.open_link().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Reconnecting);
        wait_for_subscriptions(&broker, &["orders.*"]).await;

        session.unsubscribe(id).await;
        assert!(session.subscriptions().is_empty());

        session.set_state(ConnectionState::Connected);
        session.start(link);

        wait_for_subscriptions(&broker, &[]).await;

        session.close().await;
        assert_eq!(session.state(), ConnectionState::Closed);
    }
}
