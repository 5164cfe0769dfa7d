//! An in-process broker speaking the client protocol

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use proven_transport::protocol::{ClientOp, ConnectInfo, Decoder, ServerInfo, ServerOp};
use proven_transport::subject::{subject_matches_pattern, validate_pattern, validate_subject};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default payload limit advertised in `INFO`
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Authentication the broker requires from clients
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BrokerAuth {
    /// Anyone may connect
    #[default]
    None,
    /// `auth_token` must match
    Token(String),
    /// `user` and `pass` must match
    UserPassword {
        /// Expected username
        user: String,
        /// Expected password
        pass: String,
    },
}

impl BrokerAuth {
    fn is_required(&self) -> bool {
        !matches!(self, Self::None)
    }

    fn accepts(&self, connect: &ConnectInfo) -> bool {
        match self {
            Self::None => true,
            Self::Token(token) => connect.auth_token.as_deref() == Some(token.as_str()),
            Self::UserPassword { user, pass } => {
                connect.user.as_deref() == Some(user.as_str())
                    && connect.pass.as_deref() == Some(pass.as_str())
            }
        }
    }
}

struct SubscriptionEntry {
    sid: u64,
    subject: String,
    remaining: Option<u64>,
}

struct SessionHandle {
    outbound: flume::Sender<Bytes>,
    token: CancellationToken,
    subscriptions: Vec<SubscriptionEntry>,
    echo: bool,
}

struct Inner {
    server_id: String,
    auth: RwLock<BrokerAuth>,
    max_payload: AtomicU64,
    refusing: AtomicBool,
    answer_heartbeats: AtomicBool,
    handshake_delay: RwLock<Option<Duration>>,
    denied: RwLock<Vec<String>>,
    paused: watch::Sender<bool>,
    sessions: Mutex<BTreeMap<u64, SessionHandle>>,
    next_session: AtomicU64,
    accepted: AtomicU64,
    published: AtomicU64,
}

/// In-process broker shared by every [`crate::MemoryTransport`] pointing at it
///
/// Besides routing, the broker exposes fault switches so callers can exercise
/// refused connections, lost links, missed heartbeats, slow handshakes,
/// rejected credentials and permission failures.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("server_id", &self.inner.server_id)
            .field("sessions", &self.inner.sessions.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a broker that requires no authentication
    #[must_use]
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                server_id: Uuid::new_v4().simple().to_string(),
                auth: RwLock::new(BrokerAuth::None),
                max_payload: AtomicU64::new(DEFAULT_MAX_PAYLOAD as u64),
                refusing: AtomicBool::new(false),
                answer_heartbeats: AtomicBool::new(true),
                handshake_delay: RwLock::new(None),
                denied: RwLock::new(Vec::new()),
                paused,
                sessions: Mutex::new(BTreeMap::new()),
                next_session: AtomicU64::new(1),
                accepted: AtomicU64::new(0),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Require the given authentication from new sessions.
    #[must_use]
    pub fn with_auth(self, auth: BrokerAuth) -> Self {
        *self.inner.auth.write() = auth;
        self
    }

    /// Advertise and enforce a payload limit.
    #[must_use]
    pub fn with_max_payload(self, max_payload: usize) -> Self {
        self.inner
            .max_payload
            .store(max_payload as u64, Ordering::SeqCst);
        self
    }

    /// Refuse (or accept again) new connections.
    pub fn set_refuse(&self, refuse: bool) {
        self.inner.refusing.store(refuse, Ordering::SeqCst);
    }

    /// Whether new connections are currently refused.
    #[must_use]
    pub fn is_refusing(&self) -> bool {
        self.inner.refusing.load(Ordering::SeqCst)
    }

    /// Answer (or ignore) `PING`s after the handshake.
    ///
    /// The `PING` that completes a handshake is always answered.
    pub fn set_answer_heartbeats(&self, answer: bool) {
        self.inner.answer_heartbeats.store(answer, Ordering::SeqCst);
    }

    /// Delay the `INFO` greeting of new sessions.
    pub fn set_handshake_delay(&self, delay: Option<Duration>) {
        *self.inner.handshake_delay.write() = delay;
    }

    /// Reject subscriptions to `subject` with a permissions violation.
    pub fn deny_subscribe(&self, subject: impl Into<String>) {
        self.inner.denied.write().push(subject.into());
    }

    /// Stop (or resume) reading from clients.
    ///
    /// While paused, client sends block once the link buffer is full.
    pub fn set_paused(&self, paused: bool) {
        self.inner.paused.send_replace(paused);
    }

    /// Abruptly drop every live session.
    pub fn sever_all(&self) {
        let sessions = self.inner.sessions.lock();
        info!("Memory broker severing {} session(s)", sessions.len());
        for session in sessions.values() {
            session.token.cancel();
        }
    }

    /// Send a server operation to every live session.
    pub async fn inject(&self, op: &ServerOp) {
        if let Ok(frame) = op.encode() {
            self.inject_raw(frame).await;
        }
    }

    /// Send bytes to every live session as they are, valid protocol or not.
    pub async fn inject_raw(&self, frame: Bytes) {
        let targets: Vec<flume::Sender<Bytes>> = self
            .inner
            .sessions
            .lock()
            .values()
            .map(|session| session.outbound.clone())
            .collect();
        for target in targets {
            let _ = target.send_async(frame.clone()).await;
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Number of sessions ever accepted.
    #[must_use]
    pub fn accepted_count(&self) -> u64 {
        self.inner.accepted.load(Ordering::SeqCst)
    }

    /// Number of `PUB`s routed.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Subjects subscribed across all live sessions, in session then sid order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner
            .sessions
            .lock()
            .values()
            .flat_map(|session| session.subscriptions.iter().map(|s| s.subject.clone()))
            .collect()
    }

    /// Attach a new session to a pair of link channels.
    pub(crate) fn open_session(
        &self,
        inbound: flume::Receiver<Bytes>,
        outbound: flume::Sender<Bytes>,
        token: CancellationToken,
    ) {
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        self.inner.accepted.fetch_add(1, Ordering::SeqCst);

        self.inner.sessions.lock().insert(
            id,
            SessionHandle {
                outbound: outbound.clone(),
                token: token.clone(),
                subscriptions: Vec::new(),
                echo: true,
            },
        );

        let session = Session {
            id,
            broker: self.clone(),
            outbound,
            token,
            connected: false,
            handshake_ponged: false,
            verbose: false,
        };
        tokio::spawn(session.run(inbound));
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            server_id: self.inner.server_id.clone(),
            server_name: "memory".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_payload: usize::try_from(self.inner.max_payload.load(Ordering::SeqCst))
                .unwrap_or(usize::MAX),
            auth_required: self.inner.auth.read().is_required(),
            tls_required: false,
            headers: false,
        }
    }

    fn is_denied(&self, subject: &str) -> bool {
        self.inner
            .denied
            .read()
            .iter()
            .any(|denied| denied == subject || subject_matches_pattern(subject, denied))
    }

    /// Collect one `MSG` frame per matching subscription.
    fn route(
        &self,
        from: u64,
        subject: &str,
        reply_to: Option<&String>,
        payload: &Bytes,
    ) -> Vec<(flume::Sender<Bytes>, Bytes)> {
        let mut deliveries = Vec::new();
        let mut sessions = self.inner.sessions.lock();

        for (id, session) in sessions.iter_mut() {
            if *id == from && !session.echo {
                continue;
            }

            for entry in &mut session.subscriptions {
                if !subject_matches_pattern(subject, &entry.subject) {
                    continue;
                }

                let op = ServerOp::Msg {
                    subject: subject.to_string(),
                    sid: entry.sid,
                    reply_to: reply_to.cloned(),
                    payload: payload.clone(),
                };
                if let Ok(frame) = op.encode() {
                    deliveries.push((session.outbound.clone(), frame));
                }
                if let Some(remaining) = entry.remaining.as_mut() {
                    *remaining = remaining.saturating_sub(1);
                }
            }

            session
                .subscriptions
                .retain(|entry| entry.remaining != Some(0));
        }

        deliveries
    }
}

/// Outcome of handling one client operation
enum Flow {
    Continue,
    Close,
}

struct Session {
    id: u64,
    broker: MemoryBroker,
    outbound: flume::Sender<Bytes>,
    token: CancellationToken,
    connected: bool,
    handshake_ponged: bool,
    verbose: bool,
}

impl Session {
    async fn run(mut self, inbound: flume::Receiver<Bytes>) {
        let delay = *self.broker.inner.handshake_delay.read();
        if let Some(delay) = delay {
            tokio::select! {
                () = self.token.cancelled() => {
                    self.finish();
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        let greeting = ServerOp::Info(Box::new(self.broker.server_info()));
        if self.send(&greeting).await {
            self.read_loop(inbound).await;
        }

        self.finish();
    }

    async fn read_loop(&mut self, inbound: flume::Receiver<Bytes>) {
        let mut decoder = Decoder::new();

        loop {
            let mut paused = self.broker.inner.paused.subscribe();
            tokio::select! {
                biased;
                () = self.token.cancelled() => return,
                resumed = async { paused.wait_for(|paused| !*paused).await.is_ok() } => {
                    if !resumed {
                        return;
                    }
                }
            }

            let chunk = tokio::select! {
                biased;
                () = self.token.cancelled() => return,
                chunk = inbound.recv_async() => match chunk {
                    Ok(chunk) => chunk,
                    Err(_) => return,
                },
            };

            decoder.extend(&chunk);
            loop {
                match decoder.next_client_op() {
                    Ok(Some(op)) => {
                        if matches!(self.handle(op).await, Flow::Close) {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Memory broker session {} protocol error: {}", self.id, e);
                        self.send(&ServerOp::Err("Unknown Protocol Operation".to_string()))
                            .await;
                        return;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, op: ClientOp) -> Flow {
        let requires_auth = self.broker.inner.auth.read().is_required();
        if !self.connected && requires_auth && !matches!(op, ClientOp::Connect(_)) {
            return self.reject("Authorization Violation").await;
        }

        match op {
            ClientOp::Connect(info) => {
                let accepted = self.broker.inner.auth.read().accepts(&info);
                if !accepted {
                    warn!("Memory broker session {} failed authentication", self.id);
                    return self.reject("Authorization Violation").await;
                }
                self.connected = true;
                self.verbose = info.verbose;
                if let Some(session) = self.broker.inner.sessions.lock().get_mut(&self.id) {
                    session.echo = info.echo;
                }
                debug!(
                    "Memory broker session {} connected as {:?}",
                    self.id, info.name
                );
                self.ack().await;
            }
            ClientOp::Ping => {
                let answer =
                    !self.handshake_ponged || self.broker.inner.answer_heartbeats.load(Ordering::SeqCst);
                self.handshake_ponged = true;
                if answer {
                    self.send(&ServerOp::Pong).await;
                }
            }
            ClientOp::Pong => {}
            ClientOp::Sub { subject, sid } => {
                if validate_pattern(&subject).is_err() {
                    self.send(&ServerOp::Err("Invalid Subject".to_string())).await;
                    return Flow::Continue;
                }
                if self.broker.is_denied(&subject) {
                    self.send(&ServerOp::Err(format!(
                        "Permissions Violation for Subscription to \"{subject}\""
                    )))
                    .await;
                    return Flow::Continue;
                }

                if let Some(session) = self.broker.inner.sessions.lock().get_mut(&self.id) {
                    session.subscriptions.retain(|entry| entry.sid != sid);
                    session.subscriptions.push(SubscriptionEntry {
                        sid,
                        subject,
                        remaining: None,
                    });
                }
                self.ack().await;
            }
            ClientOp::Unsub { sid, max_msgs } => {
                if let Some(session) = self.broker.inner.sessions.lock().get_mut(&self.id) {
                    match max_msgs {
                        Some(max) if max > 0 => {
                            if let Some(entry) =
                                session.subscriptions.iter_mut().find(|e| e.sid == sid)
                            {
                                entry.remaining = Some(max);
                            }
                        }
                        _ => session.subscriptions.retain(|entry| entry.sid != sid),
                    }
                }
                self.ack().await;
            }
            ClientOp::Pub {
                subject,
                reply_to,
                payload,
            } => {
                if validate_subject(&subject).is_err() {
                    self.send(&ServerOp::Err("Invalid Publish Subject".to_string()))
                        .await;
                    return Flow::Continue;
                }
                let max_payload = self.broker.inner.max_payload.load(Ordering::SeqCst);
                if payload.len() as u64 > max_payload {
                    return self.reject("Maximum Payload Violation").await;
                }

                self.broker.inner.published.fetch_add(1, Ordering::SeqCst);
                let deliveries = self
                    .broker
                    .route(self.id, &subject, reply_to.as_ref(), &payload);
                for (target, frame) in deliveries {
                    let _ = target.send_async(frame).await;
                }
                self.ack().await;
            }
        }

        Flow::Continue
    }

    async fn reject(&self, message: &str) -> Flow {
        self.send(&ServerOp::Err(message.to_string())).await;
        Flow::Close
    }

    async fn ack(&self) {
        if self.verbose {
            self.send(&ServerOp::Ok).await;
        }
    }

    async fn send(&self, op: &ServerOp) -> bool {
        let Ok(frame) = op.encode() else {
            return false;
        };
        tokio::select! {
            biased;
            () = self.token.cancelled() => false,
            sent = self.outbound.send_async(frame) => sent.is_ok(),
        }
    }

    fn finish(&self) {
        self.broker.inner.sessions.lock().remove(&self.id);
        self.token.cancel();
        debug!("Memory broker session {} ended", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_auth() {
        let auth = BrokerAuth::Token("tok".to_string());
        let mut connect = ConnectInfo::default();
        assert!(!auth.accepts(&connect));

        connect.auth_token = Some("tok".to_string());
        assert!(auth.accepts(&connect));

        connect.auth_token = Some("other".to_string());
        assert!(!auth.accepts(&connect));
    }

    #[test]
    fn test_user_password_auth() {
        let auth = BrokerAuth::UserPassword {
            user: "alice".to_string(),
            pass: "secret".to_string(),
        };
        let connect = ConnectInfo {
            user: Some("alice".to_string()),
            pass: Some("secret".to_string()),
            ..ConnectInfo::default()
        };
        assert!(auth.accepts(&connect));
        assert!(auth.is_required());
        assert!(!BrokerAuth::None.is_required());
    }

    #[test]
    fn test_denied_subjects() {
        let broker = MemoryBroker::new();
        broker.deny_subscribe("secret.>");
        assert!(broker.is_denied("secret.>"));
        assert!(broker.is_denied("secret.plans"));
        assert!(!broker.is_denied("public.plans"));
    }
}
