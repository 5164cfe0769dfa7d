//! Connection options and gateway tuning

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

const REDACTED: &str = "***";

/// Options for a single `connect` call
///
/// Keys (de)serialize in camelCase so options can be read straight from the
/// UI's JSON form state.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// `ws://` or `wss://` URL of the broker
    pub endpoint: String,

    /// Token authentication (exclusive with username/password)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Username authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password for `username`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Bound on the whole handshake
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Reconnect attempts after an unexpected link loss (0 disables)
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Delay before the first reconnect attempt, doubled for each further one
    #[serde(default = "default_reconnect_base_interval_ms")]
    pub reconnect_base_interval_ms: u64,

    /// Interval between liveness probes
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Unanswered probes tolerated before the link is declared dead
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
}

const fn default_timeout_ms() -> u64 {
    30_000
}

const fn default_max_reconnect_attempts() -> u32 {
    10
}

const fn default_reconnect_base_interval_ms() -> u64 {
    2_000
}

const fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

const fn default_max_missed_heartbeats() -> u32 {
    3
}

impl ConnectionOptions {
    /// Options for `endpoint` with every other key at its default.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
            username: None,
            password: None,
            timeout_ms: default_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_interval_ms: default_reconnect_base_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
        }
    }

    /// Authenticate with a token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Authenticate with username and password.
    #[must_use]
    pub fn with_user_password(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Bound the handshake.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = duration_ms(timeout);
        self
    }

    /// Configure reconnection.
    #[must_use]
    pub fn with_reconnect(mut self, max_attempts: u32, base_interval: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_base_interval_ms = duration_ms(base_interval);
        self
    }

    /// Configure heartbeats.
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, max_missed: u32) -> Self {
        self.heartbeat_interval_ms = duration_ms(interval);
        self.max_missed_heartbeats = max_missed;
        self
    }

    /// The handshake bound.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Delay before reconnect `attempt` (1-based): the base interval doubled
    /// for each earlier attempt, capped at `max`.
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32, max: Duration) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let millis = self
            .reconnect_base_interval_ms
            .saturating_mul(1_u64 << shift);
        Duration::from_millis(millis).min(max)
    }

    /// Resolve the credential keys into a single credential.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidCredentials`] if a token is combined
    /// with a username or password, or a password is given without a
    /// username.
    pub fn credentials(&self) -> GatewayResult<Credentials> {
        match (&self.token, &self.username, &self.password) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(GatewayError::InvalidCredentials(
                "token and username/password are mutually exclusive".to_string(),
            )),
            (Some(token), None, None) => Ok(Credentials::Token(token.clone())),
            (None, Some(username), password) => Ok(Credentials::UserPassword {
                username: username.clone(),
                password: password.clone().unwrap_or_default(),
            }),
            (None, None, Some(_)) => Err(GatewayError::InvalidCredentials(
                "password given without a username".to_string(),
            )),
            (None, None, None) => Ok(Credentials::None),
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| REDACTED))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .field("timeout_ms", &self.timeout_ms)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field(
                "reconnect_base_interval_ms",
                &self.reconnect_base_interval_ms,
            )
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("max_missed_heartbeats", &self.max_missed_heartbeats)
            .finish()
    }
}

/// Resolved authentication
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// No authentication
    None,
    /// Token authentication
    Token(String),
    /// Username and password authentication
    UserPassword {
        /// Username
        username: String,
        /// Password (may be empty)
        password: String,
    },
}

impl Credentials {
    /// Name of the authentication mode, safe to log.
    #[must_use]
    pub const fn mode(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Token(_) => "token",
            Self::UserPassword { .. } => "username/password",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Token(_) => f.debug_tuple("Token").field(&REDACTED).finish(),
            Self::UserPassword { username, .. } => f
                .debug_struct("UserPassword")
                .field("username", username)
                .field("password", &REDACTED)
                .finish(),
        }
    }
}

/// What `publish` does when the outbound queue is full
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    /// Wait for capacity, bounded by `publish_timeout_ms`
    #[default]
    Block,
    /// Fail immediately with `Overloaded`
    Fail,
}

/// Gateway-wide tuning
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Outbound frames buffered between callers and the link
    pub outbound_queue_size: usize,
    /// Inbound messages buffered between the link and handlers
    pub dispatch_queue_size: usize,
    /// Behaviour when the outbound queue is full
    pub backpressure: BackpressureMode,
    /// Bound on a blocked publish (`None` waits until the connection settles)
    pub publish_timeout_ms: Option<u64>,
    /// Time allowed to flush queued frames on disconnect
    pub drain_grace_ms: u64,
    /// Cap on the reconnect backoff
    pub max_reconnect_interval_ms: u64,
    /// Bound on a single handler invocation
    pub handler_timeout_ms: u64,
    /// Client name sent in `CONNECT`
    pub client_name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            outbound_queue_size: 1024,
            dispatch_queue_size: 1024,
            backpressure: BackpressureMode::Block,
            publish_timeout_ms: None,
            drain_grace_ms: 2000,              // 2 seconds
            max_reconnect_interval_ms: 60_000, // 1 minute
            handler_timeout_ms: 10_000,        // 10 seconds
            client_name: "proven-messaging-gateway".to_string(),
        }
    }
}

impl GatewayConfig {
    pub(crate) fn publish_timeout(&self) -> Option<Duration> {
        self.publish_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) const fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub(crate) const fn max_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_interval_ms)
    }

    pub(crate) const fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_json() {
        let options: ConnectionOptions =
            serde_json::from_str(r#"{"endpoint":"wss://broker.test:8443","token":"tok"}"#)
                .unwrap();

        assert_eq!(options.timeout_ms, 30_000);
        assert_eq!(options.max_reconnect_attempts, 10);
        assert_eq!(options.reconnect_base_interval_ms, 2_000);
        assert_eq!(options.heartbeat_interval_ms, 30_000);
        assert_eq!(options.max_missed_heartbeats, 3);
        assert_eq!(options, ConnectionOptions::new("wss://broker.test:8443").with_token("tok"));
    }

    #[test]
    fn test_camel_case_keys() {
        let options: ConnectionOptions = serde_json::from_str(
            r#"{"endpoint":"ws://b","timeoutMs":5000,"maxReconnectAttempts":0,"heartbeatIntervalMs":100,"maxMissedHeartbeats":1,"reconnectBaseIntervalMs":10}"#,
        )
        .unwrap();

        assert_eq!(options.timeout(), Duration::from_secs(5));
        assert_eq!(options.max_reconnect_attempts, 0);
        assert_eq!(options.heartbeat_interval(), Duration::from_millis(100));
        assert_eq!(options.max_missed_heartbeats, 1);
        assert_eq!(options.reconnect_base_interval_ms, 10);
    }

    #[test]
    fn test_credentials_are_exclusive() {
        let both = ConnectionOptions::new("ws://b")
            .with_token("tok")
            .with_user_password("alice", "secret");
        assert!(matches!(
            both.credentials(),
            Err(GatewayError::InvalidCredentials(_))
        ));

        let mut orphan_password = ConnectionOptions::new("ws://b");
        orphan_password.password = Some("secret".to_string());
        assert!(orphan_password.credentials().is_err());

        let mut no_password = ConnectionOptions::new("ws://b");
        no_password.username = Some("alice".to_string());
        assert_eq!(
            no_password.credentials().unwrap(),
            Credentials::UserPassword {
                username: "alice".to_string(),
                password: String::new(),
            }
        );

        assert_eq!(
            ConnectionOptions::new("ws://b").credentials().unwrap(),
            Credentials::None
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let options = ConnectionOptions::new("ws://b").with_user_password("alice", "hunter2");
        let rendered = format!("{options:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));

        let token = ConnectionOptions::new("ws://b").with_token("s3cret");
        assert!(!format!("{token:?}").contains("s3cret"));
        assert!(!format!("{:?}", token.credentials().unwrap()).contains("s3cret"));
    }

    #[test]
    fn test_reconnect_backoff() {
        let options = ConnectionOptions::new("ws://b")
            .with_reconnect(10, Duration::from_millis(2_000));
        let cap = Duration::from_secs(60);

        assert_eq!(options.reconnect_delay(1, cap), Duration::from_secs(2));
        assert_eq!(options.reconnect_delay(2, cap), Duration::from_secs(4));
        assert_eq!(options.reconnect_delay(3, cap), Duration::from_secs(8));
        assert_eq!(options.reconnect_delay(6, cap), Duration::from_secs(60));
        assert_eq!(options.reconnect_delay(40, cap), Duration::from_secs(60));
    }
}
