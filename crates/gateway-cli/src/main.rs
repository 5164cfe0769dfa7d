//! CLI binary to talk to a NATS-style broker through the messaging gateway.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use proven_messaging_gateway::{
    ConnectionOptions, Gateway, GatewayConfig, GatewayError, GatewayEvent, HandlerError, Message,
    PublishOptions, handler_fn,
};
use proven_transport::{Endpoint, EndpointError, TransportError};
use proven_transport_ws::{DEFAULT_PROBE_TIMEOUT, WebSocketTransport, probe};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Gateway error
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Endpoint could not be parsed
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    /// Probe failed
    #[error("probe failed: {0}")]
    Probe(#[from] TransportError),

    /// Output could not be rendered
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that a broker endpoint accepts WebSocket connections
    Probe {
        /// Broker URL (ws:// or wss://)
        #[arg(long, env = "PROVEN_GATEWAY_URL")]
        url: String,

        /// How long to wait for the upgrade and greeting
        #[arg(
            long,
            default_value_t = DEFAULT_PROBE_TIMEOUT.as_secs() * 1000,
            env = "PROVEN_GATEWAY_PROBE_WAIT_MS"
        )]
        wait_ms: u64,
    },

    /// Publish one message
    Publish {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Subject to publish to
        subject: String,

        /// Message payload
        payload: String,

        /// Subject the receiver should reply to
        #[arg(long, conflicts_with = "request_timeout_ms")]
        reply_to: Option<String>,

        /// Wait this long for a reply
        #[arg(long)]
        request_timeout_ms: Option<u64>,
    },

    /// Make a subject known by publishing a marker message
    CreateTopic {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Subject to create
        subject: String,
    },

    /// Print messages matching a pattern as JSON lines
    Subscribe {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Subject pattern (`*` matches one token, a trailing `>` the rest)
        pattern: String,

        /// Stop after this many messages
        #[arg(long)]
        count: Option<u64>,
    },
}

#[derive(Clone, Debug, Args)]
struct ConnectionArgs {
    /// Broker URL (ws:// or wss://)
    #[arg(long, env = "PROVEN_GATEWAY_URL")]
    url: String,

    /// Authentication token
    #[arg(long, env = "PROVEN_GATEWAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Username for user/password authentication
    #[arg(long, env = "PROVEN_GATEWAY_USERNAME", conflicts_with = "token")]
    username: Option<String>,

    /// Password for user/password authentication
    #[arg(long, env = "PROVEN_GATEWAY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Handshake timeout
    #[arg(long, default_value_t = 30_000, env = "PROVEN_GATEWAY_TIMEOUT_MS")]
    timeout_ms: u64,

    /// Reconnect attempts before giving up
    #[arg(long, default_value_t = 10, env = "PROVEN_GATEWAY_MAX_RECONNECT_ATTEMPTS")]
    max_reconnect_attempts: u32,

    /// Name announced to the broker
    #[arg(long, default_value = "proven-gateway", env = "PROVEN_GATEWAY_CLIENT_NAME")]
    client_name: String,
}

impl ConnectionArgs {
    fn options(&self) -> ConnectionOptions {
        let mut options = ConnectionOptions::new(&self.url);
        options.token.clone_from(&self.token);
        options.username.clone_from(&self.username);
        options.password.clone_from(&self.password);
        options.timeout_ms = self.timeout_ms;
        options.max_reconnect_attempts = self.max_reconnect_attempts;
        options
    }

    fn gateway(&self) -> Gateway<WebSocketTransport> {
        Gateway::with_config(
            WebSocketTransport::new(),
            GatewayConfig {
                client_name: self.client_name.clone(),
                ..GatewayConfig::default()
            },
        )
    }

    async fn connect(&self) -> Result<Gateway<WebSocketTransport>, Error> {
        let gateway = self.gateway();
        let id = gateway.connect(self.options()).await?;
        info!("Connected to {} as {}", self.url, id);
        Ok(gateway)
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received interrupt signal");
        signal_shutdown.cancel();
    });

    let result = run(cli.command, shutdown).await;
    if let Err(Error::Gateway(e)) = &result {
        error!("{}", e.friendly_message());
    }
    result
}

async fn run(command: Command, shutdown: CancellationToken) -> Result<(), Error> {
    match command {
        Command::Probe { url, wait_ms } => {
            let endpoint = Endpoint::parse(&url)?;
            let report = probe(&endpoint, Duration::from_millis(wait_ms)).await?;
            let output = json!({
                "endpoint": report.endpoint,
                "secure": report.secure,
                "elapsed_ms": u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
                "broker": report.is_broker(),
                "server_info": report.server_info,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Command::Publish {
            connection,
            subject,
            payload,
            reply_to,
            request_timeout_ms,
        } => {
            let options = match (reply_to, request_timeout_ms) {
                (_, Some(ms)) => PublishOptions::request(Duration::from_millis(ms)),
                (Some(reply_to), None) => PublishOptions::reply_to(reply_to),
                (None, None) => PublishOptions::default(),
            };

            let gateway = connection.connect().await?;
            let result = gateway.publish(&subject, payload, options).await;
            gateway.disconnect().await;
            let receipt = result?;

            let output = json!({
                "connection_id": receipt.connection_id,
                "sequence": receipt.sequence,
                "subject": receipt.subject,
                "payload_len": receipt.payload_len,
                "reply": receipt.reply.as_ref().map(render),
            });
            println!("{}", serde_json::to_string(&output)?);
            Ok(())
        }
        Command::CreateTopic {
            connection,
            subject,
        } => {
            let gateway = connection.connect().await?;
            let result = gateway.create_topic(&subject).await;
            gateway.disconnect().await;
            result?;

            info!("Created topic '{}'", subject);
            Ok(())
        }
        Command::Subscribe {
            connection,
            pattern,
            count,
        } => subscribe(&connection, &pattern, count, &shutdown).await,
    }
}

async fn subscribe(
    connection: &ConnectionArgs,
    pattern: &str,
    count: Option<u64>,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    let gateway = connection.connect().await?;
    let mut events = gateway.events();

    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let handler = handler_fn(move |message: Message| {
        let tx = tx.clone();
        async move { tx.send(message).await.map_err(HandlerError::new) }
    });
    let id = gateway.subscribe(pattern, handler).await?;
    info!("Listening on '{}' (subscription {})", pattern, id);

    let mut received = 0u64;
    let outcome = loop {
        if count.is_some_and(|count| received >= count) {
            break Ok(());
        }

        tokio::select! {
            () = shutdown.cancelled() => break Ok(()),
            message = rx.recv() => {
                let Some(message) = message else {
                    break Ok(());
                };
                received += 1;
                match serde_json::to_string(&render(&message)) {
                    Ok(line) => println!("{line}"),
                    Err(e) => break Err(Error::Output(e)),
                }
            }
            event = events.recv() => match event {
                Ok(GatewayEvent::ReconnectAttempt { attempt, delay, .. }) => {
                    warn!("Connection lost; reconnect attempt {} in {:?}", attempt, delay);
                }
                Ok(GatewayEvent::Reconnected { attempt, .. }) => {
                    info!("Reconnected after {} attempt(s)", attempt);
                }
                Ok(GatewayEvent::ReconnectFailed { reason, .. }) => {
                    error!("Giving up: {}", reason);
                    break Err(Error::Gateway(GatewayError::NotConnected));
                }
                Ok(GatewayEvent::SubscriptionFailed { reason, .. }) => {
                    error!("Subscription rejected: {}", reason);
                    break Err(Error::Gateway(GatewayError::NotConnected));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };

    gateway.disconnect().await;
    outcome
}

fn render(message: &Message) -> serde_json::Value {
    json!({
        "subject": message.subject,
        "reply_to": message.reply_to,
        "sequence": message.sequence,
        "payload": String::from_utf8_lossy(&message.payload),
    })
}
