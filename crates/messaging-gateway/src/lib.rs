//! Publish/subscribe gateway for NATS-style brokers
//!
//! A [`Gateway`] owns one logical connection to a broker reached through any
//! [`Transport`](proven_transport::Transport). It validates and publishes
//! messages, routes inbound messages to subscription handlers by subject
//! pattern, and keeps the connection alive with heartbeats and reconnection
//! with capped exponential backoff. Subscriptions survive reconnects.
//!
//! Subjects are dot-separated tokens. Patterns may use `*` for exactly one
//! token and a trailing `>` for one or more tokens.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod connector;
mod error;
mod events;
mod gateway;
mod handler;
mod message;
mod publish;
mod registry;
mod router;
mod session;

pub use config::{BackpressureMode, ConnectionOptions, Credentials, GatewayConfig};
pub use error::{GatewayError, GatewayResult};
pub use events::{ConnectionState, GatewayEvent, GatewayState};
pub use gateway::{Gateway, GatewaySnapshot, TOPIC_CREATED_PAYLOAD};
pub use handler::{FnHandler, HandlerError, MessageHandler, handler_fn};
pub use message::{
    ConnectionId, Message, PublishOptions, PublishReceipt, SubscriptionId, SubscriptionInfo,
    SubscriptionState,
};
pub use router::SubjectRouter;
pub use session::ConnectionSnapshot;
