//! Subscription registry
//!
//! Owns every subscription of one connection together with the subject
//! router indexing them. The lock is never held while a handler runs, so
//! handlers may call back into the gateway.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::RwLock;
use proven_transport::subject::validate_pattern;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::events::{GatewayEvent, Notifier};
use crate::handler::MessageHandler;
use crate::message::{Message, SubscriptionId, SubscriptionInfo, SubscriptionState};
use crate::router::SubjectRouter;

/// A `MSG` as received from the broker
#[derive(Clone, Debug)]
pub(crate) struct InboundMessage {
    pub subject: String,
    pub sid: u64,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

struct Entry {
    pattern: String,
    handler: Arc<dyn MessageHandler>,
    state: SubscriptionState,
    sequence: u64,
    delivered: u64,
    failed: u64,
}

#[derive(Default)]
struct RegistryInner {
    entries: BTreeMap<SubscriptionId, Entry>,
    router: SubjectRouter,
    closed: bool,
}

pub(crate) struct SubscriptionRegistry {
    inner: RwLock<RegistryInner>,
    next_id: AtomicU64,
    handler_timeout: Duration,
    notifier: Arc<Notifier>,
}

impl SubscriptionRegistry {
    pub(crate) fn new(handler_timeout: Duration, notifier: Arc<Notifier>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            // sid 0 belongs to the reply inbox
            next_id: AtomicU64::new(1),
            handler_timeout,
            notifier,
        }
    }

    /// Register a handler under `pattern`.
    pub(crate) fn insert(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> GatewayResult<SubscriptionId> {
        validate_pattern(pattern).map_err(|e| GatewayError::invalid_pattern(pattern, e))?;

        let mut inner = self.inner.write();
        if inner.closed {
            return Err(GatewayError::NotConnected);
        }
        if inner.entries.values().any(|entry| entry.pattern == pattern) {
            return Err(GatewayError::DuplicatePattern(pattern.to_string()));
        }

        let id = SubscriptionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        inner.router.index(id, pattern)?;
        inner.entries.insert(
            id,
            Entry {
                pattern: pattern.to_string(),
                handler,
                state: SubscriptionState::Active,
                sequence: 0,
                delivered: 0,
                failed: 0,
            },
        );

        debug!(
            "Registered subscription {} on '{}' ({} indexed)",
            id,
            pattern,
            inner.router.len()
        );
        Ok(id)
    }

    /// Remove a subscription. Returns its pattern if it was registered.
    pub(crate) fn remove(&self, id: SubscriptionId) -> Option<String> {
        let mut inner = self.inner.write();
        let entry = inner.entries.remove(&id)?;
        inner.router.deindex(id);
        let remaining = inner.router.len();
        drop(inner);

        debug!(
            "Removed subscription {} on '{}' ({} indexed)",
            id, entry.pattern, remaining
        );
        Some(entry.pattern)
    }

    /// Close the subscription the broker refused for `subject`.
    pub(crate) fn fail_subject(&self, subject: &str, reason: &str) -> Option<SubscriptionId> {
        let mut inner = self.inner.write();
        let id = inner
            .entries
            .iter()
            .find(|(_, entry)| entry.pattern == subject)
            .map(|(id, _)| *id)?;
        let entry = inner.entries.remove(&id)?;
        inner.router.deindex(id);
        drop(inner);

        warn!(
            "Subscription {} on '{}' rejected by broker: {}",
            id, entry.pattern, reason
        );
        self.notifier.emit(GatewayEvent::SubscriptionFailed {
            id,
            pattern: entry.pattern,
            reason: reason.to_string(),
        });
        Some(id)
    }

    /// Active subscriptions to re-issue on a fresh link, in registration order.
    pub(crate) fn active(&self) -> Vec<(SubscriptionId, String)> {
        self.inner
            .read()
            .entries
            .iter()
            .filter(|(_, entry)| entry.state == SubscriptionState::Active)
            .map(|(id, entry)| (*id, entry.pattern.clone()))
            .collect()
    }

    /// Deliver one inbound message to the handler of its sid.
    ///
    /// The broker sends one `MSG` per matching subscription, so a message is
    /// only handed to its sid's handler if the router still matches that sid
    /// for the subject.
    pub(crate) async fn deliver(&self, inbound: InboundMessage) {
        let sid = SubscriptionId::new(inbound.sid);

        let (handler, sequence) = {
            let mut inner = self.inner.write();
            if inner.closed || !inner.router.matches(&inbound.subject).contains(&sid) {
                debug!(
                    "Dropping message on '{}' for inactive sid {}",
                    inbound.subject, sid
                );
                return;
            }
            let Some(entry) = inner.entries.get_mut(&sid) else {
                return;
            };
            if entry.state == SubscriptionState::Closed {
                return;
            }
            entry.sequence += 1;
            (entry.handler.clone(), entry.sequence)
        };

        let subject = inbound.subject.clone();
        let message = Message {
            subject: inbound.subject,
            payload: inbound.payload,
            reply_to: inbound.reply_to,
            sequence: Some(sequence),
        };

        let outcome = timeout(
            self.handler_timeout,
            AssertUnwindSafe(handler.handle(message)).catch_unwind(),
        )
        .await;

        let failure = match outcome {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => {
                warn!("Handler for subscription {} failed on '{}': {}", sid, subject, e);
                Some(e.to_string())
            }
            Ok(Err(panic)) => {
                let reason = format!("handler panicked: {}", panic_message(panic.as_ref()));
                error!("Handler for subscription {} on '{}': {}", sid, subject, reason);
                Some(reason)
            }
            Err(_) => {
                let reason = format!("handler timed out after {:?}", self.handler_timeout);
                warn!("Handler for subscription {} on '{}': {}", sid, subject, reason);
                Some(reason)
            }
        };

        if let Some(entry) = self.inner.write().entries.get_mut(&sid) {
            if failure.is_some() {
                entry.failed += 1;
            } else {
                entry.delivered += 1;
            }
        }

        if let Some(reason) = failure {
            self.notifier.emit(GatewayEvent::DeliveryFailed {
                id: sid,
                subject,
                reason,
            });
        }
    }

    /// Mark every active subscription as draining.
    pub(crate) fn drain(&self) {
        let mut inner = self.inner.write();
        for entry in inner.entries.values_mut() {
            if entry.state == SubscriptionState::Active {
                entry.state = SubscriptionState::Draining;
            }
        }
    }

    /// Close every subscription; no handler runs afterwards.
    pub(crate) fn close_all(&self) {
        let removed: Vec<(SubscriptionId, String)> = {
            let mut inner = self.inner.write();
            inner.closed = true;
            inner.router.clear();
            std::mem::take(&mut inner.entries)
                .into_iter()
                .map(|(id, entry)| (id, entry.pattern))
                .collect()
        };

        if !removed.is_empty() {
            debug!("Closed {} subscription(s)", removed.len());
        }
        for (id, pattern) in removed {
            self.notifier
                .emit(GatewayEvent::SubscriptionRemoved { id, pattern });
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<SubscriptionInfo> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|(id, entry)| SubscriptionInfo {
                id: *id,
                pattern: entry.pattern.clone(),
                state: entry.state,
                delivered: entry.delivered,
                failed: entry.failed,
            })
            .collect()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
