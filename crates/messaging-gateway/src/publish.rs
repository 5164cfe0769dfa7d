//! Publish pipeline
//!
//! Validates and frames outbound messages and queues them for the link task.
//! Request-reply runs over a single wildcard inbox subscription per
//! connection; replies are matched to waiters by their reply subject.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use proven_transport::protocol::ClientOp;
use proven_transport::subject::validate_subject;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{BackpressureMode, GatewayConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::message::{ConnectionId, Message, PublishOptions, PublishReceipt};
use crate::registry::InboundMessage;

pub(crate) struct PublishPipeline {
    connection_id: ConnectionId,
    sequence: AtomicU64,
    outbound: flume::Sender<Bytes>,
    backpressure: BackpressureMode,
    publish_timeout: Option<Duration>,
    max_payload: AtomicUsize,
    inbox_prefix: String,
    next_reply: AtomicU64,
    pending: DashMap<String, oneshot::Sender<Message>>,
    /// Fired by `disconnect`
    cancelled: CancellationToken,
    /// Fired when reconnection is exhausted
    failed: CancellationToken,
}

impl PublishPipeline {
    pub(crate) fn new(
        connection_id: ConnectionId,
        outbound: flume::Sender<Bytes>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            connection_id,
            sequence: AtomicU64::new(0),
            outbound,
            backpressure: config.backpressure,
            publish_timeout: config.publish_timeout(),
            max_payload: AtomicUsize::new(0),
            inbox_prefix: connection_id.inbox_prefix(),
            next_reply: AtomicU64::new(1),
            pending: DashMap::new(),
            cancelled: CancellationToken::new(),
            failed: CancellationToken::new(),
        }
    }

    /// Pattern of the connection's reply inbox subscription.
    pub(crate) fn inbox_pattern(&self) -> String {
        format!("{}.*", self.inbox_prefix)
    }

    /// Apply the broker's payload limit (0 = unknown, not enforced).
    pub(crate) fn set_max_payload(&self, max_payload: usize) {
        self.max_payload.store(max_payload, Ordering::SeqCst);
    }

    pub(crate) fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub(crate) async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> GatewayResult<PublishReceipt> {
        validate_subject(subject).map_err(|e| GatewayError::invalid_subject(subject, e))?;
        if let Some(reply_to) = &options.reply_to {
            validate_subject(reply_to).map_err(|e| GatewayError::invalid_subject(reply_to, e))?;
        }

        let max = self.max_payload.load(Ordering::SeqCst);
        if max > 0 && payload.len() > max {
            return Err(GatewayError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let payload_len = payload.len();

        // A request replaces any explicit reply subject with an inbox subject
        let (reply_to, waiter) = match options.await_reply {
            Some(wait) => {
                let inbox = format!(
                    "{}.{}",
                    self.inbox_prefix,
                    self.next_reply.fetch_add(1, Ordering::SeqCst)
                );
                let (tx, rx) = oneshot::channel();
                self.pending.insert(inbox.clone(), tx);
                (Some(inbox), Some((rx, wait)))
            }
            None => (options.reply_to, None),
        };

        let frame = ClientOp::Pub {
            subject: subject.to_string(),
            reply_to: reply_to.clone(),
            payload,
        }
        .encode()
        .map_err(|e| GatewayError::Unknown(e.to_string()))?;

        if let Err(e) = self.enqueue(frame, self.backpressure).await {
            if waiter.is_some() {
                if let Some(inbox) = &reply_to {
                    self.pending.remove(inbox);
                }
            }
            return Err(e);
        }

        trace!(
            "Queued publish #{} to '{}' ({} bytes)",
            sequence, subject, payload_len
        );

        let reply = match (waiter, reply_to) {
            (Some((rx, wait)), Some(inbox)) => {
                let reply = self.await_reply(&inbox, rx, wait).await;
                self.pending.remove(&inbox);
                Some(reply?)
            }
            _ => None,
        };

        Ok(PublishReceipt {
            connection_id: self.connection_id,
            sequence,
            subject: subject.to_string(),
            payload_len,
            reply,
        })
    }

    async fn await_reply(
        &self,
        inbox: &str,
        rx: oneshot::Receiver<Message>,
        wait: Duration,
    ) -> GatewayResult<Message> {
        tokio::select! {
            biased;
            () = self.cancelled.cancelled() => Err(GatewayError::Cancelled),
            () = self.failed.cancelled() => Err(GatewayError::NotConnected),
            reply = timeout(wait, rx) => match reply {
                Ok(Ok(message)) => Ok(message),
                Ok(Err(_)) => Err(self.closed_error()),
                Err(_) => Err(GatewayError::Timeout(format!(
                    "no reply on '{inbox}' within {wait:?}"
                ))),
            },
        }
    }

    /// Queue a control frame, waiting for capacity.
    pub(crate) async fn enqueue_control(&self, frame: Bytes) -> GatewayResult<()> {
        self.enqueue(frame, BackpressureMode::Block).await
    }

    async fn enqueue(&self, frame: Bytes, mode: BackpressureMode) -> GatewayResult<()> {
        if self.cancelled.is_cancelled() || self.failed.is_cancelled() {
            return Err(self.closed_error());
        }

        match mode {
            BackpressureMode::Fail => self.outbound.try_send(frame).map_err(|e| match e {
                flume::TrySendError::Full(_) => GatewayError::Overloaded,
                flume::TrySendError::Disconnected(_) => GatewayError::NotConnected,
            }),
            BackpressureMode::Block => {
                let send = async {
                    match self.publish_timeout {
                        Some(limit) => match timeout(limit, self.outbound.send_async(frame)).await {
                            Ok(sent) => sent.map_err(|_| GatewayError::NotConnected),
                            Err(_) => Err(GatewayError::PublishTimeout(limit)),
                        },
                        None => self
                            .outbound
                            .send_async(frame)
                            .await
                            .map_err(|_| GatewayError::NotConnected),
                    }
                };

                tokio::select! {
                    biased;
                    () = self.cancelled.cancelled() => Err(GatewayError::Cancelled),
                    () = self.failed.cancelled() => Err(GatewayError::NotConnected),
                    sent = send => sent,
                }
            }
        }
    }

    /// Hand a reply arriving on the inbox to its waiter.
    pub(crate) fn complete_reply(&self, inbound: InboundMessage) {
        let Some((_, waiter)) = self.pending.remove(&inbound.subject) else {
            debug!("Dropping reply on '{}' with no waiter", inbound.subject);
            return;
        };

        let _ = waiter.send(Message {
            subject: inbound.subject,
            payload: inbound.payload,
            reply_to: inbound.reply_to,
            sequence: None,
        });
    }

    /// Fail blocked and future publishes with `Cancelled`.
    pub(crate) fn cancel(&self) {
        self.cancelled.cancel();
        self.pending.clear();
    }

    /// Fail blocked and future publishes with `NotConnected`.
    pub(crate) fn fail(&self) {
        self.failed.cancel();
        self.pending.clear();
    }

    fn closed_error(&self) -> GatewayError {
        if self.cancelled.is_cancelled() {
            GatewayError::Cancelled
        } else {
            GatewayError::NotConnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use proven_transport::protocol::Decoder;

    fn pipeline(
        queue: usize,
        backpressure: BackpressureMode,
        publish_timeout_ms: Option<u64>,
    ) -> (Arc<PublishPipeline>, flume::Receiver<Bytes>) {
        let (tx, rx) = flume::bounded(queue);
        let config = GatewayConfig {
            backpressure,
            publish_timeout_ms,
            ..GatewayConfig::default()
        };
        (
            Arc::new(PublishPipeline::new(ConnectionId::new(), tx, &config)),
            rx,
        )
    }

    fn decode(frame: &Bytes) -> ClientOp {
        let mut decoder = Decoder::new();
        decoder.extend(frame);
        decoder.next_client_op().unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_frames_and_sequences() {
        let (pipeline, rx) = pipeline(8, BackpressureMode::Block, None);

        let first = pipeline
            .publish("orders.new", Bytes::from_static(b"one"), PublishOptions::default())
            .await
            .unwrap();
        let second = pipeline
            .publish(
                "orders.new",
                Bytes::from_static(b"two"),
                PublishOptions::reply_to("answers.here"),
            )
            .await
            .unwrap();

        assert_eq!((first.sequence, second.sequence), (1, 2));
        assert_eq!(second.payload_len, 3);
        assert_eq!(pipeline.last_sequence(), 2);

        assert_eq!(
            decode(&rx.try_recv().unwrap()),
            ClientOp::Pub {
                subject: "orders.new".to_string(),
                reply_to: None,
                payload: Bytes::from_static(b"one"),
            }
        );
        assert_eq!(
            decode(&rx.try_recv().unwrap()),
            ClientOp::Pub {
                subject: "orders.new".to_string(),
                reply_to: Some("answers.here".to_string()),
                payload: Bytes::from_static(b"two"),
            }
        );
    }

    #[tokio::test]
    async fn test_rejects_invalid_subjects() {
        let (pipeline, rx) = pipeline(8, BackpressureMode::Block, None);

        for subject in ["", "orders.*", "orders.>", "a..b"] {
            assert!(matches!(
                pipeline
                    .publish(subject, Bytes::new(), PublishOptions::default())
                    .await,
                Err(GatewayError::InvalidSubject { .. })
            ));
        }
        assert!(matches!(
            pipeline
                .publish("a", Bytes::new(), PublishOptions::reply_to("reply.*"))
                .await,
            Err(GatewayError::InvalidSubject { .. })
        ));
        assert!(rx.is_empty());
        assert_eq!(pipeline.last_sequence(), 0);
    }

    #[tokio::test]
    async fn test_enforces_max_payload() {
        let (pipeline, _rx) = pipeline(8, BackpressureMode::Block, None);
        pipeline.set_max_payload(4);

        assert_eq!(
            pipeline
                .publish("a", Bytes::from_static(b"12345"), PublishOptions::default())
                .await
                .unwrap_err(),
            GatewayError::PayloadTooLarge { size: 5, max: 4 }
        );
        assert!(
            pipeline
                .publish("a", Bytes::from_static(b"1234"), PublishOptions::default())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_fail_mode_reports_overload() {
        let (pipeline, _rx) = pipeline(1, BackpressureMode::Fail, None);

        pipeline
            .publish("a", Bytes::new(), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(
            pipeline
                .publish("a", Bytes::new(), PublishOptions::default())
                .await
                .unwrap_err(),
            GatewayError::Overloaded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_mode_times_out() {
        let (pipeline, _rx) = pipeline(1, BackpressureMode::Block, Some(100));

        pipeline
            .publish("a", Bytes::new(), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(
            pipeline
                .publish("a", Bytes::new(), PublishOptions::default())
                .await
                .unwrap_err(),
            GatewayError::PublishTimeout(Duration::from_millis(100))
        );
    }

    #[tokio::test]
    async fn test_blocked_publish_resumes_when_drained() {
        let (pipeline, rx) = pipeline(1, BackpressureMode::Block, None);
        pipeline
            .publish("a", Bytes::new(), PublishOptions::default())
            .await
            .unwrap();

        let blocked = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .publish("b", Bytes::new(), PublishOptions::default())
                    .await
            })
        };

        rx.recv_async().await.unwrap();
        let receipt = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(receipt.subject, "b");
    }

    #[tokio::test]
    async fn test_cancel_fails_blocked_publish() {
        let (pipeline, _rx) = pipeline(1, BackpressureMode::Block, None);
        pipeline
            .publish("a", Bytes::new(), PublishOptions::default())
            .await
            .unwrap();

        let blocked = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .publish("a", Bytes::new(), PublishOptions::default())
                    .await
            })
        };
        tokio::task::yield_now().await;

        pipeline.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), GatewayError::Cancelled);
    }

    #[tokio::test]
    async fn test_fail_rejects_with_not_connected() {
        let (pipeline, _rx) = pipeline(1, BackpressureMode::Block, None);
        pipeline.fail();
        assert_eq!(
            pipeline
                .publish("a", Bytes::new(), PublishOptions::default())
                .await
                .unwrap_err(),
            GatewayError::NotConnected
        );
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (pipeline, rx) = pipeline(8, BackpressureMode::Block, None);

        let request = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .publish(
                        "svc.echo",
                        Bytes::from_static(b"ping"),
                        PublishOptions::request(Duration::from_secs(1)),
                    )
                    .await
            })
        };

        let frame = rx.recv_async().await.unwrap();
        let ClientOp::Pub {
            reply_to: Some(inbox),
            ..
        } = decode(&frame)
        else {
            panic!("expected PUB with reply subject");
        };
        assert!(inbox.starts_with("_INBOX."));

        pipeline.complete_reply(InboundMessage {
            subject: inbox.clone(),
            sid: 0,
            reply_to: None,
            payload: Bytes::from_static(b"pong"),
        });

        let receipt = request.await.unwrap().unwrap();
        let reply = receipt.reply.unwrap();
        assert_eq!(reply.subject, inbox);
        assert_eq!(reply.payload, Bytes::from_static(b"pong"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_without_reply_times_out() {
        let (pipeline, _rx) = pipeline(8, BackpressureMode::Block, None);

        let result = pipeline
            .publish(
                "svc.none",
                Bytes::new(),
                PublishOptions::request(Duration::from_millis(200)),
            )
            .await;

        assert!(matches!(result, Err(GatewayError::Timeout(_))));
        assert!(pipeline.pending.is_empty());
    }
}
