//! Batched publish pipeline with publisher confirms
//!
//! Every call opens its own confirm-mode channel, stamps the retry headers
//! onto each message and publishes persistently. Confirms are awaited every
//! `batch_size` publishes, and no more than `max_outstanding_confirms`
//! publishes are ever left unconfirmed.

use crate::{
    broker::{BrokerChannel, ChannelOptions, ChannelProvider, ConfirmFuture},
    config::MessageOptions,
    headers::{Headers, RetryMetadata},
    message::OutboundMessage,
    metrics::{CONFIRM_BATCHES_TOTAL, PUBLISH_TOTAL},
    payload::Payload,
    serializer::{JsonSerializer, Serializer},
    Error, Result,
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Message publisher
pub struct Publisher<P, S = JsonSerializer> {
    provider: Arc<P>,
    serializer: Arc<S>,
    options: Arc<MessageOptions>,
}

impl<P, S> Clone for Publisher<P, S> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            serializer: Arc::clone(&self.serializer),
            options: Arc::clone(&self.options),
        }
    }
}

impl<P: ChannelProvider> Publisher<P> {
    /// Create a publisher using the JSON serializer
    pub fn new(provider: Arc<P>, options: MessageOptions) -> Self {
        Self::with_serializer(provider, Arc::new(JsonSerializer), Arc::new(options))
    }
}

impl<P: ChannelProvider, S: Serializer> Publisher<P, S> {
    /// Create a publisher with an explicit serializer
    pub fn with_serializer(provider: Arc<P>, serializer: Arc<S>, options: Arc<MessageOptions>) -> Self {
        Self {
            provider,
            serializer,
            options,
        }
    }

    /// Options in effect
    pub fn options(&self) -> &MessageOptions {
        &self.options
    }

    /// Publish one message and wait for the broker to confirm it
    pub async fn send<M: Payload>(
        &self,
        exchange: &str,
        message: &M,
        routing_key: &str,
        headers: Option<&Headers>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.send_batch(exchange, std::slice::from_ref(message), routing_key, headers, cancel)
            .await
    }

    /// Publish messages in confirm batches; returns once every message is confirmed
    pub async fn send_batch<M: Payload>(
        &self,
        exchange: &str,
        messages: &[M],
        routing_key: &str,
        headers: Option<&Headers>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.publish_all(exchange, messages, routing_key, headers, cancel)
            .await
            .map(|_| ())
    }

    /// Run a whole call; returns the number of confirm synchronization points
    async fn publish_all<M: Payload>(
        &self,
        exchange: &str,
        messages: &[M],
        routing_key: &str,
        headers: Option<&Headers>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        if messages.is_empty() {
            debug!(exchange, "Nothing to publish");
            return Ok(0);
        }

        let channel = self
            .provider
            .open_channel(ChannelOptions::confirms(self.options.max_outstanding_confirms))
            .await?;

        let result = self
            .publish_on(&channel, exchange, messages, routing_key, headers, cancel)
            .await;

        if let Err(e) = channel.close().await {
            warn!(exchange, "Failed to close publish channel: {}", e);
        }

        match &result {
            Ok(batches) => {
                PUBLISH_TOTAL.with_label_values(&["success"]).inc();
                info!(
                    exchange,
                    routing_key,
                    count = messages.len(),
                    batches,
                    "Published and confirmed messages"
                );
            }
            Err(Error::Cancelled) => {
                PUBLISH_TOTAL.with_label_values(&["cancelled"]).inc();
                warn!(exchange, routing_key, "Publish cancelled");
            }
            Err(e) => {
                PUBLISH_TOTAL.with_label_values(&["error"]).inc();
                error!(exchange, routing_key, "Publish failed: {}", e);
            }
        }

        result
    }

    async fn publish_on<C: BrokerChannel, M: Payload>(
        &self,
        channel: &C,
        exchange: &str,
        messages: &[M],
        routing_key: &str,
        headers: Option<&Headers>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut headers = headers.cloned().unwrap_or_default();
        RetryMetadata::initial(exchange, routing_key).encode_into(&mut headers);

        let batch_size = self.options.batch_size.max(1);
        let max_outstanding = self.options.max_outstanding_confirms.max(1);

        let mut pending: FuturesUnordered<ConfirmFuture> = FuturesUnordered::new();
        let mut in_batch = 0;
        let mut batches = 0;

        for message in messages {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            // Throttle: wait for confirms to drain below the outstanding cap
            while pending.len() >= max_outstanding {
                if let Some(confirm) = pending.next().await {
                    confirm?;
                }
            }

            let payload = message.encode(self.serializer.as_ref())?;
            let confirm = channel
                .publish(OutboundMessage::persistent(exchange, routing_key, payload, headers.clone()))
                .await?;
            pending.push(confirm);
            in_batch += 1;

            if in_batch == batch_size {
                await_confirms(&mut pending).await?;
                batches += 1;
                in_batch = 0;
            }
        }

        if in_batch > 0 {
            await_confirms(&mut pending).await?;
            batches += 1;
        }

        Ok(batches)
    }
}

/// Confirm synchronization point: await every pending confirm, first failure wins
async fn await_confirms(pending: &mut FuturesUnordered<ConfirmFuture>) -> Result<()> {
    while let Some(confirm) = pending.next().await {
        confirm?;
    }
    CONFIRM_BATCHES_TOTAL.inc();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{HeaderValue, ORIGIN_EXCHANGE, ORIGIN_ROUTING_KEY, RETRY_COUNT};
    use crate::memory::{BrokerEvent, InMemoryBroker};
    use crate::payload::Serialized;
    use serde::Serialize;

    #[derive(Debug, Clone, Serialize, serde::Deserialize)]
    struct Order {
        id: u32,
    }

    fn publisher(broker: &InMemoryBroker, options: MessageOptions) -> Publisher<InMemoryBroker> {
        Publisher::new(Arc::new(broker.clone()), options)
    }

    fn options(batch_size: usize) -> MessageOptions {
        MessageOptions {
            batch_size,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_confirm_batches_are_ceil_n_over_b() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        let publisher = publisher(&broker, options(4));
        let cancel = CancellationToken::new();

        let messages: Vec<String> = (0..10).map(|i| format!("msg-{i}")).collect();
        let batches = publisher
            .publish_all("", &messages, "orders", None, &cancel)
            .await
            .unwrap();

        assert_eq!(batches, 3);
        assert_eq!(broker.ready_count("orders"), 10);

        let exact: Vec<String> = (0..8).map(|i| i.to_string()).collect();
        let batches = publisher.publish_all("", &exact, "orders", None, &cancel).await.unwrap();
        assert_eq!(batches, 2);
    }

    #[tokio::test]
    async fn test_mandatory_headers_stamped() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        broker.bind("shop", "orders.created", "orders");
        let publisher = publisher(&broker, MessageOptions::default());

        let caller = Headers::new().with("tenant", "acme");
        publisher
            .send(
                "shop",
                &Serialized(Order { id: 1 }),
                "orders.created",
                Some(&caller),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        let message = &published[0];
        assert!(message.persistent);
        assert_eq!(&message.envelope.payload[..], br#"{"id":1}"#);

        let headers = message.envelope.headers.as_ref().unwrap();
        assert_eq!(headers.get(RETRY_COUNT), Some(&HeaderValue::Int(0)));
        assert_eq!(headers.get(ORIGIN_EXCHANGE).and_then(HeaderValue::as_text).as_deref(), Some("shop"));
        assert_eq!(
            headers.get(ORIGIN_ROUTING_KEY).and_then(HeaderValue::as_text).as_deref(),
            Some("orders.created")
        );
        assert_eq!(headers.get("tenant").and_then(HeaderValue::as_text).as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_cancelled_before_publish() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        let publisher = publisher(&broker, MessageOptions::default());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = publisher.send("", &"hello".to_string(), "orders", None, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(broker.published().is_empty());
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_propagates_and_releases_channel() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        broker.fail_publishes(true);
        let publisher = publisher(&broker, MessageOptions::default());

        let result = publisher
            .send_batch("", &["a".to_string(), "b".to_string()], "orders", None, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::Publish(_))));
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_nack_fails_the_call() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        broker.nack_publishes(true);
        let publisher = publisher(&broker, options(2));

        let result = publisher
            .send_batch("", &["a".to_string(), "b".to_string()], "orders", None, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::Nacked { .. })));
    }

    #[tokio::test]
    async fn test_throttle_below_batch_size() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        let publisher = publisher(
            &broker,
            MessageOptions {
                batch_size: 10,
                max_outstanding_confirms: 3,
                ..Default::default()
            },
        );

        let messages: Vec<String> = (0..25).map(|i| i.to_string()).collect();
        let batches = publisher
            .publish_all("", &messages, "orders", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(batches, 3);
        assert_eq!(broker.ready_count("orders"), 25);
    }

    #[tokio::test]
    async fn test_empty_batch_opens_no_channel() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker, MessageOptions::default());

        let empty: Vec<String> = Vec::new();
        publisher
            .send_batch("", &empty, "orders", None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!broker
            .events()
            .iter()
            .any(|e| matches!(e, BrokerEvent::ChannelOpened { .. })));
    }

    async fn published_count(broker: &InMemoryBroker, count: usize) {
        tokio::time::timeout(
            std::time::Duration::from_secs(30),
            broker.wait_until(|events| {
                events.iter().filter(|e| matches!(e, BrokerEvent::Published { .. })).count() == count
            }),
        )
        .await
        .unwrap();
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_next_batch_waits_for_previous_confirms() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        broker.hold_confirms(true);
        let publisher = publisher(&broker, options(3));

        let call = tokio::spawn(async move {
            let messages: Vec<String> = (0..5).map(|i| format!("msg-{i}")).collect();
            publisher
                .send_batch("", &messages, "orders", None, &CancellationToken::new())
                .await
        });

        published_count(&broker, 3).await;
        settle().await;
        assert_eq!(broker.published().len(), 3);

        assert_eq!(broker.release_confirms(2), 2);
        settle().await;
        assert_eq!(broker.published().len(), 3);
        assert!(!call.is_finished());

        assert_eq!(broker.release_confirms(1), 1);
        published_count(&broker, 5).await;
        settle().await;
        assert!(!call.is_finished());
        assert_eq!(broker.held_confirms(), 2);

        assert_eq!(broker.release_confirms(1), 1);
        settle().await;
        assert!(!call.is_finished());

        broker.release_confirms(1);
        call.await.unwrap().unwrap();
        assert_eq!(broker.open_channels(), 0);
    }

    /// Cancels the token while encoding the `at`-th message
    struct CancellingSerializer {
        cancel: CancellationToken,
        at: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl Serializer for CancellingSerializer {
        fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if call == self.at {
                self.cancel.cancel();
            }
            JsonSerializer.serialize(value)
        }

        fn deserialize<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
            JsonSerializer.deserialize(bytes)
        }
    }

    #[tokio::test]
    async fn test_cancelled_mid_batch_keeps_confirmed_prefix() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        let cancel = CancellationToken::new();
        let serializer = CancellingSerializer {
            cancel: cancel.clone(),
            at: 3,
            calls: Default::default(),
        };
        let publisher = Publisher::with_serializer(
            Arc::new(broker.clone()),
            Arc::new(serializer),
            Arc::new(options(2)),
        );

        let orders: Vec<_> = (0..6).map(|id| Serialized(Order { id })).collect();
        let result = publisher.send_batch("", &orders, "orders", None, &cancel).await;

        assert!(matches!(result, Err(Error::Cancelled)));
        // the message being encoded when the token fired is still sent; nothing after it
        assert_eq!(broker.published().len(), 3);
        assert_eq!(broker.ready_count("orders"), 3);
        assert_eq!(broker.open_channels(), 0);
        assert!(broker
            .events()
            .iter()
            .any(|e| matches!(e, BrokerEvent::ChannelClosed { .. })));
    }
}
