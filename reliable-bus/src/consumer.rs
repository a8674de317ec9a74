//! Retry / dead-letter consumer
//!
//! Each delivery is decoded, handed to the user handler and then routed by
//! its outcome:
//! - handler returned `true`: ack
//! - handler returned `false`, failed, panicked, or the body did not decode:
//!   dead-letter evaluation driven purely by the delivery's headers
//!
//! Dead-letter evaluation requeues messages without retry metadata, rejects
//! (dead-letters) messages that used up `max_retry_count`, and otherwise
//! republishes the message with an incremented `x-retry-count` before acking
//! the original delivery. Republish-then-ack is not atomic: a crash between
//! the two yields a duplicate, never a loss.

use crate::{
    broker::{BrokerChannel, ChannelOptions, ChannelProvider, DeliveryStream},
    config::MessageOptions,
    headers::{Headers, RetryMetadata},
    message::{Delivery, OutboundMessage},
    metrics::{DELIVERY_TOTAL, HANDLER_DURATION},
    payload::{decode_body, Payload},
    serializer::{JsonSerializer, Serializer},
    Error, Result,
};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Processes one decoded message; `Ok(true)` means success
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static {
    /// Handle a message (`None` for an empty body without an empty value)
    async fn handle(&self, message: Option<T>) -> anyhow::Result<bool>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(Option<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    async fn handle(&self, message: Option<T>) -> anyhow::Result<bool> {
        (self)(message).await
    }
}

/// Per-session consumer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Max unacknowledged deliveries (and concurrent handler runs); 0 means unlimited
    pub prefetch_count: u16,

    /// Let the broker ack on delivery; disables retry and dead-lettering
    pub auto_ack: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            prefetch_count: 1,
            auto_ack: false,
        }
    }
}

/// What happened to a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processed and acknowledged
    Acked,
    /// Republished with the given retry count, original acknowledged
    Retried {
        /// Retry count carried by the republished message
        retry_count: u32,
    },
    /// Rejected without requeue after exhausting retries
    DeadLettered {
        /// Retry count the message arrived with
        retry_count: u32,
    },
    /// Rejected with requeue because retry metadata was missing
    Requeued,
    /// Auto-ack mode; the broker already acknowledged it
    AutoAcked,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Acked => "ack",
            Outcome::Retried { .. } => "retry",
            Outcome::DeadLettered { .. } => "dead_letter",
            Outcome::Requeued => "requeue",
            Outcome::AutoAcked => "auto_ack",
        }
    }
}

/// Routing decision for a failed delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// No usable retry metadata: reject with requeue
    Requeue,
    /// Retries exhausted: reject without requeue
    DeadLetter {
        /// Retry count the message arrived with
        retry_count: u32,
    },
    /// Republish with the incremented metadata, then ack
    Retry(RetryMetadata),
}

/// Decide how a failed delivery is routed, from its headers alone
pub fn classify_failure(delivery: &Delivery, max_retry_count: u32) -> FailureAction {
    let Some(headers) = delivery.headers() else {
        return FailureAction::Requeue;
    };

    match RetryMetadata::decode(headers, &delivery.exchange, &delivery.routing_key) {
        None => FailureAction::Requeue,
        Some(metadata) if metadata.retry_count >= max_retry_count => FailureAction::DeadLetter {
            retry_count: metadata.retry_count,
        },
        Some(metadata) => FailureAction::Retry(metadata.next_attempt()),
    }
}

/// Message consumer
pub struct Consumer<P, S = JsonSerializer> {
    provider: Arc<P>,
    serializer: Arc<S>,
    options: Arc<MessageOptions>,
}

impl<P, S> Clone for Consumer<P, S> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            serializer: Arc::clone(&self.serializer),
            options: Arc::clone(&self.options),
        }
    }
}

impl<P: ChannelProvider> Consumer<P> {
    /// Create a consumer using the JSON serializer
    pub fn new(provider: Arc<P>, options: MessageOptions) -> Self {
        Self::with_serializer(provider, Arc::new(JsonSerializer), Arc::new(options))
    }
}

impl<P: ChannelProvider, S: Serializer> Consumer<P, S> {
    /// Create a consumer with an explicit serializer
    pub fn with_serializer(provider: Arc<P>, serializer: Arc<S>, options: Arc<MessageOptions>) -> Self {
        Self {
            provider,
            serializer,
            options,
        }
    }

    /// Start consuming `queue`; runs until `cancel` fires or the handle is cancelled
    pub async fn receive<T, H>(
        &self,
        queue: &str,
        handler: H,
        receive: ReceiveOptions,
        cancel: CancellationToken,
    ) -> Result<ConsumerHandle>
    where
        T: Payload,
        H: MessageHandler<T>,
    {
        let channel = self
            .provider
            .open_channel(ChannelOptions {
                publisher_confirms: !receive.auto_ack,
                max_outstanding_confirms: None,
            })
            .await?;

        let registered = async {
            channel.qos(receive.prefetch_count).await?;
            channel.consume(queue, receive.auto_ack).await
        }
        .await;

        let (consumer_tag, deliveries) = match registered {
            Ok(registration) => registration,
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    warn!(queue, "Failed to close channel after subscribe error: {}", close_err);
                }
                return Err(e);
            }
        };

        info!(
            queue,
            consumer_tag = %consumer_tag,
            prefetch = receive.prefetch_count,
            auto_ack = receive.auto_ack,
            "Consumer started"
        );

        let token = cancel.child_token();
        let tracker = TaskTracker::new();
        let processor = Arc::new(DeliveryProcessor {
            channel: channel.clone(),
            serializer: Arc::clone(&self.serializer),
            options: Arc::clone(&self.options),
            handler,
            queue: queue.to_string(),
            auto_ack: receive.auto_ack,
            token: token.clone(),
            _payload: PhantomData,
        });

        let task = tokio::spawn(run_session(
            channel,
            deliveries,
            processor,
            consumer_tag.clone(),
            receive.prefetch_count,
            token.clone(),
            tracker.clone(),
        ));

        Ok(ConsumerHandle {
            consumer_tag,
            queue: queue.to_string(),
            token,
            task,
            tracker,
        })
    }
}

/// Handle to a running consumer session
pub struct ConsumerHandle {
    consumer_tag: String,
    queue: String,
    token: CancellationToken,
    task: JoinHandle<()>,
    tracker: TaskTracker,
}

impl ConsumerHandle {
    /// Broker consumer tag
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Consumed queue
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop dispatching, cancel the broker consumer and release the channel
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the session to end and every in-flight handler to finish
    pub async fn closed(self) -> Result<()> {
        let joined = self.task.await;
        self.tracker.close();
        self.tracker.wait().await;
        joined.map_err(|e| Error::Subscribe(format!("consumer task failed: {e}")))
    }
}

async fn run_session<C, T, H, S>(
    channel: C,
    mut deliveries: DeliveryStream,
    processor: Arc<DeliveryProcessor<C, T, H, S>>,
    consumer_tag: String,
    prefetch_count: u16,
    token: CancellationToken,
    tracker: TaskTracker,
) where
    C: BrokerChannel,
    T: Payload,
    H: MessageHandler<T>,
    S: Serializer,
{
    let limiter = (prefetch_count > 0).then(|| Arc::new(Semaphore::new(usize::from(prefetch_count))));
    let queue = processor.queue.clone();

    loop {
        let delivery = tokio::select! {
            _ = token.cancelled() => {
                info!(queue = %queue, consumer_tag = %consumer_tag, "Consumer cancellation requested");
                break;
            }
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(queue = %queue, "Delivery stream error: {}", e);
                    continue;
                }
                None => {
                    warn!(queue = %queue, consumer_tag = %consumer_tag, "Delivery stream ended");
                    break;
                }
            },
        };

        let permit = match &limiter {
            Some(limiter) => {
                let acquired = tokio::select! {
                    _ = token.cancelled() => None,
                    permit = Arc::clone(limiter).acquire_owned() => permit.ok(),
                };
                match acquired {
                    Some(permit) => Some(permit),
                    // undispatched manual-ack deliveries return to the queue when the channel closes
                    None => break,
                }
            }
            None => None,
        };

        let processor = Arc::clone(&processor);
        tracker.spawn(async move {
            let _permit = permit;
            let delivery_tag = delivery.delivery_tag;
            match processor.process(delivery).await {
                Ok(_) => {}
                Err(Error::Cancelled) => {
                    info!(
                        queue = %processor.queue,
                        delivery_tag,
                        "Retry abandoned on shutdown; delivery will be redelivered"
                    );
                }
                Err(e) => {
                    DELIVERY_TOTAL.with_label_values(&["failed"]).inc();
                    error!(
                        queue = %processor.queue,
                        delivery_tag,
                        "Delivery processing failed, left unacknowledged: {}",
                        e
                    );
                }
            }
        });
    }

    if let Err(e) = channel.cancel(&consumer_tag).await {
        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer cancel failed: {}", e);
    }
    if let Err(e) = channel.close().await {
        warn!(queue = %queue, "Failed to close consumer channel: {}", e);
    }
    info!(queue = %queue, consumer_tag = %consumer_tag, "Consumer stopped");
}

struct DeliveryProcessor<C, T, H, S> {
    channel: C,
    serializer: Arc<S>,
    options: Arc<MessageOptions>,
    handler: H,
    queue: String,
    auto_ack: bool,
    token: CancellationToken,
    _payload: PhantomData<fn() -> T>,
}

impl<C, T, H, S> DeliveryProcessor<C, T, H, S>
where
    C: BrokerChannel,
    T: Payload,
    H: MessageHandler<T>,
    S: Serializer,
{
    async fn process(&self, delivery: Delivery) -> Result<Outcome> {
        let outcome = if self.auto_ack {
            self.process_auto_ack(&delivery).await;
            Outcome::AutoAcked
        } else if self.invoke(&delivery).await {
            self.channel.ack(delivery.delivery_tag).await?;
            Outcome::Acked
        } else {
            self.try_dead_letter(&delivery).await?
        };

        DELIVERY_TOTAL.with_label_values(&[outcome.label()]).inc();
        debug!(
            queue = %self.queue,
            delivery_tag = delivery.delivery_tag,
            outcome = outcome.label(),
            "Delivery settled"
        );
        Ok(outcome)
    }

    async fn process_auto_ack(&self, delivery: &Delivery) {
        if !self.invoke(delivery).await {
            warn!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                "Message failed in auto-ack mode; not retried"
            );
        }
    }

    /// Decode and run the handler; true only when it returned `Ok(true)`
    async fn invoke(&self, delivery: &Delivery) -> bool {
        let message = match decode_body::<T, S>(delivery.payload(), self.serializer.as_ref()) {
            Ok(message) => message,
            Err(e) => {
                error!(queue = %self.queue, delivery_tag = delivery.delivery_tag, "Failed to decode message: {}", e);
                return false;
            }
        };

        let start = Instant::now();
        let result = AssertUnwindSafe(self.handler.handle(message)).catch_unwind().await;
        HANDLER_DURATION.observe(start.elapsed().as_secs_f64());

        match result {
            Ok(Ok(success)) => success,
            Ok(Err(e)) => {
                error!(queue = %self.queue, delivery_tag = delivery.delivery_tag, "Handler error: {:#}", e);
                false
            }
            Err(_) => {
                error!(queue = %self.queue, delivery_tag = delivery.delivery_tag, "Handler panicked");
                false
            }
        }
    }

    async fn try_dead_letter(&self, delivery: &Delivery) -> Result<Outcome> {
        let result = self.route_failure(delivery).await;
        match &result {
            Ok(_) | Err(Error::Cancelled) => {}
            Err(e) => error!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                "Dead-letter evaluation failed: {}",
                e
            ),
        }
        result
    }

    async fn route_failure(&self, delivery: &Delivery) -> Result<Outcome> {
        let tag = delivery.delivery_tag;

        match classify_failure(delivery, self.options.max_retry_count) {
            FailureAction::Requeue => {
                warn!(
                    queue = %self.queue,
                    delivery_tag = tag,
                    "Message has no header, cannot use retry algorithm; requeueing"
                );
                self.channel.reject(tag, true).await?;
                Ok(Outcome::Requeued)
            }
            FailureAction::DeadLetter { retry_count } => {
                warn!(
                    queue = %self.queue,
                    delivery_tag = tag,
                    retry_count,
                    max_retry_count = self.options.max_retry_count,
                    "Retries exhausted; rejecting to dead letter"
                );
                self.channel.reject(tag, false).await?;
                Ok(Outcome::DeadLettered { retry_count })
            }
            FailureAction::Retry(metadata) => {
                let delay = self.options.retry_delay();
                if !delay.is_zero() {
                    tokio::select! {
                        _ = self.token.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                let mut headers: Headers = delivery.headers().cloned().unwrap_or_default();
                metadata.encode_into(&mut headers);

                let confirm = self
                    .channel
                    .publish(OutboundMessage::persistent(
                        &metadata.origin_exchange,
                        &metadata.origin_routing_key,
                        delivery.payload().clone(),
                        headers,
                    ))
                    .await?;
                confirm.await?;

                self.channel.ack(tag).await?;
                info!(
                    queue = %self.queue,
                    delivery_tag = tag,
                    retry_count = metadata.retry_count,
                    exchange = %metadata.origin_exchange,
                    routing_key = %metadata.origin_routing_key,
                    "Message republished for retry"
                );
                Ok(Outcome::Retried {
                    retry_count: metadata.retry_count,
                })
            }
        }
    }
}
