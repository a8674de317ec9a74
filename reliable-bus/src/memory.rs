//! In-process broker for tests and local pipelines
//!
//! Implements just enough AMQP 0-9-1 behaviour to exercise the reliability
//! layer without a server:
//! - the default exchange (`""` routes to the queue named by the routing key)
//!   and direct bindings
//! - per-queue dead-letter queues for messages rejected without requeue
//! - prefetch-aware round-robin dispatch, requeue-to-front on reject
//! - unacked deliveries return to their queue when their channel closes
//! - text headers are handed back to consumers as byte strings
//!
//! Every state change is recorded in an event journal that tests can wait on.
//! The journal and the published-message log are kept until
//! [`InMemoryBroker::clear_journal`]; this is a test double, not a broker to
//! run long-lived traffic through.
//!
//! Publisher confirms resolve immediately unless
//! [`InMemoryBroker::hold_confirms`] is on, in which case they wait for
//! [`InMemoryBroker::release_confirms`].

use crate::{
    broker::{BrokerChannel, ChannelOptions, ChannelProvider, ConfirmFuture, DeliveryStream},
    headers::{Headers, RetryMetadata},
    message::{Delivery, Envelope, OutboundMessage},
    Error, Result,
};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace};
use uuid::Uuid;

/// Something that happened inside the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// A channel was opened
    ChannelOpened {
        /// Channel id
        channel: u64,
        /// Publisher-confirm mode requested
        confirms: bool,
    },
    /// A channel was closed
    ChannelClosed {
        /// Channel id
        channel: u64,
    },
    /// A message was accepted for publishing
    Published {
        /// Target exchange
        exchange: String,
        /// Routing key
        routing_key: String,
        /// Retry count header at publish time
        retry_count: Option<u32>,
    },
    /// A published message matched no queue
    Unroutable {
        /// Target exchange
        exchange: String,
        /// Routing key
        routing_key: String,
    },
    /// A message was handed to a consumer
    Delivered {
        /// Source queue
        queue: String,
        /// Delivery tag
        delivery_tag: u64,
        /// Redelivery flag
        redelivered: bool,
    },
    /// A delivery was acknowledged
    Acked {
        /// Delivery tag
        delivery_tag: u64,
    },
    /// A delivery was rejected
    Rejected {
        /// Delivery tag
        delivery_tag: u64,
        /// Whether it went back to its queue
        requeue: bool,
    },
    /// A rejected message was moved to a dead-letter queue
    DeadLettered {
        /// Queue it was rejected from
        from: String,
        /// Dead-letter queue
        to: String,
    },
    /// A rejected message was dropped (no dead-letter queue)
    Discarded {
        /// Queue it was rejected from
        queue: String,
    },
    /// A consumer registration was cancelled
    ConsumerCancelled {
        /// Consumer tag
        consumer_tag: String,
    },
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    envelope: Envelope,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    dead_letter_queue: Option<String>,
}

struct ConsumerState {
    queue: String,
    channel: u64,
    auto_ack: bool,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.auto_ack || self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    channel: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    bindings: HashMap<(String, String), Vec<String>>,
    consumers: HashMap<String, ConsumerState>,
    unacked: HashMap<u64, Unacked>,
    channels: HashMap<u64, u16>,
    next_channel: u64,
    next_delivery_tag: u64,
    published: Vec<OutboundMessage>,
    events: Vec<BrokerEvent>,
    fail_publishes: bool,
    nack_publishes: bool,
    hold_confirms: bool,
    held_confirms: VecDeque<(oneshot::Sender<Result<()>>, Result<()>)>,
}

impl BrokerState {
    fn ensure_open(&self, channel: u64) -> Result<()> {
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(Error::ChannelClosed)
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default();
        }
        self.bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_back(message);
        }
        self.dispatch(queue);
    }

    fn dispatch(&mut self, queue: &str) {
        loop {
            let has_ready = self
                .queues
                .get(queue)
                .map(|q| !q.ready.is_empty())
                .unwrap_or(false);
            if !has_ready {
                return;
            }

            // least busy consumer with spare prefetch capacity, ties by tag
            let Some(consumer_tag) = self
                .consumers
                .iter()
                .filter(|(_, c)| c.queue == queue && c.has_capacity())
                .min_by(|(ta, a), (tb, b)| a.in_flight.cmp(&b.in_flight).then_with(|| ta.cmp(tb)))
                .map(|(tag, _)| tag.clone())
            else {
                return;
            };

            let Some(message) = self.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) else {
                return;
            };

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                envelope: Envelope {
                    payload: message.envelope.payload.clone(),
                    headers: message.envelope.headers.clone().map(Headers::into_wire_form),
                },
            };

            let Some(consumer) = self.consumers.get_mut(&consumer_tag) else {
                return;
            };
            if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
                // receiver dropped: forget the consumer and put the message back
                self.consumers.remove(&consumer_tag);
                if let Some(q) = self.queues.get_mut(queue) {
                    q.ready.push_front(message);
                }
                continue;
            }

            let auto_ack = consumer.auto_ack;
            let channel = consumer.channel;
            if !auto_ack {
                consumer.in_flight += 1;
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue.to_string(),
                        consumer_tag: consumer_tag.clone(),
                        channel,
                        message: message.clone(),
                    },
                );
            }

            trace!(queue, delivery_tag, consumer_tag = %consumer_tag, "Delivered");
            self.events.push(BrokerEvent::Delivered {
                queue: queue.to_string(),
                delivery_tag,
                redelivered: message.redelivered,
            });
        }
    }

    fn settle(&mut self, channel: u64, delivery_tag: u64) -> Result<Unacked> {
        self.ensure_open(channel)?;

        match self.unacked.get(&delivery_tag) {
            Some(entry) if entry.channel == channel => {}
            _ => {
                return Err(Error::Acknowledge(format!(
                    "unknown delivery tag {delivery_tag} on channel {channel}"
                )))
            }
        }

        let entry = self
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| Error::Acknowledge(format!("unknown delivery tag {delivery_tag}")))?;

        if let Some(consumer) = self.consumers.get_mut(&entry.consumer_tag) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        Ok(entry)
    }

    fn requeue_front(&mut self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_front(message);
        }
    }
}

/// In-process broker shared by every channel opened on it
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    changed: Arc<Notify>,
}

impl InMemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        let result = f(&mut self.state.lock());
        self.changed.notify_waiters();
        result
    }

    /// Declare a queue
    pub fn declare_queue(&self, name: &str) {
        self.with_state(|state| {
            state.queues.entry(name.to_string()).or_default();
        });
    }

    /// Declare a queue whose rejected messages move to `dead_letter_queue`
    pub fn declare_queue_with_dead_letter(&self, name: &str, dead_letter_queue: &str) {
        self.with_state(|state| {
            state.queues.entry(dead_letter_queue.to_string()).or_default();
            state.queues.entry(name.to_string()).or_default().dead_letter_queue =
                Some(dead_letter_queue.to_string());
        });
    }

    /// Bind `queue` to `exchange` for an exact routing key
    pub fn bind(&self, exchange: &str, routing_key: &str, queue: &str) {
        self.with_state(|state| {
            let queues = state
                .bindings
                .entry((exchange.to_string(), routing_key.to_string()))
                .or_default();
            if !queues.iter().any(|q| q == queue) {
                queues.push(queue.to_string());
            }
        });
    }

    /// Put a raw envelope straight onto a queue, bypassing any publisher
    pub fn inject(&self, queue: &str, envelope: Envelope) {
        self.with_state(|state| {
            let message = StoredMessage {
                exchange: String::new(),
                routing_key: queue.to_string(),
                envelope,
                redelivered: false,
            };
            state.enqueue(queue, message);
        });
    }

    /// Messages waiting in a queue
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Snapshot of the envelopes waiting in a queue
    pub fn ready_messages(&self, queue: &str) -> Vec<Envelope> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.envelope.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliveries handed out and not yet settled
    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// Every message accepted for publishing, in order
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().published.clone()
    }

    /// Event journal
    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state.lock().events.clone()
    }

    /// Channels currently open
    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Make every publish fail
    pub fn fail_publishes(&self, fail: bool) {
        self.with_state(|state| state.fail_publishes = fail);
    }

    /// Make every publish confirm negative
    pub fn nack_publishes(&self, nack: bool) {
        self.with_state(|state| state.nack_publishes = nack);
    }

    /// Hold publisher confirms until [`release_confirms`](Self::release_confirms)
    pub fn hold_confirms(&self, hold: bool) {
        self.with_state(|state| state.hold_confirms = hold);
    }

    /// Resolve up to `count` held confirms, oldest first; returns how many were released
    pub fn release_confirms(&self, count: usize) -> usize {
        let released: Vec<_> = self.with_state(|state| {
            let take = count.min(state.held_confirms.len());
            state.held_confirms.drain(..take).collect()
        });
        let total = released.len();
        for (confirm, outcome) in released {
            // the publisher may have given up on the call already
            let _ = confirm.send(outcome);
        }
        trace!(released = total, "Released held confirms");
        total
    }

    /// Confirms currently held back
    pub fn held_confirms(&self) -> usize {
        self.state.lock().held_confirms.len()
    }

    /// Forget the event journal and the published-message log
    pub fn clear_journal(&self) {
        self.with_state(|state| {
            state.events.clear();
            state.published.clear();
        });
    }

    /// Wait until the event journal satisfies `predicate`
    pub async fn wait_until<F>(&self, predicate: F)
    where
        F: Fn(&[BrokerEvent]) -> bool,
    {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if predicate(&self.state.lock().events) {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ChannelProvider for InMemoryBroker {
    type Channel = InMemoryChannel;

    async fn open_channel(&self, options: ChannelOptions) -> Result<Self::Channel> {
        let id = self.with_state(|state| {
            state.next_channel += 1;
            let id = state.next_channel;
            state.channels.insert(id, 0);
            state.events.push(BrokerEvent::ChannelOpened {
                channel: id,
                confirms: options.publisher_confirms,
            });
            id
        });
        debug!(channel = id, "Opened in-memory channel");

        Ok(InMemoryChannel {
            id,
            broker: self.clone(),
        })
    }
}

/// Channel on an [`InMemoryBroker`]
#[derive(Clone)]
pub struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
}

impl InMemoryChannel {
    /// Channel id
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn publish(&self, message: OutboundMessage) -> Result<ConfirmFuture> {
        let id = self.id;
        let confirm = self.broker.with_state(|state| {
            state.ensure_open(id)?;
            if state.fail_publishes {
                return Err(Error::Publish("injected publish failure".to_string()));
            }

            let retry_count = message
                .envelope
                .headers
                .as_ref()
                .and_then(RetryMetadata::retry_count);
            state.events.push(BrokerEvent::Published {
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                retry_count,
            });
            state.published.push(message.clone());

            let queues = state.route(&message.exchange, &message.routing_key);
            if queues.is_empty() {
                state.events.push(BrokerEvent::Unroutable {
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                });
            }
            for queue in queues {
                let stored = StoredMessage {
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    envelope: message.envelope.clone(),
                    redelivered: false,
                };
                state.enqueue(&queue, stored);
            }

            let outcome = if state.nack_publishes {
                Err(Error::Nacked {
                    exchange: message.exchange.clone(),
                })
            } else {
                Ok(())
            };

            if state.hold_confirms {
                let (sender, receiver) = oneshot::channel();
                state.held_confirms.push_back((sender, outcome));
                Ok(async move { receiver.await.unwrap_or(Err(Error::ChannelClosed)) }.boxed())
            } else {
                Ok(futures::future::ready(outcome).boxed())
            }
        })?;

        Ok(confirm)
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        let id = self.id;
        self.broker.with_state(|state| {
            state.ensure_open(id)?;
            state.channels.insert(id, prefetch_count);
            Ok(())
        })
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<(String, DeliveryStream)> {
        let id = self.id;
        let (sender, receiver) = mpsc::unbounded();
        let consumer_tag = format!("ctag-{}", Uuid::new_v4());

        self.broker.with_state(|state| {
            state.ensure_open(id)?;
            if !state.queues.contains_key(queue) {
                return Err(Error::Subscribe(format!("queue '{queue}' not found")));
            }
            let prefetch = state.channels.get(&id).copied().unwrap_or(0);
            state.consumers.insert(
                consumer_tag.clone(),
                ConsumerState {
                    queue: queue.to_string(),
                    channel: id,
                    auto_ack,
                    prefetch,
                    in_flight: 0,
                    sender,
                },
            );
            state.dispatch(queue);
            Ok(())
        })?;

        Ok((consumer_tag, receiver.boxed()))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let id = self.id;
        self.broker.with_state(|state| {
            let entry = state.settle(id, delivery_tag)?;
            state.events.push(BrokerEvent::Acked { delivery_tag });
            state.dispatch(&entry.queue);
            Ok(())
        })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let id = self.id;
        self.broker.with_state(|state| {
            let entry = state.settle(id, delivery_tag)?;
            state.events.push(BrokerEvent::Rejected { delivery_tag, requeue });

            if requeue {
                state.requeue_front(&entry.queue, entry.message);
            } else {
                let dead_letter_queue = state
                    .queues
                    .get(&entry.queue)
                    .and_then(|q| q.dead_letter_queue.clone())
                    .filter(|dlq| state.queues.contains_key(dlq));

                match dead_letter_queue {
                    Some(dlq) => {
                        state.events.push(BrokerEvent::DeadLettered {
                            from: entry.queue.clone(),
                            to: dlq.clone(),
                        });
                        let mut message = entry.message;
                        message.redelivered = false;
                        state.enqueue(&dlq, message);
                    }
                    None => state.events.push(BrokerEvent::Discarded {
                        queue: entry.queue.clone(),
                    }),
                }
            }

            state.dispatch(&entry.queue);
            Ok(())
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let id = self.id;
        self.broker.with_state(|state| {
            state.ensure_open(id)?;
            if state.consumers.remove(consumer_tag).is_some() {
                state.events.push(BrokerEvent::ConsumerCancelled {
                    consumer_tag: consumer_tag.to_string(),
                });
            }
            Ok(())
        })
    }

    async fn close(&self) -> Result<()> {
        let id = self.id;
        self.broker.with_state(|state| {
            if state.channels.remove(&id).is_none() {
                return Ok(());
            }

            state.consumers.retain(|_, c| c.channel != id);

            let mut orphaned: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, entry)| entry.channel == id)
                .map(|(tag, _)| *tag)
                .collect();
            // newest first so push_front restores delivery order
            orphaned.sort_unstable_by(|a, b| b.cmp(a));

            let mut touched = Vec::new();
            for tag in orphaned {
                if let Some(entry) = state.unacked.remove(&tag) {
                    state.requeue_front(&entry.queue, entry.message);
                    touched.push(entry.queue);
                }
            }

            state.events.push(BrokerEvent::ChannelClosed { channel: id });
            for queue in touched {
                state.dispatch(&queue);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn outbound(exchange: &str, routing_key: &str, body: &'static [u8]) -> OutboundMessage {
        let mut headers = Headers::new();
        RetryMetadata::initial(exchange, routing_key).encode_into(&mut headers);
        OutboundMessage::persistent(exchange, routing_key, Bytes::from_static(body), headers)
    }

    #[tokio::test]
    async fn test_default_exchange_and_bindings() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("a");
        broker.declare_queue("b");
        broker.bind("shop", "created", "b");

        let channel = broker.open_channel(ChannelOptions::confirms(10)).await.unwrap();
        channel.publish(outbound("", "a", b"1")).await.unwrap().await.unwrap();
        channel.publish(outbound("shop", "created", b"2")).await.unwrap().await.unwrap();
        channel.publish(outbound("shop", "missing", b"3")).await.unwrap().await.unwrap();

        assert_eq!(broker.ready_count("a"), 1);
        assert_eq!(broker.ready_count("b"), 1);
        assert!(broker
            .events()
            .contains(&BrokerEvent::Unroutable { exchange: "shop".into(), routing_key: "missing".into() }));
    }

    #[tokio::test]
    async fn test_prefetch_limits_dispatch() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs");
        for _ in 0..3 {
            broker.inject("jobs", Envelope::without_headers(&b"x"[..]));
        }

        let channel = broker.open_channel(ChannelOptions::default()).await.unwrap();
        channel.qos(1).await.unwrap();
        let (_tag, mut stream) = channel.consume("jobs", false).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(broker.ready_count("jobs"), 2);
        assert_eq!(broker.unacked_count(), 1);

        channel.ack(first.delivery_tag).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_ne!(first.delivery_tag, second.delivery_tag);
        assert_eq!(broker.ready_count("jobs"), 1);
    }

    #[tokio::test]
    async fn test_reject_routes() {
        let broker = InMemoryBroker::new();
        broker.declare_queue_with_dead_letter("jobs", "jobs.dlq");
        broker.declare_queue("plain");
        broker.inject("jobs", Envelope::without_headers(&b"a"[..]));
        broker.inject("plain", Envelope::without_headers(&b"b"[..]));

        let channel = broker.open_channel(ChannelOptions::default()).await.unwrap();
        let (_, mut jobs) = channel.consume("jobs", false).await.unwrap();
        let (_, mut plain) = channel.consume("plain", false).await.unwrap();

        let job = jobs.next().await.unwrap().unwrap();
        channel.reject(job.delivery_tag, false).await.unwrap();
        assert_eq!(broker.ready_count("jobs.dlq"), 1);

        let other = plain.next().await.unwrap().unwrap();
        channel.reject(other.delivery_tag, false).await.unwrap();
        assert!(broker.events().contains(&BrokerEvent::Discarded { queue: "plain".into() }));
    }

    #[tokio::test]
    async fn test_requeue_marks_redelivered() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs");
        broker.inject("jobs", Envelope::without_headers(&b"a"[..]));

        let channel = broker.open_channel(ChannelOptions::default()).await.unwrap();
        let (_, mut stream) = channel.consume("jobs", false).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        channel.reject(first.delivery_tag, true).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.envelope.payload, first.envelope.payload);
    }

    #[tokio::test]
    async fn test_close_returns_unacked_and_blocks_acks() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs");
        broker.inject("jobs", Envelope::without_headers(&b"a"[..]));

        let channel = broker.open_channel(ChannelOptions::default()).await.unwrap();
        let (tag, mut stream) = channel.consume("jobs", false).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        channel.cancel(&tag).await.unwrap();
        channel.close().await.unwrap();

        assert_eq!(broker.ready_count("jobs"), 1);
        assert!(matches!(channel.ack(delivery.delivery_tag).await, Err(Error::ChannelClosed)));
        assert!(stream.next().await.is_none());
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_headers_delivered_as_bytes() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs");

        let channel = broker.open_channel(ChannelOptions::default()).await.unwrap();
        channel.publish(outbound("", "jobs", b"{}")).await.unwrap().await.unwrap();
        let (_, mut stream) = channel.consume("jobs", true).await.unwrap();

        let delivery = stream.next().await.unwrap().unwrap();
        let headers = delivery.headers().unwrap();
        assert!(matches!(
            headers.get(crate::headers::ORIGIN_EXCHANGE),
            Some(crate::headers::HeaderValue::Bytes(_))
        ));
        assert_eq!(RetryMetadata::retry_count(headers), Some(0));
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_held_confirms_resolve_in_order_on_release() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs");
        broker.hold_confirms(true);

        let channel = broker.open_channel(ChannelOptions::confirms(10)).await.unwrap();
        let first = channel.publish(outbound("", "jobs", b"1")).await.unwrap();
        let mut second = channel.publish(outbound("", "jobs", b"2")).await.unwrap();
        assert_eq!(broker.held_confirms(), 2);
        assert_eq!(broker.ready_count("jobs"), 2);

        assert_eq!(broker.release_confirms(1), 1);
        first.await.unwrap();
        assert!((&mut second).now_or_never().is_none());

        broker.nack_publishes(true);
        let nacked = channel.publish(outbound("", "jobs", b"3")).await.unwrap();
        assert_eq!(broker.release_confirms(usize::MAX), 2);
        second.await.unwrap();
        assert!(matches!(nacked.await, Err(Error::Nacked { .. })));
        assert_eq!(broker.held_confirms(), 0);
    }

    #[tokio::test]
    async fn test_clear_journal() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs");

        let channel = broker.open_channel(ChannelOptions::default()).await.unwrap();
        channel.publish(outbound("", "jobs", b"{}")).await.unwrap().await.unwrap();
        assert!(!broker.events().is_empty());

        broker.clear_journal();
        assert!(broker.events().is_empty());
        assert!(broker.published().is_empty());
        assert_eq!(broker.ready_count("jobs"), 1);
        assert_eq!(broker.open_channels(), 1);
    }
}
