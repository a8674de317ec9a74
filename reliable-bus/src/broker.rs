//! Broker boundary
//!
//! The reliability layer never talks to a broker client directly. It opens
//! channels through a shared [`ChannelProvider`] (owned by the application
//! root) and drives them through [`BrokerChannel`]. Connection setup and
//! topology declaration stay with the caller.

use crate::{
    message::{Delivery, OutboundMessage},
    Result,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

/// Resolves once the broker has confirmed (or rejected) a publish
pub type ConfirmFuture = BoxFuture<'static, Result<()>>;

/// Stream of deliveries for one consumer registration
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Channel settings requested at open time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Put the channel in publisher-confirm mode
    pub publisher_confirms: bool,

    /// Cap on unconfirmed publishes, when the client supports throttling
    pub max_outstanding_confirms: Option<usize>,
}

impl ChannelOptions {
    /// Confirm-mode channel throttled at `max_outstanding` publishes
    pub fn confirms(max_outstanding: usize) -> Self {
        Self {
            publisher_confirms: true,
            max_outstanding_confirms: Some(max_outstanding),
        }
    }
}

/// Opens channels on a long-lived, shared broker connection
#[async_trait]
pub trait ChannelProvider: Send + Sync + 'static {
    /// Channel type handed out by this provider
    type Channel: BrokerChannel;

    /// Open a new channel
    async fn open_channel(&self, options: ChannelOptions) -> Result<Self::Channel>;
}

/// Operations the reliability layer needs from a broker channel
#[async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    /// Publish a message; the returned future resolves on broker confirm
    async fn publish(&self, message: OutboundMessage) -> Result<ConfirmFuture>;

    /// Limit unacknowledged deliveries outstanding to consumers on this channel
    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    /// Register a consumer; returns the consumer tag and its delivery stream
    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<(String, DeliveryStream)>;

    /// Acknowledge a delivery
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Reject a delivery, optionally requeueing it
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Cancel a consumer registration
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Close the channel
    async fn close(&self) -> Result<()>;
}
