//! RabbitMQ backend built on lapin
//!
//! The connection itself is established (and its topology declared) by the
//! application; this module only opens channels on it.
//!
//! Header mapping on publish:
//! - `Int` → `LongLongInt`
//! - `Text` → `LongString`
//! - `Bytes` → `ByteArray`
//! - `Bool` → `Boolean`
//! - `Amqp` → the wrapped value, unchanged
//!
//! Delivered headers are kept as `Amqp` values, whatever their type.

use crate::{
    broker::{BrokerChannel, ChannelOptions, ChannelProvider, ConfirmFuture, DeliveryStream},
    headers::{HeaderValue, Headers},
    message::{Delivery, Envelope, OutboundMessage},
    Error, Result,
};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
    },
    types::{AMQPValue, ByteArray, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// AMQP delivery mode for persistent messages
const PERSISTENT: u8 = 2;

/// Shared lapin connection used as a channel provider
#[derive(Clone)]
pub struct AmqpConnection {
    connection: Arc<lapin::Connection>,
}

impl AmqpConnection {
    /// Wrap an established connection
    pub fn new(connection: Arc<lapin::Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl ChannelProvider for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&self, options: ChannelOptions) -> Result<Self::Channel> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| Error::Channel(e.to_string()))?;

        if options.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| Error::Channel(e.to_string()))?;
        }

        debug!(channel = channel.id(), confirms = options.publisher_confirms, "Opened AMQP channel");

        Ok(AmqpChannel {
            channel: Arc::new(Mutex::new(channel)),
        })
    }
}

/// AMQP channel
///
/// The lapin channel sits behind an `Arc<Mutex<_>>` so one session can
/// dispatch and settle deliveries from concurrent tasks.
#[derive(Clone)]
pub struct AmqpChannel {
    channel: Arc<Mutex<lapin::Channel>>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn publish(&self, message: OutboundMessage) -> Result<ConfirmFuture> {
        let mut properties = BasicProperties::default();
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }
        if let Some(headers) = &message.envelope.headers {
            properties = properties.with_headers(to_field_table(headers));
        }

        let confirm = {
            let channel = self.channel.lock().await;
            channel
                .basic_publish(
                    &message.exchange,
                    &message.routing_key,
                    BasicPublishOptions::default(),
                    &message.envelope.payload,
                    properties,
                )
                .await
                .map_err(|e| Error::Publish(e.to_string()))?
        };

        let exchange = message.exchange;
        Ok(async move {
            let confirmation = confirm.await.map_err(|e| Error::Publish(e.to_string()))?;
            if confirmation.is_nack() {
                return Err(Error::Nacked { exchange });
            }
            Ok(())
        }
        .boxed())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .lock()
            .await
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<(String, DeliveryStream)> {
        let consumer = self
            .channel
            .lock()
            .await
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        let consumer_tag = consumer.tag().to_string();
        let deliveries = consumer
            .map(|delivery| {
                delivery
                    .map(from_lapin_delivery)
                    .map_err(|e| Error::Subscribe(e.to_string()))
            })
            .boxed();

        Ok((consumer_tag, deliveries))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .lock()
            .await
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| Error::Acknowledge(e.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .lock()
            .await
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| Error::Acknowledge(e.to_string()))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .lock()
            .await
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| Error::Broker(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        let channel = self.channel.lock().await;
        if !channel.status().connected() {
            return Ok(());
        }
        channel
            .close(200, "OK")
            .await
            .map_err(|e| Error::Channel(e.to_string()))
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        envelope: Envelope {
            payload: delivery.data.into(),
            headers: delivery.properties.headers().as_ref().map(from_field_table),
        },
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers.iter() {
        let value = match value {
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Text(v) => AMQPValue::LongString(LongString::from(v.as_str())),
            HeaderValue::Bytes(v) => AMQPValue::ByteArray(ByteArray::from(v.clone())),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Amqp(v) => v.clone(),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

/// Delivered values stay in their wire type so a republish writes them back unchanged
fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.to_string(), HeaderValue::Amqp(value.clone())))
        .collect()
}
