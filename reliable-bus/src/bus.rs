//! Publisher and consumer bundled around one shared connection

use crate::{
    broker::ChannelProvider,
    config::MessageOptions,
    consumer::{Consumer, ConsumerHandle, MessageHandler, ReceiveOptions},
    headers::Headers,
    payload::Payload,
    publisher::Publisher,
    serializer::{JsonSerializer, Serializer},
    Result,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Entry point wiring both pipelines to the same provider, serializer and options
pub struct MessageBus<P, S = JsonSerializer> {
    publisher: Publisher<P, S>,
    consumer: Consumer<P, S>,
}

impl<P, S> Clone for MessageBus<P, S> {
    fn clone(&self) -> Self {
        Self {
            publisher: self.publisher.clone(),
            consumer: self.consumer.clone(),
        }
    }
}

impl<P: ChannelProvider> MessageBus<P> {
    /// Create a bus using the JSON serializer
    pub fn new(provider: Arc<P>, options: MessageOptions) -> Result<Self> {
        Self::with_serializer(provider, JsonSerializer, options)
    }
}

impl<P: ChannelProvider, S: Serializer> MessageBus<P, S> {
    /// Create a bus with an explicit serializer; rejects invalid options
    pub fn with_serializer(provider: Arc<P>, serializer: S, options: MessageOptions) -> Result<Self> {
        options.validate()?;

        let serializer = Arc::new(serializer);
        let options = Arc::new(options);
        Ok(Self {
            publisher: Publisher::with_serializer(Arc::clone(&provider), Arc::clone(&serializer), Arc::clone(&options)),
            consumer: Consumer::with_serializer(provider, serializer, options),
        })
    }

    /// Publish pipeline
    pub fn publisher(&self) -> &Publisher<P, S> {
        &self.publisher
    }

    /// Consumer state machine
    pub fn consumer(&self) -> &Consumer<P, S> {
        &self.consumer
    }

    /// See [`Publisher::send`]
    pub async fn send<M: Payload>(
        &self,
        exchange: &str,
        message: &M,
        routing_key: &str,
        headers: Option<&Headers>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.publisher.send(exchange, message, routing_key, headers, cancel).await
    }

    /// See [`Publisher::send_batch`]
    pub async fn send_batch<M: Payload>(
        &self,
        exchange: &str,
        messages: &[M],
        routing_key: &str,
        headers: Option<&Headers>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.publisher
            .send_batch(exchange, messages, routing_key, headers, cancel)
            .await
    }

    /// See [`Consumer::receive`]
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
        self.consumer.receive(queue, handler, receive, cancel).await
    }
}
