//! Reliable messaging over an AMQP-style broker
//!
//! Provides:
//! - At-least-once publishing with publisher confirms, batched confirm waits
//!   and a cap on outstanding confirms
//! - A consumer state machine that acks, retries with an incremented
//!   `x-retry-count`, requeues or dead-letters each failed delivery
//! - A typed codec for the retry headers carried on the wire
//! - A lapin backend and an in-process broker
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod broker;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod error;
pub mod headers;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod payload;
pub mod publisher;
pub mod serializer;

pub use broker::{BrokerChannel, ChannelOptions, ChannelProvider};
pub use bus::MessageBus;
pub use config::MessageOptions;
pub use consumer::{Consumer, ConsumerHandle, MessageHandler, Outcome, ReceiveOptions};
pub use error::{Error, Result};
pub use headers::{HeaderValue, Headers, RetryMetadata};
pub use message::{Delivery, Envelope, OutboundMessage};
pub use payload::{Payload, Serialized};
pub use publisher::Publisher;
pub use serializer::{JsonSerializer, Serializer};
