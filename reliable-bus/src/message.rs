//! Message envelope, outbound publish and inbound delivery types

use crate::headers::Headers;
use bytes::Bytes;

/// Wire-level unit of work: payload bytes plus an optional header block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    /// Serialized payload
    pub payload: Bytes,

    /// Header block; `None` when the message carries no headers at all
    pub headers: Option<Headers>,
}

impl Envelope {
    /// Create an envelope with a header block
    pub fn new(payload: impl Into<Bytes>, headers: Headers) -> Self {
        Self {
            payload: payload.into(),
            headers: Some(headers),
        }
    }

    /// Create an envelope without any header block
    pub fn without_headers(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            headers: None,
        }
    }
}

/// A publish request handed to a broker channel
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Target exchange
    pub exchange: String,

    /// Routing key
    pub routing_key: String,

    /// Payload and headers
    pub envelope: Envelope,

    /// Ask the broker to persist the message
    pub persistent: bool,
}

impl OutboundMessage {
    /// Persistent publish with a header block
    pub fn persistent(exchange: &str, routing_key: &str, payload: Bytes, headers: Headers) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            envelope: Envelope::new(payload, headers),
            persistent: true,
        }
    }
}

/// A message delivered to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or reject
    pub delivery_tag: u64,

    /// Exchange the message was published to
    pub exchange: String,

    /// Routing key the message was published with
    pub routing_key: String,

    /// Set when the broker has delivered this message before
    pub redelivered: bool,

    /// Payload and headers
    pub envelope: Envelope,
}

impl Delivery {
    /// Header block, if any
    pub fn headers(&self) -> Option<&Headers> {
        self.envelope.headers.as_ref()
    }

    /// Raw payload bytes
    pub fn payload(&self) -> &Bytes {
        &self.envelope.payload
    }
}
