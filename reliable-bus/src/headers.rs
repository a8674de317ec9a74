//! Message headers and the retry metadata codec
//!
//! Brokers carry header values in their own binary encoding and frequently
//! hand string values back as raw byte strings. The retry state machine only
//! ever talks to [`RetryMetadata`], which reads the three semantic headers
//! from whatever representation arrived.

#[cfg(feature = "amqp")]
use lapin::types::AMQPValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Retry attempts already made
pub const RETRY_COUNT: &str = "x-retry-count";

/// Exchange of the original publish
pub const ORIGIN_EXCHANGE: &str = "x-exchange-name";

/// Routing key of the original publish
pub const ORIGIN_ROUTING_KEY: &str = "x-exchange-routing-key";

/// A single header value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeaderValue {
    /// Signed integer
    Int(i64),
    /// UTF-8 text
    Text(String),
    /// Raw byte string
    Bytes(Vec<u8>),
    /// Boolean flag
    Bool(bool),
    /// Value exactly as an AMQP broker delivered it; re-encoded unchanged
    #[cfg(feature = "amqp")]
    Amqp(AMQPValue),
}

impl HeaderValue {
    /// Read the value as an integer, parsing text and byte strings
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(value) => Some(*value),
            HeaderValue::Text(text) => text.trim().parse().ok(),
            HeaderValue::Bytes(bytes) => std::str::from_utf8(bytes).ok()?.trim().parse().ok(),
            HeaderValue::Bool(_) => None,
            #[cfg(feature = "amqp")]
            HeaderValue::Amqp(value) => amqp_i64(value),
        }
    }

    /// Read the value as text, decoding byte strings as UTF-8
    pub fn as_text(&self) -> Option<String> {
        match self {
            HeaderValue::Text(text) => Some(text.clone()),
            HeaderValue::Bytes(bytes) => String::from_utf8(bytes.clone()).ok(),
            HeaderValue::Int(_) | HeaderValue::Bool(_) => None,
            #[cfg(feature = "amqp")]
            HeaderValue::Amqp(value) => amqp_text(value),
        }
    }
}

#[cfg(feature = "amqp")]
fn amqp_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        _ => amqp_text(value)?.trim().parse().ok(),
    }
}

#[cfg(feature = "amqp")]
fn amqp_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => String::from_utf8(v.as_bytes().to_vec()).ok(),
        AMQPValue::ShortString(v) => Some(v.as_str().to_string()),
        AMQPValue::ByteArray(v) => String::from_utf8(v.as_slice().to_vec()).ok(),
        _ => None,
    }
}

#[cfg(feature = "amqp")]
impl From<AMQPValue> for HeaderValue {
    fn from(value: AMQPValue) -> Self {
        HeaderValue::Amqp(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(value: Vec<u8>) -> Self {
        HeaderValue::Bytes(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Header block of a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, HeaderValue>);

impl Headers {
    /// Create an empty header block
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a header
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.0.get(key)
    }

    /// Remove a header
    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        self.0.remove(key)
    }

    /// Number of headers
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the block holds no headers
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over all headers
    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.0.iter()
    }

    /// Re-encode text values as byte strings, the way brokers return them
    pub fn into_wire_form(self) -> Self {
        self.0
            .into_iter()
            .map(|(key, value)| match value {
                HeaderValue::Text(text) => (key, HeaderValue::Bytes(text.into_bytes())),
                other => (key, other),
            })
            .collect()
    }
}

impl FromIterator<(String, HeaderValue)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, HeaderValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Headers {
    type Item = (String, HeaderValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, HeaderValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Retry metadata carried by every message published through the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryMetadata {
    /// Redelivery attempts already made
    pub retry_count: u32,
    /// Exchange of the original publish
    pub origin_exchange: String,
    /// Routing key of the original publish
    pub origin_routing_key: String,
}

impl RetryMetadata {
    /// Metadata for a first publish
    pub fn initial(exchange: &str, routing_key: &str) -> Self {
        Self {
            retry_count: 0,
            origin_exchange: exchange.to_string(),
            origin_routing_key: routing_key.to_string(),
        }
    }

    /// Read the retry count; `None` when absent or malformed
    pub fn retry_count(headers: &Headers) -> Option<u32> {
        headers
            .get(RETRY_COUNT)
            .and_then(HeaderValue::as_i64)
            .and_then(|count| u32::try_from(count).ok())
    }

    /// Decode the metadata, falling back to the given route for missing origin headers
    pub fn decode(headers: &Headers, fallback_exchange: &str, fallback_routing_key: &str) -> Option<Self> {
        let retry_count = Self::retry_count(headers)?;

        let origin_exchange = headers
            .get(ORIGIN_EXCHANGE)
            .and_then(HeaderValue::as_text)
            .unwrap_or_else(|| fallback_exchange.to_string());
        let origin_routing_key = headers
            .get(ORIGIN_ROUTING_KEY)
            .and_then(HeaderValue::as_text)
            .unwrap_or_else(|| fallback_routing_key.to_string());

        Some(Self {
            retry_count,
            origin_exchange,
            origin_routing_key,
        })
    }

    /// Write the metadata into a header block, replacing any existing values
    pub fn encode_into(&self, headers: &mut Headers) {
        headers.insert(RETRY_COUNT, i64::from(self.retry_count));
        headers.insert(ORIGIN_EXCHANGE, self.origin_exchange.as_str());
        headers.insert(ORIGIN_ROUTING_KEY, self.origin_routing_key.as_str());
    }

    /// Metadata for the next retry attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sets_all_semantic_headers() {
        let mut headers = Headers::new().with("tenant", "acme");
        RetryMetadata::initial("orders", "orders.created").encode_into(&mut headers);

        assert_eq!(headers.get(RETRY_COUNT), Some(&HeaderValue::Int(0)));
        assert_eq!(headers.get(ORIGIN_EXCHANGE), Some(&HeaderValue::Text("orders".into())));
        assert_eq!(
            headers.get(ORIGIN_ROUTING_KEY),
            Some(&HeaderValue::Text("orders.created".into()))
        );
        assert_eq!(headers.get("tenant"), Some(&HeaderValue::Text("acme".into())));
    }

    #[test]
    fn test_mandatory_headers_override_caller_values() {
        let mut headers = Headers::new().with(RETRY_COUNT, 7i64).with(ORIGIN_EXCHANGE, "spoofed");
        RetryMetadata::initial("orders", "").encode_into(&mut headers);

        assert_eq!(RetryMetadata::retry_count(&headers), Some(0));
        assert_eq!(headers.get(ORIGIN_EXCHANGE).and_then(HeaderValue::as_text).as_deref(), Some("orders"));
    }

    #[test]
    fn test_decode_from_wire_form() {
        let mut headers = Headers::new();
        RetryMetadata {
            retry_count: 2,
            origin_exchange: "E".into(),
            origin_routing_key: "R".into(),
        }
        .encode_into(&mut headers);

        let wire = headers.with(RETRY_COUNT, b"2".to_vec()).into_wire_form();
        assert!(matches!(wire.get(ORIGIN_EXCHANGE), Some(HeaderValue::Bytes(_))));

        let decoded = RetryMetadata::decode(&wire, "fallback", "fallback").unwrap();
        assert_eq!(decoded.retry_count, 2);
        assert_eq!(decoded.origin_exchange, "E");
        assert_eq!(decoded.origin_routing_key, "R");
    }

    #[test]
    fn test_missing_or_malformed_retry_count() {
        assert_eq!(RetryMetadata::retry_count(&Headers::new()), None);

        let garbage = Headers::new().with(RETRY_COUNT, b"three".to_vec());
        assert_eq!(RetryMetadata::retry_count(&garbage), None);

        let negative = Headers::new().with(RETRY_COUNT, -1i64);
        assert_eq!(RetryMetadata::retry_count(&negative), None);
        assert!(RetryMetadata::decode(&negative, "E", "R").is_none());
    }

    #[test]
    fn test_decode_falls_back_to_delivery_route() {
        let headers = Headers::new().with(RETRY_COUNT, 1i64);
        let decoded = RetryMetadata::decode(&headers, "amq.direct", "jobs").unwrap();

        assert_eq!(decoded.origin_exchange, "amq.direct");
        assert_eq!(decoded.origin_routing_key, "jobs");
        assert_eq!(decoded.next_attempt().retry_count, 2);
    }
}
