//! Pluggable serializer capability

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Turns structured values into payload bytes and back
pub trait Serializer: Send + Sync + 'static {
    /// Serialize a value to bytes
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON serializer backed by serde_json
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
    }

    #[test]
    fn test_json_serializer() {
        let bytes = JsonSerializer.serialize(&Order { id: 1 }).unwrap();
        assert_eq!(bytes, br#"{"id":1}"#);

        let order: Order = JsonSerializer.deserialize(&bytes).unwrap();
        assert_eq!(order, Order { id: 1 });
    }

    #[test]
    fn test_json_deserialize_error() {
        let result: Result<Order> = JsonSerializer.deserialize(b"not json");
        assert!(matches!(result, Err(Error::Deserialization(_))));
    }
}
