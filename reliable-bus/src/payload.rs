//! Payload encoding rules
//!
//! Strings travel as raw UTF-8 and byte payloads as-is; anything else goes
//! through the configured [`Serializer`] by wrapping it in [`Serialized`].
//! An absent value (`None`) is published as an empty body.

use crate::{serializer::Serializer, Error, Result};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

/// A value that can travel as a message body
pub trait Payload: Sized + Send + 'static {
    /// Encode the value to body bytes
    fn encode<S: Serializer>(&self, serializer: &S) -> Result<Bytes>;

    /// Decode a non-empty body
    fn decode<S: Serializer>(bytes: &[u8], serializer: &S) -> Result<Self>;

    /// Value handed to the handler for an empty body
    fn empty() -> Option<Self> {
        None
    }
}

/// Decode a delivered body, mapping zero-length bodies to [`Payload::empty`]
pub fn decode_body<T: Payload, S: Serializer>(bytes: &[u8], serializer: &S) -> Result<Option<T>> {
    if bytes.is_empty() {
        return Ok(T::empty());
    }
    T::decode(bytes, serializer).map(Some)
}

impl Payload for String {
    fn encode<S: Serializer>(&self, _serializer: &S) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }

    fn decode<S: Serializer>(bytes: &[u8], _serializer: &S) -> Result<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Deserialization(e.to_string()))
    }

    fn empty() -> Option<Self> {
        Some(String::new())
    }
}

impl Payload for Bytes {
    fn encode<S: Serializer>(&self, _serializer: &S) -> Result<Bytes> {
        Ok(self.clone())
    }

    fn decode<S: Serializer>(bytes: &[u8], _serializer: &S) -> Result<Self> {
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn empty() -> Option<Self> {
        Some(Bytes::new())
    }
}

impl Payload for Vec<u8> {
    fn encode<S: Serializer>(&self, _serializer: &S) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self))
    }

    fn decode<S: Serializer>(bytes: &[u8], _serializer: &S) -> Result<Self> {
        Ok(bytes.to_vec())
    }

    fn empty() -> Option<Self> {
        Some(Vec::new())
    }
}

impl<P: Payload> Payload for Option<P> {
    fn encode<S: Serializer>(&self, serializer: &S) -> Result<Bytes> {
        match self {
            Some(value) => value.encode(serializer),
            None => Ok(Bytes::new()),
        }
    }

    fn decode<S: Serializer>(bytes: &[u8], serializer: &S) -> Result<Self> {
        P::decode(bytes, serializer).map(Some)
    }

    fn empty() -> Option<Self> {
        Some(None)
    }
}

/// A structured value encoded with the pipeline's [`Serializer`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Serialized<T>(pub T);

impl<T> Serialized<T> {
    /// Unwrap the inner value
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Payload for Serialized<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn encode<S: Serializer>(&self, serializer: &S) -> Result<Bytes> {
        serializer.serialize(&self.0).map(Bytes::from)
    }

    fn decode<S: Serializer>(bytes: &[u8], serializer: &S) -> Result<Self> {
        serializer.deserialize(bytes).map(Serialized)
    }
}
