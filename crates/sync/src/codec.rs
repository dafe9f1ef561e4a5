//! Payload codecs: the schema type is fixed at compile time, no reflection.

use bytes::Bytes;
use confdis_types::Result;
use serde::{Serialize, de::DeserializeOwned};

/// Converts a schema value to and from the bytes stored in the backend.
pub trait Codec<T>: Send + Sync {
    /// Serializes `value` into a payload.
    ///
    /// # Errors
    ///
    /// Returns [`confdis_types::ConfdisError::Serialization`] if the value cannot be encoded.
    fn encode(&self, value: &T) -> Result<Bytes>;

    /// Deserializes a payload into a fresh value.
    ///
    /// # Errors
    ///
    /// Returns [`confdis_types::ConfdisError::Serialization`] on a malformed payload.
    fn decode(&self, payload: &[u8]) -> Result<T>;
}

/// Plain JSON object, field names taken from the schema's serde attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, payload: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(payload)?)
    }
}
