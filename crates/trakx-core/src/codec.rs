use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::TrackerError;

/// Pure byte codec for a session value. Both directions may fail; failures
/// surface as [`TrackerError::Codec`] and are never retried (the result is
/// deterministic on the input).
pub trait SessionCodec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>, TrackerError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, TrackerError>;
}

/// JSON codec. The default: payloads stay inspectable in the backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> SessionCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, TrackerError> {
        serde_json::to_vec(value).map_err(|e| TrackerError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, TrackerError> {
        serde_json::from_slice(bytes).map_err(|e| TrackerError::Codec(e.to_string()))
    }
}

/// Compact binary codec for payloads that never need to be read by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<T> SessionCodec<T> for BincodeCodec
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, TrackerError> {
        bincode::serialize(value).map_err(|e| TrackerError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, TrackerError> {
        bincode::deserialize(bytes).map_err(|e| TrackerError::Codec(e.to_string()))
    }
}
