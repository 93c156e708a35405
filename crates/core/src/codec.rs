//! Byte codecs between typed objects and stored records.

use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Serializer/deserializer for one object type. Round trips must be stable:
/// `encode(decode(encode(o))) == encode(o)`.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, obj: &T) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, data: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec; the Postgres backend stores its output in a JSONB column.
pub struct JsonCodec<T> {
    _ty: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self { Self { _ty: PhantomData } }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self { Self::new() }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self { Self::new() }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, obj: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(obj).map_err(CodecError::Encode)
    }

    fn decode(&self, data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn json_round_trip_is_stable() {
        let codec = JsonCodec::<ConfigMap>::new();
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some("a".into()), namespace: Some("ns".into()), ..Default::default() },
            data: Some([("k".to_string(), "v".to_string())].into_iter().collect()),
            ..Default::default()
        };
        let bytes = codec.encode(&cm).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(back, cm);
        assert_eq!(codec.encode(&back).unwrap(), bytes);
    }

    #[test]
    fn garbage_fails_decode() {
        let codec = JsonCodec::<ConfigMap>::new();
        assert!(matches!(codec.decode(b"{not json"), Err(CodecError::Decode(_))));
    }
}
