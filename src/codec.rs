//! # Serializer contract
//!
//! The serializer is a consumed collaborator (§1): this crate treats it as a
//! black box that turns typed values into byte buffers and back. The only
//! extra responsibility layered on top here is **type tagging** — the
//! handler registry routes an inbound REQUEST by a numeric type key rather
//! than by runtime class (Rust has no such thing), so [`Codec::encode_tagged`]
//! prefixes every request payload with a 4-byte key derived from the Rust
//! type name. This mirrors the design note on handler registry type-keys:
//! a tag issued by the serializer, not reflection.

use crate::error::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};

/// Opaque tag identifying a payload's Rust type. Deterministic across
/// processes built from the same types, since it is derived from
/// `std::any::type_name`, not from registration order.
pub type TypeKey = u32;

const TAG_LEN: usize = 4;

fn fnv1a32(s: &str) -> u32 {
    const PRIME: u32 = 16777619;
    let mut hash: u32 = 2166136261;
    for byte in s.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Converts typed values to and from byte buffers. Implementations must be
/// deterministic: the same value must always encode to the same bytes, and
/// `decode_value(encode_value(v))` must round-trip to a value equal to `v`.
pub trait Codec: Send + Sync + 'static {
    /// The type key for `T`. Implementers should not normally override this;
    /// the default hashes `std::any::type_name::<T>()` so two processes built
    /// from the same crate agree without coordination.
    fn type_key<T: ?Sized + 'static>(&self) -> TypeKey {
        fnv1a32(std::any::type_name::<T>())
    }

    fn encode_value<T: Serialize>(&self, value: &T) -> Result<Bytes, TransportError>;
    fn decode_value<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, TransportError>;

    /// Encode `value` prefixed with its type key, for REQUEST payloads.
    fn encode_tagged<T: Serialize + 'static>(&self, value: &T) -> Result<Bytes, TransportError> {
        let body = self.encode_value(value)?;
        let mut buf = BytesMut::with_capacity(TAG_LEN + body.len());
        buf.put_u32(self.type_key::<T>());
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }

    /// Peek the type key of a tagged payload without decoding the body.
    fn peek_type_key(&self, tagged: &[u8]) -> Result<TypeKey, TransportError> {
        if tagged.len() < TAG_LEN {
            return Err(TransportError::protocol("payload shorter than type tag"));
        }
        Ok((&tagged[..TAG_LEN]).get_u32())
    }

    /// Decode a tagged payload as `T`, skipping the type key.
    fn decode_tagged<T: DeserializeOwned + 'static>(&self, tagged: &[u8]) -> Result<T, TransportError> {
        if tagged.len() < TAG_LEN {
            return Err(TransportError::protocol("payload shorter than type tag"));
        }
        self.decode_value(&tagged[TAG_LEN..])
    }
}

/// The crate's default serializer: `bincode` over `serde`, matching the
/// teacher's own `Message::to_bytes`/`from_bytes` convention.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode_value<T: Serialize>(&self, value: &T) -> Result<Bytes, TransportError> {
        bincode::serialize(value)
            .map(Bytes::from)
            .map_err(|e| TransportError::codec(e.to_string()))
    }

    fn decode_value<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, TransportError> {
        bincode::deserialize(bytes).map_err(|e| TransportError::codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plain_values() {
        let codec = BincodeCodec;
        let encoded = codec.encode_value(&"hello world".to_string()).unwrap();
        let decoded: String = codec.decode_value(&encoded).unwrap();
        assert_eq!(decoded, "hello world");
    }

    #[test]
    fn tagged_payload_carries_a_stable_type_key() {
        let codec = BincodeCodec;
        let a = codec.encode_tagged(&42i32).unwrap();
        let b = codec.encode_tagged(&7i32).unwrap();
        assert_eq!(
            codec.peek_type_key(&a).unwrap(),
            codec.peek_type_key(&b).unwrap()
        );
        assert_ne!(
            codec.peek_type_key(&a).unwrap(),
            codec.type_key::<String>()
        );
        let decoded: i32 = codec.decode_tagged(&a).unwrap();
        assert_eq!(decoded, 42);
    }
}
