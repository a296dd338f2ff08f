//! # Message envelope
//!
//! The byte layout inside one length-prefixed frame (§3, §6):
//!
//! ```text
//! REQUEST  : 0x01 | uint64_be id | tagged_payload
//! RESPONSE : 0x02 | uint64_be id | 0x03 | payload        (success)
//!          | 0x02 | uint64_be id | 0x04 | error_payload  (failure)
//! CONNECT  : 0x10 | uint32_be len | len bytes of utf-8 identifier
//! ```
//!
//! This module only knows about that envelope layout; the payload bytes
//! themselves are opaque as far as it's concerned — encoding/decoding them
//! is the [`crate::codec::Codec`]'s job.

pub use crate::codec::TypeKey;
use crate::error::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Request id, monotonically increasing per connection.
pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0x01,
    Response = 0x02,
    Connect = 0x10,
}

impl FrameKind {
    fn from_byte(b: u8) -> Result<Self, TransportError> {
        match b {
            0x01 => Ok(FrameKind::Request),
            0x02 => Ok(FrameKind::Response),
            0x10 => Ok(FrameKind::Connect),
            other => Err(TransportError::protocol(format!("unknown frame kind byte 0x{other:02x}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    Success = 0x03,
    Failure = 0x04,
}

impl ResponseStatus {
    fn from_byte(b: u8) -> Result<Self, TransportError> {
        match b {
            0x03 => Ok(ResponseStatus::Success),
            0x04 => Ok(ResponseStatus::Failure),
            other => Err(TransportError::protocol(format!("unknown response status byte 0x{other:02x}"))),
        }
    }
}

/// A frame's envelope, parsed down to the fields the connection state
/// machine needs; payload bytes are left untouched for the caller to hand
/// to the codec.
#[derive(Debug)]
pub enum Envelope {
    Request { id: RequestId, payload: Bytes },
    Response { id: RequestId, status: ResponseStatus, payload: Bytes },
    Connect { identifier: String },
}

impl Envelope {
    /// `scratch` is a buffer obtained from a [`crate::buffer::BufferAllocator`];
    /// this only fills it and hands back the frozen result, so the allocator
    /// (not this module) owns the pooling/sizing policy.
    pub fn encode_request(id: RequestId, tagged_payload: Bytes, scratch: &mut BytesMut) -> Bytes {
        scratch.reserve(1 + 8 + tagged_payload.len());
        scratch.put_u8(FrameKind::Request as u8);
        scratch.put_u64(id);
        scratch.extend_from_slice(&tagged_payload);
        std::mem::take(scratch).freeze()
    }

    pub fn encode_response(id: RequestId, status: ResponseStatus, payload: Bytes, scratch: &mut BytesMut) -> Bytes {
        scratch.reserve(1 + 8 + 1 + payload.len());
        scratch.put_u8(FrameKind::Response as u8);
        scratch.put_u64(id);
        scratch.put_u8(status as u8);
        scratch.extend_from_slice(&payload);
        std::mem::take(scratch).freeze()
    }

    pub fn encode_connect(identifier: &str, scratch: &mut BytesMut) -> Bytes {
        let id_bytes = identifier.as_bytes();
        scratch.reserve(1 + 4 + id_bytes.len());
        scratch.put_u8(FrameKind::Connect as u8);
        scratch.put_u32(id_bytes.len() as u32);
        scratch.extend_from_slice(id_bytes);
        std::mem::take(scratch).freeze()
    }

    /// Parse one already-delimited frame body (length prefix already
    /// stripped by the frame codec).
    pub fn decode(mut frame: Bytes) -> Result<Self, TransportError> {
        if frame.is_empty() {
            return Err(TransportError::protocol("empty frame"));
        }
        let kind = FrameKind::from_byte(frame.get_u8())?;
        match kind {
            FrameKind::Request => {
                if frame.len() < 8 {
                    return Err(TransportError::protocol("truncated request id"));
                }
                let id = frame.get_u64();
                Ok(Envelope::Request { id, payload: frame })
            }
            FrameKind::Response => {
                if frame.len() < 9 {
                    return Err(TransportError::protocol("truncated response header"));
                }
                let id = frame.get_u64();
                let status = ResponseStatus::from_byte(frame.get_u8())?;
                Ok(Envelope::Response { id, status, payload: frame })
            }
            FrameKind::Connect => {
                if frame.len() < 4 {
                    return Err(TransportError::protocol("truncated connect length"));
                }
                let len = frame.get_u32() as usize;
                if frame.len() != len {
                    return Err(TransportError::protocol("connect identifier length mismatch"));
                }
                let identifier = String::from_utf8(frame.to_vec())
                    .map_err(|_| TransportError::protocol("connect identifier is not utf-8"))?;
                Ok(Envelope::Connect { identifier })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let mut scratch = BytesMut::new();
        let encoded = Envelope::encode_request(7, Bytes::from_static(b"payload"), &mut scratch);
        match Envelope::decode(encoded).unwrap() {
            Envelope::Request { id, payload } => {
                assert_eq!(id, 7);
                assert_eq!(&payload[..], b"payload");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn response_round_trips() {
        let mut scratch = BytesMut::new();
        let encoded = Envelope::encode_response(3, ResponseStatus::Failure, Bytes::from_static(b"err"), &mut scratch);
        match Envelope::decode(encoded).unwrap() {
            Envelope::Response { id, status, payload } => {
                assert_eq!(id, 3);
                assert_eq!(status, ResponseStatus::Failure);
                assert_eq!(&payload[..], b"err");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn connect_round_trips() {
        let mut scratch = BytesMut::new();
        let encoded = Envelope::encode_connect("node-1", &mut scratch);
        match Envelope::decode(encoded).unwrap() {
            Envelope::Connect { identifier } => assert_eq!(identifier, "node-1"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn malformed_connect_length_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(FrameKind::Connect as u8);
        buf.put_u32(100); // claims 100 bytes, supplies none
        assert!(Envelope::decode(buf.freeze()).is_err());
    }

    #[test]
    fn unknown_kind_byte_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x7f);
        assert!(Envelope::decode(buf.freeze()).is_err());
    }
}
