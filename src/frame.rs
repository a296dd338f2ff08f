//! # Frame codec (§4.1)
//!
//! Prepends/parses a 16-bit big-endian length prefix per message, bounded at
//! 32 KiB. Implemented against `tokio_util::codec` so it drops straight into
//! a [`tokio_util::codec::Framed`] over any `AsyncRead + AsyncWrite`, the way
//! the rest of the pack wires framed readers over raw streams.

use crate::error::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame body length: 32 KiB, per the wire protocol's `uint16_be`
/// length prefix bound.
pub const MAX_FRAME_LEN: usize = 32 * 1024;

const LEN_PREFIX_BYTES: usize = 2;

/// Stateless per-frame codec: it never splits or merges logical messages,
/// it only knows where one ends and the next begins.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Bytes> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.is_empty() || item.len() > MAX_FRAME_LEN {
            return Err(TransportError::protocol(format!(
                "frame body length {} out of bounds (1..={MAX_FRAME_LEN})",
                item.len()
            )));
        }
        dst.reserve(LEN_PREFIX_BYTES + item.len());
        dst.put_u16(item.len() as u16);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_PREFIX_BYTES {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if len == 0 {
            return Err(TransportError::protocol("zero-length frame body"));
        }
        if len > MAX_FRAME_LEN {
            return Err(TransportError::protocol(format!(
                "frame length {len} exceeds {MAX_FRAME_LEN}-byte bound"
            )));
        }
        if src.len() < LEN_PREFIX_BYTES + len {
            // Not enough data yet; reserve so the next read can fill the frame
            // in one shot rather than growing a byte at a time.
            src.reserve(LEN_PREFIX_BYTES + len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX_BYTES);
        Ok(Some(src.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(body: &[u8]) -> Bytes {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::copy_from_slice(body), &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn encodes_and_decodes_a_single_frame() {
        assert_eq!(&roundtrip(b"hello")[..], b"hello");
    }

    #[test]
    fn waits_for_a_full_frame_across_partial_reads() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"0123456789"), &mut buf).unwrap();

        let mut partial = buf.split_to(5);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(&frame[..], b"0123456789");
    }

    #[test]
    fn rejects_oversize_length_prefix() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u16(MAX_FRAME_LEN as u16 + 1);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_oversize_encode() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        let oversize = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(codec.encode(Bytes::from(oversize), &mut buf).is_err());
    }

    #[test]
    fn delivers_exactly_one_frame_per_decode_even_with_two_buffered() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"first"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"second"), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], b"first");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&second[..], b"second");
        assert!(buf.is_empty());
    }
}
