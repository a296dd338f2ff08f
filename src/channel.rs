//! # Channel abstraction
//!
//! A `Connection` doesn't know or care whether its bytes travel over a TCP
//! socket or an in-process queue — it only needs something that hands it
//! whole frames and accepts whole frames to send. Splitting the two
//! directions into separate traits mirrors `tokio::io::split`: the inbound
//! loop owns the reader exclusively, while the writer is shared (guarded by
//! a mutex in [`crate::connection::Connection`]) across concurrent `send`
//! callers and response dispatch.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;

/// The read half of a duplex channel. Implementations deliver exactly one
/// complete frame per call, per the frame codec's contract.
#[async_trait]
pub trait ChannelReader: Send + 'static {
    /// `Ok(Some(frame))` for a complete frame, `Ok(None)` on a clean close,
    /// `Err` on an I/O or protocol failure.
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// The write half of a duplex channel.
#[async_trait]
pub trait ChannelWriter: Send + 'static {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Half-close the channel. Idempotent from the caller's perspective.
    async fn shutdown(&mut self) -> Result<(), TransportError>;
}

pub mod tcp {
    use super::*;
    use crate::frame::FrameCodec;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio_util::codec::Decoder;

    /// Reads length-framed messages off a TCP socket's read half,
    /// accumulating partial reads the way the teacher's transports read a
    /// length prefix then the body in a loop.
    pub struct TcpChannelReader {
        read_half: OwnedReadHalf,
        buf: BytesMut,
        codec: FrameCodec,
    }

    impl TcpChannelReader {
        pub fn new(read_half: OwnedReadHalf) -> Self {
            Self { read_half, buf: BytesMut::with_capacity(4096), codec: FrameCodec }
        }
    }

    #[async_trait]
    impl ChannelReader for TcpChannelReader {
        async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
            loop {
                use tokio_util::codec::Decoder as _;
                if let Some(frame) = Decoder::decode(&mut self.codec, &mut self.buf)? {
                    return Ok(Some(frame));
                }
                let mut chunk = [0u8; 4096];
                let n = self.read_half.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(None);
                }
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    pub struct TcpChannelWriter {
        write_half: OwnedWriteHalf,
        codec: FrameCodec,
        scratch: BytesMut,
    }

    impl TcpChannelWriter {
        pub fn new(write_half: OwnedWriteHalf) -> Self {
            Self { write_half, codec: FrameCodec, scratch: BytesMut::new() }
        }
    }

    #[async_trait]
    impl ChannelWriter for TcpChannelWriter {
        async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
            use tokio_util::codec::Encoder as _;
            self.scratch.clear();
            Encoder::encode(&mut self.codec, frame, &mut self.scratch)?;
            self.write_half.write_all(&self.scratch).await?;
            self.write_half.flush().await?;
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), TransportError> {
            self.write_half.shutdown().await?;
            Ok(())
        }
    }
}
