//! # In-process channel pair (§4.9)
//!
//! A `LocalConnection` is a regular [`crate::connection::Connection`]
//! wired to an in-memory `mpsc` pair instead of a TCP socket — same
//! handler dispatch, correlation and reaping, no socket, no frame length
//! prefix (the channel already delivers whole frames).

use crate::channel::{ChannelReader, ChannelWriter};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 64;

pub struct LocalChannelReader {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl ChannelReader for LocalChannelReader {
    async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

pub struct LocalChannelWriter {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl ChannelWriter for LocalChannelWriter {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(frame).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        // Dropping the sender lets the peer's `recv_frame` observe a clean
        // close once its queue drains, matching a TCP half-close.
        self.tx.take();
        Ok(())
    }
}

/// Build two directly-wired channel endpoints: frames sent into one side's
/// writer arrive at the other side's reader.
pub fn channel_pair() -> (
    (LocalChannelReader, LocalChannelWriter),
    (LocalChannelReader, LocalChannelWriter),
) {
    let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        (LocalChannelReader { rx: a_rx }, LocalChannelWriter { tx: Some(b_tx) }),
        (LocalChannelReader { rx: b_rx }, LocalChannelWriter { tx: Some(a_tx) }),
    )
}
