//! # Client — initiates outbound connections (§4.7)
//!
//! `TcpClient::connect` opens a TCP stream with a 5 second connect timeout,
//! tunes `TCP_NODELAY`/`SO_KEEPALIVE` via `socket2` the way the teacher's
//! `TcpSocketTransport::start_client` tunes its low-latency sockets
//! (`src/ipc/tcp_socket.rs`: `into_std()` + `socket2::Socket::from(try_clone())`
//! + `TcpStream::from_std`), sends the CONNECT handshake frame, and wraps
//! the result in a [`Connection`].

use crate::address::Address;
use crate::buffer::{BufferAllocator, BytesPool};
use crate::channel::tcp::{TcpChannelReader, TcpChannelWriter};
use crate::connection::Connection;
use crate::context::{require_current, AnyContext};
use crate::error::TransportError;
use crate::frame::FrameCodec;
use crate::wire::Envelope;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Encoder;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens outbound connections to a fixed identifier, advertised to every
/// peer it connects to via the CONNECT handshake (§3).
pub struct TcpClient {
    context: AnyContext,
    identifier: String,
    connections: Arc<Mutex<Vec<Arc<Connection>>>>,
    buffer_allocator: Arc<dyn BufferAllocator>,
}

impl TcpClient {
    /// `context` is the context `connect`/`close` must subsequently be
    /// called from (§4.10). `identifier` is sent as this client's UTF-8
    /// CONNECT payload on every connection it opens.
    pub fn new(context: AnyContext, identifier: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            context,
            identifier: identifier.into(),
            connections: Arc::new(Mutex::new(Vec::new())),
            buffer_allocator: Arc::new(BytesPool::default()),
        })
    }

    /// Open a connection to `address` (§4.7). Sets `TCP_NODELAY` and
    /// `SO_KEEPALIVE`, writes the CONNECT handshake, then hands back a
    /// live [`Connection`] owned by this client's context.
    pub async fn connect(self: &Arc<Self>, address: Address) -> Result<Arc<Connection>, TransportError> {
        require_current(self.context.as_ref())?;

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address.socket_addr()))
            .await
            .map_err(|_| TransportError::Io(format!("connect to {address} timed out after {CONNECT_TIMEOUT:?}")))?
            .map_err(TransportError::from)?;

        let stream = tune_socket(stream)?;
        debug!("connected to {address}");

        let (read_half, mut write_half) = stream.into_split();

        let mut scratch = self.buffer_allocator.allocate();
        let connect_frame = Envelope::encode_connect(&self.identifier, &mut scratch);
        let mut framed = bytes::BytesMut::new();
        FrameCodec.encode(connect_frame, &mut framed)?;
        write_half.write_all(&framed).await?;
        write_half.flush().await?;

        let reader = Box::new(TcpChannelReader::new(read_half));
        let writer = Box::new(TcpChannelWriter::new(write_half));
        let connection = Connection::spawn(self.context.clone(), reader, writer);
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }

    /// Close every connection this client opened.
    pub async fn close(self: &Arc<Self>) {
        let conns: Vec<Arc<Connection>> = self.connections.lock().unwrap().drain(..).collect();
        for conn in conns {
            conn.close().await;
        }
    }
}

/// Round-trips through a `std::net::TcpStream` to reach `socket2`'s setters,
/// exactly as the teacher's transport does for its low-latency tuning.
fn tune_socket(stream: TcpStream) -> Result<TcpStream, TransportError> {
    let std_stream = stream.into_std()?;
    let socket = socket2::Socket::from(std_stream.try_clone()?);
    socket.set_nodelay(true)?;
    socket.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(Duration::from_secs(60)))?;
    Ok(TcpStream::from_std(std_stream)?)
}
