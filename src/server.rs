//! # Server — binds an address and accepts inbound connections (§4.6)
//!
//! `TcpServer::listen` binds a `TcpListener` and, for each accepted stream,
//! waits for exactly one CONNECT handshake frame before handing the caller
//! a [`Connection`]. Binding and accept-loop management follow the
//! teacher's `TcpSocketTransport::start_server`/per-connection accept-loop
//! shape (`src/ipc/tcp_socket.rs`), generalized from a single legacy stream
//! to a tracked set of concurrent `Connection`s.

use crate::address::Address;
use crate::channel::tcp::{TcpChannelReader, TcpChannelWriter};
use crate::connection::Connection;
use crate::context::{require_current, AnyContext};
use crate::error::{BindError, TransportError};
use crate::frame::FrameCodec;
use crate::wire::Envelope;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Callback invoked once per accepted, handshaken connection, on the
/// context that called [`TcpServer::listen`].
pub type AcceptCallback = Box<dyn Fn(Arc<Connection>) + Send + Sync + 'static>;

/// A bound TCP listener that hands every successfully handshaken inbound
/// connection to an [`AcceptCallback`] (§4.6).
pub struct TcpServer {
    context: AnyContext,
    listen_started: AtomicBool,
    listen_result: Mutex<Option<watch::Receiver<Option<Result<(), TransportError>>>>>,
    connections: Arc<Mutex<Vec<Arc<Connection>>>>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TcpServer {
    /// `context` is the context `listen`/`close` must subsequently be
    /// called from, matching §4.10's "every public entry point requires a
    /// context" rule.
    pub fn new(context: AnyContext) -> Arc<Self> {
        Arc::new(Self {
            context,
            listen_started: AtomicBool::new(false),
            listen_result: Mutex::new(None),
            connections: Arc::new(Mutex::new(Vec::new())),
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            local_addr: Mutex::new(None),
        })
    }

    /// The address actually bound, once `listen` has succeeded. Useful
    /// when `listen` was called with an ephemeral port (`:0`).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Bind `address` and begin accepting connections, invoking
    /// `on_accept` for each one. Idempotent per server instance: a second
    /// call observes the first bind attempt's outcome rather than
    /// re-binding (§4.6).
    pub async fn listen(self: &Arc<Self>, address: Address, on_accept: AcceptCallback) -> Result<(), TransportError> {
        require_current(self.context.as_ref())?;

        if self.listen_started.swap(true, Ordering::SeqCst) {
            // Another caller already started (or finished) binding; wait
            // for that single attempt's outcome instead of racing a
            // second `bind`.
            let mut rx = self
                .listen_result
                .lock()
                .unwrap()
                .clone()
                .expect("listen_started set implies listen_result is populated");
            loop {
                if let Some(result) = rx.borrow().clone() {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err(TransportError::Io("listener task ended without a result".into()));
                }
            }
        }

        let (result_tx, result_rx) = watch::channel(None::<Result<(), TransportError>>);
        *self.listen_result.lock().unwrap() = Some(result_rx);

        let listener = match TcpListener::bind(address.socket_addr()).await {
            Ok(l) => l,
            Err(e) => {
                let bind_err = BindError {
                    addr: address.to_string(),
                    source: e.to_string(),
                };
                let _ = result_tx.send(Some(Err(TransportError::Bind(bind_err.clone()))));
                return Err(TransportError::Bind(bind_err));
            }
        };
        debug!("listening on {address}");
        *self.local_addr.lock().unwrap() = listener.local_addr().ok();
        let _ = result_tx.send(Some(Ok(())));

        let context = self.context.clone();
        let connections = self.connections.clone();
        let shutdown = self.shutdown.clone();
        let on_accept = Arc::new(on_accept);
        tokio::spawn(async move {
            loop {
                if shutdown.load(Ordering::Acquire) {
                    return;
                }
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {peer}");
                        let context = context.clone();
                        let connections = connections.clone();
                        let on_accept = on_accept.clone();
                        tokio::spawn(async move {
                            match handshake(stream).await {
                                Ok((identifier, reader, writer)) => {
                                    debug!("peer identified as {identifier:?}");
                                    // §4.6/§5: the accept callback, and the
                                    // `Connection` it's handed, must run on
                                    // the context that called `listen`, not
                                    // on whichever task happened to read the
                                    // CONNECT frame.
                                    let accept_context = context.clone();
                                    context.executor().spawn(async move {
                                        let connection = Connection::spawn(accept_context, reader, writer);
                                        connections.lock().unwrap().push(connection.clone());
                                        on_accept(connection);
                                    });
                                }
                                Err(e) => warn!("inbound handshake failed from {peer}: {e}"),
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    /// Completes once every connection this server accepted has closed.
    pub async fn close(self: &Arc<Self>) {
        self.shutdown.store(true, Ordering::Release);
        let conns: Vec<Arc<Connection>> = self.connections.lock().unwrap().drain(..).collect();
        for conn in conns {
            conn.close().await;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

/// Read exactly one CONNECT frame off an accepted stream before any
/// [`Connection`] exists (§4.3). Pure I/O: doesn't touch the server's
/// owning context, so it can run on whatever task the accept loop spawned
/// it on.
async fn handshake(
    stream: tokio::net::TcpStream,
) -> Result<(String, Box<dyn crate::channel::ChannelReader>, Box<dyn crate::channel::ChannelWriter>), TransportError> {
    let (mut read_half, write_half) = stream.into_split();

    let mut buf = BytesMut::with_capacity(256);
    let mut codec = FrameCodec;
    let frame = loop {
        use tokio_util::codec::Decoder;
        if let Some(frame) = Decoder::decode(&mut codec, &mut buf)? {
            break frame;
        }
        let mut chunk = [0u8; 256];
        let n = read_half.read(&mut chunk).await?;
        if n == 0 {
            return Err(TransportError::protocol("channel closed before CONNECT handshake"));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let identifier = match Envelope::decode(frame)? {
        Envelope::Connect { identifier } => identifier,
        _ => return Err(TransportError::protocol("expected CONNECT as the first frame")),
    };

    let reader = Box::new(TcpChannelReader::new(read_half));
    let writer = Box::new(TcpChannelWriter::new(write_half));
    Ok((identifier, reader, writer))
}
