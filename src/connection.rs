//! # Connection — the per-peer duplex request/response protocol (§3, §4.2–§4.5)
//!
//! A `Connection` doesn't know whether its bytes came from a TCP socket or
//! an in-process queue (see [`crate::channel`]); it only implements the
//! correlation, dispatch, timeout-reaping and latching rules in §3–§5.
//! Bytes arrive on an I/O task spawned by [`Connection::spawn`], which
//! decodes the envelope and hands user-observable work off to the right
//! context: a registered handler's own context for REQUEST dispatch, the
//! connection's owning context for serializing the RESPONSE that follows,
//! and — for completions of `send()` — whichever context is polling the
//! returned future, since a `oneshot::Receiver` wakes its waiting task
//! wherever that task lives without needing an explicit hop.

use crate::buffer::{BufferAllocator, BytesPool};
use crate::channel::{ChannelReader, ChannelWriter};
use crate::codec::{BincodeCodec, Codec, TypeKey};
use crate::context::{require_current, AnyContext, Scheduled};
use crate::error::TransportError;
use crate::wire::{Envelope, RequestId, ResponseStatus};
use bytes::Bytes;
use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

const REAP_PERIOD: Duration = Duration::from_millis(250);
const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The serialized form of a FAILURE response's error payload (§3, §6). Kept
/// distinct from the in-process [`TransportError`] so the receiving side can
/// tell an `UnknownMessageType` failure from an ordinary handler error
/// after a round trip through the wire, rather than collapsing both to a
/// plain string.
#[derive(serde::Serialize, serde::Deserialize)]
enum WireError {
    Unknown(TypeKey),
    Handler(String),
}

impl WireError {
    fn into_transport_error(self) -> TransportError {
        match self {
            WireError::Unknown(key) => TransportError::UnknownMessageType(key),
            WireError::Handler(msg) => TransportError::Handler(msg),
        }
    }
}

/// A handle returned by [`Connection::exception_listener`] /
/// [`Connection::close_listener`]; its only operation is detaching the
/// callback. Holds a weak back-reference so detaching after the listener
/// set has already been torn down (teardown on close/exception) is a
/// harmless no-op rather than a panic or leak.
pub struct ListenerHandle {
    id: u64,
    set: std::sync::Weak<Mutex<Vec<(u64, Box<dyn FnMut(&TransportError) + Send>)>>>,
}

impl ListenerHandle {
    pub fn detach(&self) {
        if let Some(set) = self.set.upgrade() {
            set.lock().unwrap().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Same shape as [`ListenerHandle`] but for close listeners, which take no
/// arguments.
pub struct CloseListenerHandle {
    id: u64,
    set: std::sync::Weak<Mutex<Vec<(u64, Box<dyn FnMut() + Send>)>>>,
}

impl CloseListenerHandle {
    pub fn detach(&self) {
        if let Some(set) = self.set.upgrade() {
            set.lock().unwrap().retain(|(id, _)| *id != self.id);
        }
    }
}

struct PendingEntry {
    tx: oneshot::Sender<Result<Bytes, TransportError>>,
    enqueued_at: Instant,
}

#[derive(Clone)]
struct HandlerEntry {
    context: AnyContext,
    invoke: Arc<dyn Fn(Bytes) -> BoxFuture<Result<Bytes, TransportError>> + Send + Sync>,
}

/// Per-peer duplex channel implementing the request/response protocol
/// described in §3–§5. Always held behind an `Arc` since the I/O task,
/// the reap timer and every outstanding `send()` future all share it.
pub struct Connection {
    context: AnyContext,
    writer: tokio::sync::Mutex<Box<dyn ChannelWriter>>,
    codec: BincodeCodec,
    buffer_allocator: Arc<dyn BufferAllocator>,
    handlers: std::sync::RwLock<std::collections::HashMap<TypeKey, HandlerEntry>>,
    pending: Mutex<IndexMap<RequestId, PendingEntry>>,
    next_request_id: AtomicU64,
    exception_listeners: Arc<Mutex<Vec<(u64, Box<dyn FnMut(&TransportError) + Send>)>>>,
    close_listeners: Arc<Mutex<Vec<(u64, Box<dyn FnMut() + Send>)>>>,
    next_listener_id: AtomicU64,
    failure: OnceLock<TransportError>,
    closed: AtomicBool,
    close_initiated: AtomicBool,
    closed_tx: watch::Sender<bool>,
    reap_timer: Mutex<Option<Scheduled>>,
}

impl Connection {
    /// Construct a connection over an already-handshaken channel and spawn
    /// its I/O task plus its 250ms reap timer. `context` is the context
    /// that accepted or initiated this connection (the one on which
    /// `Server::listen`/`Client::connect` was called); it owns the reap
    /// timer and is where inbound RESPONSE serialization happens (§4.3).
    pub fn spawn(
        context: AnyContext,
        reader: Box<dyn ChannelReader>,
        writer: Box<dyn ChannelWriter>,
    ) -> Arc<Self> {
        let (closed_tx, _closed_rx) = watch::channel(false);
        let conn = Arc::new(Self {
            context: context.clone(),
            writer: tokio::sync::Mutex::new(writer),
            codec: BincodeCodec,
            buffer_allocator: Arc::new(BytesPool::default()),
            handlers: std::sync::RwLock::new(std::collections::HashMap::new()),
            pending: Mutex::new(IndexMap::new()),
            next_request_id: AtomicU64::new(0),
            exception_listeners: Arc::new(Mutex::new(Vec::new())),
            close_listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(0),
            failure: OnceLock::new(),
            closed: AtomicBool::new(false),
            close_initiated: AtomicBool::new(false),
            closed_tx,
            reap_timer: Mutex::new(None),
        });

        let reap_conn = conn.clone();
        let scheduled = context.schedule_dyn(
            REAP_PERIOD,
            REAP_PERIOD,
            Box::new(move || reap_conn.reap_once()),
        );
        *conn.reap_timer.lock().unwrap() = Some(scheduled);

        let io_conn = conn.clone();
        tokio::spawn(async move { io_conn.run_reader(reader).await });

        conn
    }

    async fn run_reader(self: Arc<Self>, mut reader: Box<dyn ChannelReader>) {
        loop {
            match reader.recv_frame().await {
                Ok(Some(frame)) => self.clone().handle_frame(frame),
                Ok(None) => {
                    self.handle_closed();
                    return;
                }
                Err(e) => {
                    self.handle_exception(e);
                    return;
                }
            }
        }
    }

    /// Dispatch a single inbound frame (§4.3). Runs on the I/O task; only
    /// posts work onto contexts, never blocks them.
    fn handle_frame(self: Arc<Self>, frame: Bytes) {
        let envelope = match Envelope::decode(frame) {
            Ok(e) => e,
            Err(e) => {
                warn!("malformed frame, latching protocol error: {e}");
                self.handle_exception(e);
                return;
            }
        };
        match envelope {
            Envelope::Request { id, payload } => self.dispatch_request(id, payload),
            Envelope::Response { id, status, payload } => self.complete_pending(id, status, payload),
            Envelope::Connect { .. } => {
                warn!("unexpected CONNECT frame on an established connection");
            }
        }
    }

    fn dispatch_request(self: Arc<Self>, id: RequestId, payload: Bytes) {
        let type_key = match self.codec.peek_type_key(&payload) {
            Ok(k) => k,
            Err(e) => {
                self.respond_failure(id, WireError::Handler(e.to_string()));
                return;
            }
        };
        let entry = self.handlers.read().unwrap().get(&type_key).cloned();
        match entry {
            Some(entry) => {
                let conn = self.clone();
                entry.context.executor().spawn(async move {
                    let result = (entry.invoke)(payload).await;
                    conn.respond(id, result.map_err(|e| WireError::Handler(e.to_string())));
                });
            }
            None => self.respond_failure(id, WireError::Unknown(type_key)),
        }
    }

    /// Write the RESPONSE frame. Per §4.3 this encoding happens on the
    /// connection's own owning context, distinct from the context the
    /// handler ran on.
    fn respond(self: Arc<Self>, id: RequestId, result: Result<Bytes, WireError>) {
        let conn = self.clone();
        self.context.executor().spawn(async move {
            let mut scratch = conn.buffer_allocator.allocate();
            let frame = match result {
                Ok(payload) => Envelope::encode_response(id, ResponseStatus::Success, payload, &mut scratch),
                Err(e) => {
                    let payload = conn.codec.encode_value(&e).unwrap_or_else(|_| Bytes::new());
                    Envelope::encode_response(id, ResponseStatus::Failure, payload, &mut scratch)
                }
            };
            if let Err(e) = conn.write_frame(frame).await {
                debug!("failed to write response {id}: {e}");
            }
        });
    }

    fn respond_failure(self: Arc<Self>, id: RequestId, error: WireError) {
        self.respond(id, Err(error));
    }

    fn complete_pending(&self, id: RequestId, status: ResponseStatus, payload: Bytes) {
        let entry = self.pending.lock().unwrap().shift_remove(&id);
        let Some(entry) = entry else {
            trace!("discarding response for unknown/expired request {id}");
            return;
        };
        let result = match status {
            ResponseStatus::Success => Ok(payload),
            ResponseStatus::Failure => {
                let wire_err: WireError = self.codec.decode_value(&payload).unwrap_or_else(|e| {
                    WireError::Handler(e.to_string())
                });
                Err(wire_err.into_transport_error())
            }
        };
        let _ = entry.tx.send(result);
    }

    /// Timeout reaping (§4.4). `pending` is iterated oldest-first by
    /// insertion order, which equals timestamp order since request ids are
    /// monotonic; the scan stops at the first still-live entry.
    fn reap_once(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut pending = self.pending.lock().unwrap();
            loop {
                let Some((_, entry)) = pending.get_index(0) else {
                    break;
                };
                if now.duration_since(entry.enqueued_at) <= REQUEST_TIMEOUT {
                    break;
                }
                let (_, entry) = pending.shift_remove_index(0).expect("just peeked index 0");
                expired.push(entry);
            }
        }
        for entry in expired {
            let _ = entry.tx.send(Err(TransportError::Timeout));
        }
    }

    /// Latch a fatal channel-wide error (§4.5). Idempotent: only the first
    /// caller wins, matching the "sticky first error" invariant.
    fn handle_exception(&self, err: TransportError) {
        if self.failure.set(err.clone()).is_ok() {
            if !err.is_fatal() {
                warn!("latching non-fatal error kind as connection failure: {err}");
            }
            self.drain_pending(|| err.clone());
            let mut listeners = self.exception_listeners.lock().unwrap();
            for (_, listener) in listeners.iter_mut() {
                listener(&err);
            }
        }
    }

    /// Latch connection closure (§4.5). Independent of `handle_exception`;
    /// both latches may fire, exception first.
    fn handle_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.drain_pending(|| TransportError::Closed);
            let mut listeners = self.close_listeners.lock().unwrap();
            for (_, listener) in listeners.iter_mut() {
                listener();
            }
            drop(listeners);
            if let Some(scheduled) = self.reap_timer.lock().unwrap().take() {
                scheduled.cancel();
            }
            let _ = self.closed_tx.send(true);
        }
    }

    fn drain_pending(&self, err: impl Fn() -> TransportError) {
        let mut pending = self.pending.lock().unwrap();
        for (_, entry) in pending.drain(..) {
            let _ = entry.tx.send(Err(err()));
        }
    }

    async fn write_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.send_frame(frame).await
    }

    /// Send a typed request and await its typed response (§4.2).
    ///
    /// Requires the caller to be on this connection's owning context —
    /// the one that accepted or initiated it. Every future returned by
    /// `send` completes wherever that future is polled, which, since the
    /// caller is required to have spawned/awaited it there, is the owning
    /// context's executor (§5 invariant 3). The pending entry is only
    /// inserted *after* the write succeeds, so a write failure never
    /// produces a spurious timeout for a request that was never actually
    /// sent.
    pub async fn send<Req, Resp>(&self, request: Req) -> Result<Resp, TransportError>
    where
        Req: Serialize + 'static,
        Resp: DeserializeOwned + 'static,
    {
        require_current(self.context.as_ref())?;
        if let Some(err) = self.failure.get() {
            return Err(err.clone());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let tagged = self.codec.encode_tagged(&request)?;
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut scratch = self.buffer_allocator.allocate();
        let frame = Envelope::encode_request(id, tagged, &mut scratch);

        self.write_frame(frame).await?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            id,
            PendingEntry {
                tx,
                enqueued_at: Instant::now(),
            },
        );

        // A teardown may have raced the insert above and already drained
        // `pending` before we got here; re-check the latches so such a
        // request doesn't simply hang until the next reap tick.
        if let Some(err) = self.failure.get() {
            if let Some(entry) = self.pending.lock().unwrap().shift_remove(&id) {
                let _ = entry.tx.send(Err(err.clone()));
            }
        } else if self.closed.load(Ordering::Acquire) {
            if let Some(entry) = self.pending.lock().unwrap().shift_remove(&id) {
                let _ = entry.tx.send(Err(TransportError::Closed));
            }
        }

        let payload = rx.await.unwrap_or(Err(TransportError::Closed))?;
        self.codec.decode_value(&payload)
    }

    /// Register a handler for `Req`'s type key (§4.2, §4.10). `ctx` is the
    /// calling context — the caller must actually be on it — and every
    /// invocation of `f` runs there, never on the connection's own context
    /// or the I/O task. Replaces any prior registration for the same type
    /// key.
    pub fn handler<Req, Resp, F, Fut>(
        self: &Arc<Self>,
        ctx: AnyContext,
        f: F,
    ) -> Result<Arc<Self>, TransportError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, TransportError>> + Send + 'static,
    {
        require_current(ctx.as_ref())?;

        let type_key = self.codec.type_key::<Req>();
        let codec = self.codec;
        let f = Arc::new(f);
        let invoke: Arc<dyn Fn(Bytes) -> BoxFuture<Result<Bytes, TransportError>> + Send + Sync> = {
            let f = f.clone();
            Arc::new(move |payload: Bytes| {
                let f = f.clone();
                Box::pin(async move {
                    let req: Req = codec.decode_tagged(&payload)?;
                    let resp = f(req).await?;
                    codec.encode_value(&resp)
                }) as BoxFuture<Result<Bytes, TransportError>>
            })
        };
        self.handlers
            .write()
            .unwrap()
            .insert(type_key, HandlerEntry { context: ctx, invoke });
        Ok(self.clone())
    }

    /// Remove any handler registered for `Req`'s type key.
    pub fn remove_handler<Req: 'static>(self: &Arc<Self>) -> Arc<Self> {
        let type_key = self.codec.type_key::<Req>();
        self.handlers.write().unwrap().remove(&type_key);
        self.clone()
    }

    /// Append an exception listener. If `failure` is already latched, `f`
    /// is invoked synchronously with the latched error before this
    /// function returns (§4.2).
    pub fn exception_listener(
        &self,
        mut f: impl FnMut(&TransportError) + Send + 'static,
    ) -> ListenerHandle {
        if let Some(err) = self.failure.get() {
            f(err);
        }
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.exception_listeners.lock().unwrap().push((id, Box::new(f)));
        ListenerHandle {
            id,
            set: Arc::downgrade(&self.exception_listeners),
        }
    }

    /// Append a close listener. If `closed` is already latched, `f` is
    /// invoked synchronously before this function returns (§4.2).
    pub fn close_listener(&self, mut f: impl FnMut() + Send + 'static) -> CloseListenerHandle {
        if self.closed.load(Ordering::Acquire) {
            f();
        }
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.close_listeners.lock().unwrap().push((id, Box::new(f)));
        CloseListenerHandle {
            id,
            set: Arc::downgrade(&self.close_listeners),
        }
    }

    /// Idempotent close (§4.2). If a write is in flight it finishes first
    /// (the writer mutex serializes `close`'s shutdown behind it); every
    /// caller's returned future resolves once the channel is reported
    /// down, regardless of how many times `close` is called.
    pub async fn close(self: &Arc<Self>) {
        if !self.close_initiated.swap(true, Ordering::SeqCst) {
            let conn = self.clone();
            tokio::spawn(async move {
                {
                    let mut writer = conn.writer.lock().await;
                    let _ = writer.shutdown().await;
                }
                conn.handle_closed();
            });
        }
        let mut rx = self.closed_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn failure(&self) -> Option<TransportError> {
        self.failure.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TokioContext;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// An in-memory duplex pair for exercising `Connection` without a real
    /// socket: each end's writer feeds the other end's reader over an
    /// `mpsc` channel.
    fn make_pair() -> ((Box<dyn ChannelReader>, Box<dyn ChannelWriter>), (Box<dyn ChannelReader>, Box<dyn ChannelWriter>)) {
        let (a_tx, b_rx) = mpsc::unbounded_channel::<Bytes>();
        let (b_tx, a_rx) = mpsc::unbounded_channel::<Bytes>();
        (
            (Box::new(MpscReader(a_rx)), Box::new(MpscWriter(a_tx))),
            (Box::new(MpscReader(b_rx)), Box::new(MpscWriter(b_tx))),
        )
    }

    struct MpscReader(mpsc::UnboundedReceiver<Bytes>);
    struct MpscWriter(mpsc::UnboundedSender<Bytes>);

    #[async_trait]
    impl ChannelReader for MpscReader {
        async fn recv_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
            Ok(self.0.recv().await)
        }
    }

    #[async_trait]
    impl ChannelWriter for MpscWriter {
        async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
            self.0
                .send(frame)
                .map_err(|_| TransportError::Closed)
        }

        async fn shutdown(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn any_ctx(ctx: &TokioContext) -> AnyContext {
        Arc::new(ctx.clone())
    }

    #[tokio::test]
    async fn echoes_a_registered_type() {
        let client_ctx = TokioContext::spawn_new("conn-test-client");
        let server_ctx = TokioContext::spawn_new("conn-test-server");
        let ((client_r, client_w), (server_r, server_w)) = make_pair();

        let client_ctx_any = any_ctx(&client_ctx);
        let server_ctx_any = any_ctx(&server_ctx);

        let server_conn = Connection::spawn(server_ctx_any.clone(), server_r, server_w);
        let (registered_tx, registered_rx) = oneshot::channel();
        let handler_conn = server_conn.clone();
        let handler_ctx = server_ctx_any.clone();
        server_ctx.executor().spawn(async move {
            let result = handler_conn.handler::<String, String, _, _>(handler_ctx, |s: String| async move { Ok(s) });
            let _ = registered_tx.send(result);
        });
        registered_rx.await.unwrap().unwrap();

        let client_conn = Connection::spawn(client_ctx_any.clone(), client_r, client_w);

        // `send` must be driven from a task on the client's own context
        // per the context-affinity contract, so the assertion is relayed
        // back to this test task over an mpsc channel.
        let (tx, mut rx) = mpsc::channel(1);
        client_ctx.executor().spawn(async move {
            let r = client_conn.send::<String, String>("hello world!".to_string()).await;
            let _ = tx.send(r).await;
        });
        let result = rx.recv().await.unwrap().unwrap();

        assert_eq!(result, "hello world!");
        client_ctx.shutdown();
        server_ctx.shutdown();
    }

    #[tokio::test]
    async fn unknown_type_fails_with_unknown_message_type() {
        let client_ctx = TokioContext::spawn_new("conn-test-unknown-client");
        let server_ctx = TokioContext::spawn_new("conn-test-unknown-server");
        let ((client_r, client_w), (server_r, server_w)) = make_pair();

        let client_ctx_any = any_ctx(&client_ctx);
        let server_ctx_any = any_ctx(&server_ctx);
        let _server_conn = Connection::spawn(server_ctx_any, server_r, server_w);
        let client_conn = Connection::spawn(client_ctx_any.clone(), client_r, client_w);

        let (tx, mut rx) = mpsc::channel(1);
        client_ctx.executor().spawn(async move {
            let r = client_conn.send::<i32, i32>(7).await;
            let _ = tx.send(r).await;
        });
        let result = rx.recv().await.unwrap();
        assert!(matches!(result, Err(TransportError::UnknownMessageType(_))));

        client_ctx.shutdown();
        server_ctx.shutdown();
    }

    #[tokio::test]
    async fn close_fails_pending_sends_with_closed_error() {
        let client_ctx = TokioContext::spawn_new("conn-test-close-client");
        let server_ctx = TokioContext::spawn_new("conn-test-close-server");
        let ((client_r, client_w), (server_r, server_w)) = make_pair();

        let client_ctx_any = any_ctx(&client_ctx);
        let server_ctx_any = any_ctx(&server_ctx);
        // No handler registered server-side: requests sit unanswered until
        // the client closes underneath them.
        let _server_conn = Connection::spawn(server_ctx_any, server_r, server_w);
        let client_conn = Connection::spawn(client_ctx_any.clone(), client_r, client_w);

        let close_count = Arc::new(AtomicUsize::new(0));
        let close_count2 = close_count.clone();
        client_conn.close_listener(move || {
            close_count2.fetch_add(1, Ordering::SeqCst);
        });

        let (tx, mut rx) = mpsc::channel(10);
        for _ in 0..10 {
            let conn = client_conn.clone();
            let tx = tx.clone();
            client_ctx.executor().spawn(async move {
                let r = conn.send::<i32, i32>(1).await;
                let _ = tx.send(r).await;
            });
        }
        drop(tx);

        client_conn.close().await;

        let mut results = Vec::new();
        while let Some(r) = rx.recv().await {
            results.push(r);
        }
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| matches!(r, Err(TransportError::Closed))));
        assert_eq!(close_count.load(Ordering::SeqCst), 1);

        client_ctx.shutdown();
        server_ctx.shutdown();
    }
}
