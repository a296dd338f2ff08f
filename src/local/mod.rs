//! # Local (in-process) transport (§4.9)
//!
//! The local backend gives every [`crate::connection::Connection`]
//! semantic — handlers, correlation, reaping, close — without a socket.
//! `LocalServer::listen` registers an accept callback under a process-wide
//! identifier; `LocalClient::connect` looks that identifier up, builds a
//! directly-wired `mpsc` pair, and spawns the server-side half of the
//! connection onto the listening server's own context, the same "drive the
//! peer's half on the peer's context" rule the TCP accept loop follows.

mod connection;
mod registry;

pub use connection::{channel_pair, LocalChannelReader, LocalChannelWriter};

use crate::connection::Connection;
use crate::context::{require_current, AnyContext};
use crate::error::TransportError;
use crate::server::AcceptCallback;
use std::sync::{Arc, Mutex};

/// Listens under a process-global identifier instead of a bound address.
pub struct LocalServer {
    context: AnyContext,
    id: Mutex<Option<String>>,
    connections: Arc<Mutex<Vec<Arc<Connection>>>>,
}

impl LocalServer {
    pub fn new(context: AnyContext) -> Arc<Self> {
        Arc::new(Self {
            context,
            id: Mutex::new(None),
            connections: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Register `id` in the process-wide registry. Idempotent if called
    /// again with the same `id` from the same server; fails if another
    /// `LocalServer` already holds it.
    pub fn listen(self: &Arc<Self>, id: impl Into<String>, on_accept: AcceptCallback) -> Result<(), TransportError> {
        require_current(self.context.as_ref())?;

        let id = id.into();
        let mut guard = self.id.lock().unwrap();
        if let Some(existing) = guard.as_ref() {
            return if existing == &id {
                Ok(())
            } else {
                Err(TransportError::argument(
                    "this local server is already listening under a different identifier",
                ))
            };
        }

        registry::register(
            id.clone(),
            self.context.clone(),
            Arc::new(on_accept),
            self.connections.clone(),
        )?;
        *guard = Some(id);
        Ok(())
    }

    /// Unregister and close every connection this server accepted.
    pub async fn close(self: &Arc<Self>) {
        if let Some(id) = self.id.lock().unwrap().take() {
            registry::unregister(&id);
        }
        let conns: Vec<Arc<Connection>> = self.connections.lock().unwrap().drain(..).collect();
        for conn in conns {
            conn.close().await;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

/// Connects to a [`LocalServer`] by identifier instead of dialing an
/// address.
pub struct LocalClient {
    context: AnyContext,
    connections: Arc<Mutex<Vec<Arc<Connection>>>>,
}

impl LocalClient {
    pub fn new(context: AnyContext) -> Arc<Self> {
        Arc::new(Self {
            context,
            connections: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Look `server_id` up in the registry, wire a directly-connected pair,
    /// and hand back the client-side [`Connection`] while the server-side
    /// half is spawned onto the listening server's own context.
    pub async fn connect(self: &Arc<Self>, server_id: impl AsRef<str>) -> Result<Arc<Connection>, TransportError> {
        require_current(self.context.as_ref())?;

        let server_id = server_id.as_ref();
        let (server_context, on_accept, server_connections) = registry::lookup(server_id)
            .ok_or_else(|| TransportError::argument(format!("no local server listening as {server_id:?}")))?;

        let ((reader_client, writer_client), (reader_server, writer_server)) = connection::channel_pair();

        let client_connection = Connection::spawn(
            self.context.clone(),
            Box::new(reader_client),
            Box::new(writer_client),
        );
        self.connections.lock().unwrap().push(client_connection.clone());

        let executor = server_context.executor().clone();
        executor.spawn(async move {
            let server_connection =
                Connection::spawn(server_context, Box::new(reader_server), Box::new(writer_server));
            server_connections.lock().unwrap().push(server_connection.clone());
            on_accept(server_connection);
        });

        Ok(client_connection)
    }

    pub async fn close(self: &Arc<Self>) {
        let conns: Vec<Arc<Connection>> = self.connections.lock().unwrap().drain(..).collect();
        for conn in conns {
            conn.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TokioContext;
    use tokio::sync::{mpsc, oneshot};

    async fn run_on<T: Send + 'static>(
        ctx: &TokioContext,
        fut: impl std::future::Future<Output = T> + Send + 'static,
    ) -> T {
        let (tx, rx) = oneshot::channel();
        ctx.executor().spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn connect_reaches_a_listening_server_by_id() {
        let server_ctx = TokioContext::spawn_new("local-test-server");
        let client_ctx = TokioContext::spawn_new("local-test-client");
        let server_ctx_any: AnyContext = Arc::new(server_ctx.clone());
        let client_ctx_any: AnyContext = Arc::new(client_ctx.clone());

        let (accepted_tx, mut accepted_rx) = mpsc::channel(1);
        let server = LocalServer::new(server_ctx_any);
        run_on(&server_ctx, {
            let server = server.clone();
            async move {
                server
                    .listen(
                        "local-echo-parity",
                        Box::new(move |_conn| {
                            let _ = accepted_tx.try_send(());
                        }),
                    )
                    .unwrap();
            }
        })
        .await;

        let client = LocalClient::new(client_ctx_any);
        let connection = run_on(&client_ctx, {
            let client = client.clone();
            async move { client.connect("local-echo-parity").await }
        })
        .await
        .expect("connect finds the registered server");

        accepted_rx.recv().await.expect("server invoked on_accept");
        assert_eq!(server.connection_count(), 1);

        connection.close().await;
        server.close().await;
        server_ctx.shutdown();
        client_ctx.shutdown();
    }

    #[tokio::test]
    async fn connect_to_an_unknown_id_fails() {
        let client_ctx = TokioContext::spawn_new("local-test-unknown");
        let client_ctx_any: AnyContext = Arc::new(client_ctx.clone());
        let client = LocalClient::new(client_ctx_any);

        let result = run_on(&client_ctx, {
            let client = client.clone();
            async move { client.connect("nobody-home").await }
        })
        .await;
        assert!(matches!(result, Err(TransportError::Argument(_))));
        client_ctx.shutdown();
    }
}
