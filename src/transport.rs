//! # Transport — factory for clients and servers sharing a pool (§4.8)
//!
//! `Transport` owns a pool of [`TokioContext`]s sized, by default, to the
//! host's hardware parallelism via `num_cpus` — the same crate the teacher
//! binary already pulls in for its own worker-count defaults
//! (`src/cli.rs`). `client(id)`/`server(id)` memoize per identifier so
//! repeated calls with the same id return the same instance, and `close`
//! tears everything down before releasing the pool.

use crate::client::TcpClient;
use crate::context::{AnyContext, TokioContext};
use crate::server::TcpServer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Factory for [`TcpClient`]/[`TcpServer`] instances that share one pool of
/// I/O contexts (§4.8). Clients and servers are memoized by identifier:
/// calling `client("a")` twice returns the same `Arc<TcpClient>`.
pub struct Transport {
    pool: Vec<TokioContext>,
    next_pool_index: AtomicUsize,
    clients: Mutex<HashMap<String, Arc<TcpClient>>>,
    servers: Mutex<HashMap<String, Arc<TcpServer>>>,
}

impl Transport {
    /// Build a pool sized to `num_cpus::get()`.
    pub fn new() -> Arc<Self> {
        Self::with_pool_size(num_cpus::get().max(1))
    }

    /// Build a pool with an explicit context count. Must be positive
    /// (§7's `ArgumentError` covers "non-positive thread count"); callers
    /// passing `0` get a single-context pool rather than a panic, since
    /// this constructor isn't itself one of the fallible, context-bound
    /// entry points the rest of the crate guards with `require_current`.
    pub fn with_pool_size(size: usize) -> Arc<Self> {
        let size = size.max(1);
        let pool = (0..size)
            .map(|i| TokioContext::spawn_new(format!("cluster-rpc-io-{i}")))
            .collect();
        Arc::new(Self {
            pool,
            next_pool_index: AtomicUsize::new(0),
            clients: Mutex::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
        })
    }

    fn next_context(&self) -> AnyContext {
        let i = self.next_pool_index.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        Arc::new(self.pool[i].clone())
    }

    /// The context backing the `n`th pool slot, for callers that need to
    /// drive `connect`/`listen` calls themselves (both require the caller
    /// to be on the returned context).
    pub fn context(&self, n: usize) -> AnyContext {
        Arc::new(self.pool[n % self.pool.len()].clone())
    }

    /// Get or create the client identified by `id`.
    pub fn client(self: &Arc<Self>, id: impl Into<String>) -> Arc<TcpClient> {
        let id = id.into();
        let mut clients = self.clients.lock().unwrap();
        clients
            .entry(id.clone())
            .or_insert_with(|| TcpClient::new(self.next_context(), id))
            .clone()
    }

    /// Get or create the server identified by `id`.
    pub fn server(self: &Arc<Self>, id: impl Into<String>) -> Arc<TcpServer> {
        let id = id.into();
        let mut servers = self.servers.lock().unwrap();
        servers
            .entry(id)
            .or_insert_with(|| TcpServer::new(self.next_context()))
            .clone()
    }

    /// Close every client and server this transport created, then shut
    /// down the pool's context threads.
    pub async fn close(self: &Arc<Self>) {
        let clients: Vec<_> = self.clients.lock().unwrap().drain().map(|(_, v)| v).collect();
        for client in clients {
            client.close().await;
        }
        let servers: Vec<_> = self.servers.lock().unwrap().drain().map(|(_, v)| v).collect();
        for server in servers {
            server.close().await;
        }
        for ctx in &self.pool {
            ctx.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_and_server_are_memoized_by_id() {
        let transport = Transport::with_pool_size(2);
        let a = transport.client("peer-a");
        let b = transport.client("peer-a");
        assert!(Arc::ptr_eq(&a, &b));

        let c = transport.client("peer-b");
        assert!(!Arc::ptr_eq(&a, &c));

        transport.close().await;
    }

    #[tokio::test]
    async fn pool_size_is_never_zero() {
        let transport = Transport::with_pool_size(0);
        assert_eq!(transport.pool.len(), 1);
        transport.close().await;
    }
}
