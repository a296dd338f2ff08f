//! # Process-global server registry (§4.9)
//!
//! `LocalClient::connect(id)` needs to find a listening `LocalServer` by its
//! identifier without any socket or address to dial. A single process-wide
//! `DashMap` keyed by identifier plays that role, the same "process-global
//! registry" the spec calls for and the same `once_cell::sync::Lazy<DashMap<..>>`
//! shape the teacher reaches for elsewhere when it needs a lazily
//! initialized, concurrently-accessed global table.

use crate::connection::Connection;
use crate::context::AnyContext;
use crate::error::TransportError;
use crate::server::AcceptCallback;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};

pub(crate) struct RegisteredServer {
    pub(crate) context: AnyContext,
    pub(crate) on_accept: Arc<AcceptCallback>,
    pub(crate) connections: Arc<Mutex<Vec<Arc<Connection>>>>,
}

static REGISTRY: Lazy<DashMap<String, RegisteredServer>> = Lazy::new(DashMap::new);

/// Register `id` as listening. Fails if another `LocalServer` already holds
/// that identifier (mirrors a real bind-address conflict).
pub(crate) fn register(
    id: String,
    context: AnyContext,
    on_accept: Arc<AcceptCallback>,
    connections: Arc<Mutex<Vec<Arc<Connection>>>>,
) -> Result<(), TransportError> {
    match REGISTRY.entry(id) {
        Entry::Occupied(entry) => Err(TransportError::argument(format!(
            "a local server is already listening as {:?}",
            entry.key()
        ))),
        Entry::Vacant(entry) => {
            entry.insert(RegisteredServer {
                context,
                on_accept,
                connections,
            });
            Ok(())
        }
    }
}

/// Remove `id` from the registry, e.g. when its server closes.
pub(crate) fn unregister(id: &str) {
    REGISTRY.remove(id);
}

/// Look up the context, accept callback and connection list registered
/// under `id`.
pub(crate) fn lookup(
    id: &str,
) -> Option<(AnyContext, Arc<AcceptCallback>, Arc<Mutex<Vec<Arc<Connection>>>>)> {
    REGISTRY
        .get(id)
        .map(|entry| (entry.context.clone(), entry.on_accept.clone(), entry.connections.clone()))
}
