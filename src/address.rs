//! Endpoint identity: a host name plus a TCP port.

use crate::error::TransportError;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

/// An immutable endpoint identity. Equality and hashing are defined over the
/// *resolved* socket address rather than the textual host, so `"localhost"`
/// and `"127.0.0.1"` compare equal when they resolve to the same address.
#[derive(Debug, Clone)]
pub struct Address {
    host: String,
    port: u16,
    resolved: SocketAddr,
}

impl Address {
    /// Resolve `host:port` immediately, failing fast on an unresolvable host
    /// rather than deferring the error to connect time.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, TransportError> {
        let host = host.into();
        let resolved = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(TransportError::from)?
            .next()
            .ok_or_else(|| TransportError::argument(format!("unresolvable host: {host}")))?;
        Ok(Self { host, port, resolved })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.resolved
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.resolved == other.resolved
    }
}

impl Eq for Address {}

impl std::hash::Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.resolved.hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
