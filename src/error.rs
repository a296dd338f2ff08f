//! # Error Taxonomy
//!
//! Every fallible operation in this crate surfaces one of the variants below.
//! Per-request failures (timeout, unknown handler) complete only the future
//! for that request; channel-wide failures (`Io`, `Protocol`) latch onto the
//! owning [`crate::connection::Connection`] and are replayed to every pending
//! request plus every registered exception listener.

use crate::codec::TypeKey;

/// The single error type returned by every public, fallible entry point.
#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    /// Underlying I/O failure: connect, bind, read or write.
    #[error("i/o error: {0}")]
    Io(String),

    /// 500ms elapsed with no response for a given request.
    #[error("timed out waiting for response")]
    Timeout,

    /// The connection was closed, either before or during the operation.
    #[error("connection closed")]
    Closed,

    /// No handler is registered for the request's type key.
    #[error("no handler registered for message type {0:?}")]
    UnknownMessageType(TypeKey),

    /// A frame violated the wire format (oversize length, unknown kind byte,
    /// malformed CONNECT). Fatal for the channel that produced it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A caller-supplied argument was invalid: a null-equivalent request, a
    /// non-positive thread count, or a call made from outside a context.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The serializer failed to encode or decode a value.
    #[error("codec error: {0}")]
    Codec(String),

    /// A handler's own future resolved to an application-level error; it is
    /// carried back to the requester as a FAILURE response payload.
    #[error("handler error: {0}")]
    Handler(String),

    /// [`crate::server::TcpServer::listen`] could not bind its address
    /// (§4.6). Kept distinct from `Io` so callers can match on it without
    /// string-sniffing a bind failure out of a generic I/O error.
    #[error(transparent)]
    Bind(#[from] BindError),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

impl TransportError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        TransportError::Protocol(msg.into())
    }

    pub fn argument(msg: impl Into<String>) -> Self {
        TransportError::Argument(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        TransportError::Codec(msg.into())
    }

    /// True for the channel-wide kinds that latch `failure` on a connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Io(_) | TransportError::Protocol(_))
    }
}

/// Error raised when [`crate::server::Server::listen`] cannot bind its
/// address. Kept distinct from [`TransportError`] because binding happens
/// before any `Connection` exists to latch a failure onto.
#[derive(Debug, thiserror::Error, Clone)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: String,
    pub source: String,
}
