//! # cluster-rpc transport core
//!
//! A pluggable, duplex request/response transport for cluster
//! communication. Typed messages travel over a length-framed byte stream,
//! correlated by request id, dispatched to registered handlers, and reaped
//! on timeout — all driven from single-threaded cooperative [`Context`]s so
//! callbacks never race their caller.
//!
//! Two backends share one [`Connection`] core: [`TcpClient`]/[`TcpServer`]
//! for real sockets, and [`local::LocalClient`]/[`local::LocalServer`] for
//! in-process handoff with identical semantics. [`Transport`] is the usual
//! entry point: it owns a pool of contexts and memoizes clients/servers by
//! identifier.

pub mod address;
pub mod buffer;
pub mod channel;
pub mod client;
pub mod codec;
pub mod connection;
pub mod context;
pub mod error;
pub mod frame;
pub mod local;
pub mod server;
pub mod transport;
pub mod wire;

pub use address::Address;
pub use client::TcpClient;
pub use codec::{BincodeCodec, Codec, TypeKey};
pub use connection::{CloseListenerHandle, Connection, ListenerHandle};
pub use context::{AnyContext, Context, DynContext, Executor, Scheduled, TokioContext};
pub use error::{BindError, TransportError};
pub use server::{AcceptCallback, TcpServer};
pub use transport::Transport;

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
