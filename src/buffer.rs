//! # Buffer allocator contract
//!
//! The buffer allocator is another consumed collaborator (§1): it produces
//! reference-counted byte buffers with read/write cursors. `bytes::BytesMut`
//! already provides cheap, refcounted buffers with cursor semantics, so the
//! default [`BytesPool`] is a thin wrapper rather than a hand-rolled pool —
//! per the Design Notes, a plain (refcounted) buffer substitutes for a true
//! pool as long as the release rule in the data model still holds.

use bytes::BytesMut;

/// A writable buffer handed out by a [`BufferAllocator`]. Dropping it is the
/// release: `BytesMut`'s refcounting means the backing storage is reused
/// once every clone of the frozen `Bytes` it produces is gone.
pub type PooledBuffer = BytesMut;

/// Produces buffers for outbound frames.
pub trait BufferAllocator: Send + Sync + 'static {
    fn allocate(&self) -> PooledBuffer;
}

/// Default allocator: fixed initial capacity, no real pooling. Suitable for
/// embedding; a host application with stricter memory requirements can
/// supply its own [`BufferAllocator`] (e.g. backed by a slab pool).
#[derive(Debug, Clone, Copy)]
pub struct BytesPool {
    initial_capacity: usize,
}

impl BytesPool {
    pub fn new(initial_capacity: usize) -> Self {
        Self { initial_capacity }
    }
}

impl Default for BytesPool {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl BufferAllocator for BytesPool {
    fn allocate(&self) -> PooledBuffer {
        BytesMut::with_capacity(self.initial_capacity)
    }
}
