//! Transport abstraction.
//!
//! The stack is transport-agnostic: the same framing and dispatch core runs
//! over a GATT characteristic write/notify pair or a cloud pub/sub topic.
//! Concrete bindings live outside this crate; they implement
//! [`DeviceTransport`] for the outbound half and feed inbound buffers into
//! the dispatcher's notify channel, one buffer per received frame/publish.

use std::future::Future;

use thiserror::Error;

mod loopback;

pub use loopback::{loopback_link, LoopbackTransport};

/// Opaque transport failure, passed through unchanged.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer or the local stack tore the link down.
    #[error("link closed")]
    Closed,

    /// Binding-specific failure (GATT status code, broker rejection, ...).
    #[error("{0}")]
    Other(String),
}

/// Outbound half of a device link.
///
/// Implementations must preserve write ordering and accept writes up to the
/// negotiated MTU. `max_chunk_len` is the largest frame payload the link
/// carries in one write: MTU minus the link's fixed per-write overhead.
pub trait DeviceTransport: Send + 'static {
    /// Establish the link. Called once before any write.
    fn connect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Write one encoded frame.
    fn write(&mut self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Release the link. Best effort, never fails.
    fn close(&mut self) -> impl Future<Output = ()> + Send;

    /// Largest frame payload a single write may carry.
    fn max_chunk_len(&self) -> usize;
}
