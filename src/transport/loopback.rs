//! In-memory loopback transport.
//!
//! Stands in for the radio link in the test suite and serves as the
//! reference for real transport bindings: writes land on an unbounded
//! channel the "device side" drains, and the device side pushes its
//! notifications straight into the dispatcher's notify channel.

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{DeviceTransport, TransportError};

/// Outbound half of an in-memory link.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    max_chunk_len: usize,
    connected: bool,
    /// When set, the next connect attempt fails.
    refuse_connect: bool,
}

impl LoopbackTransport {
    /// Make the next `connect` fail, for exercising `ConnectFailed` paths.
    pub fn refuse_next_connect(&mut self) {
        self.refuse_connect = true;
    }
}

/// Create a loopback link.
///
/// Returns the transport for the dispatcher side and the receiver the
/// simulated device drains written frames from.
pub fn loopback_link(max_chunk_len: usize) -> (LoopbackTransport, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        LoopbackTransport {
            tx,
            max_chunk_len,
            connected: false,
            refuse_connect: false,
        },
        rx,
    )
}

impl DeviceTransport for LoopbackTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.refuse_connect {
            self.refuse_connect = false;
            return Err(TransportError::Other("connection refused".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(Bytes::copy_from_slice(bytes))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        self.connected = false;
    }

    fn max_chunk_len(&self) -> usize {
        self.max_chunk_len
    }
}
