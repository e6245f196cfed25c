//! # mowlink
//!
//! Client-side protocol stack for robotic mowers.
//!
//! The mower speaks one binary framed protocol over whichever physical
//! channel is available (BLE GATT nearby, cloud pub/sub remotely). This
//! crate implements the app side of that protocol: framing and chunking,
//! fragment reassembly, a per-device command dispatcher, and incremental
//! replication of the mowing map.
//!
//! ## Architecture
//!
//! - **protocol**: wire frames, CRC checksums, mod-256 sequencing, and
//!   reassembly of fragmented notifications
//! - **transport**: the [`DeviceTransport`] seam plus an in-process
//!   loopback implementation
//! - **dispatch**: one spawned task per device owning the link state
//!   machine, with a single in-flight command at a time
//! - **mapsync**: hash-addressed map replica and the planner that fetches
//!   only what is missing
//!
//! ## Example
//!
//! ```ignore
//! use mowlink::{spawn_dispatcher, CommandRequest, DispatcherConfig, PlainTransform};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (handle, _task) = spawn_dispatcher(
//!         transport,
//!         notify_rx,
//!         push_tx,
//!         Arc::new(PlainTransform),
//!         DispatcherConfig::default(),
//!     );
//!     handle.connect().await.unwrap();
//!     let reply = handle
//!         .submit(CommandRequest::data(9, payload).expect_echo_reply())
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod dispatch;
pub mod error;
pub mod mapsync;
pub mod protocol;
pub mod transport;

pub use dispatch::{
    spawn_dispatcher, ChunkAckMode, CommandRequest, DispatcherConfig, DispatcherHandle,
    LinkState, ReplyMatch,
};
pub use error::{MowlinkError, Result};
pub use mapsync::{GeometryKind, MapMessage, MapReplica, MapSyncEngine};
pub use protocol::{FrameTransform, LogicalMessage, PlainTransform};
pub use transport::DeviceTransport;
