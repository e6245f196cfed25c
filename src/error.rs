//! Error types for mowlink.

use thiserror::Error;

use crate::transport::TransportError;

/// Main error type for all mowlink operations.
///
/// Frame-level decode errors (`FrameTooShort`, `ChecksumMismatch`,
/// `DecryptFailed`) are local to a single inbound frame: the frame is
/// dropped, link state stays consistent and nothing reaches the caller.
/// Command-level errors (`Busy`, `Timeout`, `Disconnected`) resolve the
/// command's result future. Receive-sequence gaps are not errors at all;
/// they are logged and self-healed by the tracker.
#[derive(Debug, Error)]
pub enum MowlinkError {
    /// Inbound buffer shorter than the fixed frame header.
    #[error("frame too short: got {len} bytes, need at least {min}")]
    FrameTooShort { len: usize, min: usize },

    /// Outbound frame payload exceeds the one-byte length field.
    #[error("frame payload too large: {len} bytes (max 255)")]
    FrameTooLarge { len: usize },

    /// Trailing checksum did not match the computed value.
    #[error("frame checksum mismatch: computed {computed:#06x}, received {received:#06x}")]
    ChecksumMismatch { computed: u16, received: u16 },

    /// The injected payload transform rejected an encrypted frame.
    #[error("frame decrypt failed at sequence {sequence}")]
    DecryptFailed { sequence: u8 },

    /// A command is already in flight on this link.
    #[error("command already in flight")]
    Busy,

    /// No correlated reply arrived before the command deadline.
    #[error("command timed out")]
    Timeout,

    /// The link is down; any pending command resolves with this.
    #[error("link disconnected")]
    Disconnected,

    /// The transport refused the connection attempt.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] TransportError),

    /// Opaque transport failure during an established session.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type alias using MowlinkError.
pub type Result<T> = std::result::Result<T, MowlinkError>;
