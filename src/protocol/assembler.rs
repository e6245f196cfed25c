//! Notification assembly: inbound frames to complete logical messages.
//!
//! Consumes raw notification buffers one frame at a time, runs them through
//! the codec and the sequence tracker, and reassembles fragmented messages.
//! The physical link delivers serially, so at most one logical message is in
//! progress at a time.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::codec::decode_frame;
use super::frame::PackageType;
use super::sequence::SequenceTracker;
use crate::error::{MowlinkError, Result};

/// A reassembled, complete application-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    /// Package type of the frames that carried it.
    pub package_type: PackageType,
    /// Sub-type of the frames that carried it.
    pub sub_type: u8,
    /// Concatenated fragment payloads, in arrival order.
    pub payload: Bytes,
}

impl LogicalMessage {
    /// Check against an expected (package_type, sub_type) pair.
    #[inline]
    pub fn matches(&self, package_type: PackageType, sub_type: u8) -> bool {
        self.package_type == package_type && self.sub_type == sub_type
    }
}

/// Injected payload transform for links that negotiate encryption.
///
/// Keyed by the frame sequence number. The transform itself is out of
/// scope here; [`PlainTransform`] is the identity for links that never set
/// the encrypted bit.
pub trait FrameTransform: Send + Sync + 'static {
    /// Transform an outbound payload before framing.
    fn encrypt(&self, sequence: u8, payload: &[u8]) -> Result<Vec<u8>>;

    /// Invert the transform on an inbound frame payload.
    fn decrypt(&self, sequence: u8, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Identity transform for unencrypted links.
pub struct PlainTransform;

impl FrameTransform for PlainTransform {
    fn encrypt(&self, _sequence: u8, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn decrypt(&self, _sequence: u8, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }
}

/// What one call to [`NotificationAssembler::feed`] produced.
#[derive(Debug)]
pub enum FeedOutcome {
    /// Fragment appended; the message is still incomplete.
    Pending,
    /// The frame was a link-level ack for the given sequence.
    LinkAck(u8),
    /// A logical message completed with this frame.
    Complete(LogicalMessage),
}

struct PartialMessage {
    package_type: PackageType,
    sub_type: u8,
    buffer: BytesMut,
}

/// Reassembles inbound frames into logical messages.
pub struct NotificationAssembler {
    transform: Arc<dyn FrameTransform>,
    in_progress: Option<PartialMessage>,
}

impl NotificationAssembler {
    /// Create an assembler with the given payload transform.
    pub fn new(transform: Arc<dyn FrameTransform>) -> Self {
        Self {
            transform,
            in_progress: None,
        }
    }

    /// Consume one raw notification buffer.
    ///
    /// Decodes the frame, updates receive-sequence tracking, routes link
    /// acks to the tracker, and appends message fragments. Errors mean this
    /// frame was dropped; tracker and assembly state stay consistent and
    /// the caller just logs and moves on. A dropped fragment surfaces later
    /// as a decode failure or re-requested map frame, never as a wedged
    /// link.
    pub fn feed(&mut self, tracker: &mut SequenceTracker, raw: &[u8]) -> Result<FeedOutcome> {
        let frame = decode_frame(raw)?;
        tracker.observe_receive(frame.header.sequence);

        if frame.header.is_link_ack() {
            let acked = match frame.payload.first() {
                Some(&seq) => seq,
                None => {
                    return Err(MowlinkError::FrameTooShort {
                        len: raw.len(),
                        min: raw.len() + 1,
                    })
                }
            };
            if !tracker.notify_ack(acked) {
                tracing::debug!(acked, "link ack with no waiter");
            }
            return Ok(FeedOutcome::LinkAck(acked));
        }

        let payload = if frame.header.is_encrypted() {
            let sequence = frame.header.sequence;
            Bytes::from(self.transform.decrypt(sequence, &frame.payload).map_err(
                |error| {
                    tracing::warn!(sequence, %error, "dropping undecryptable frame");
                    MowlinkError::DecryptFailed { sequence }
                },
            )?)
        } else {
            frame.payload
        };

        let partial = self.in_progress.get_or_insert_with(|| PartialMessage {
            package_type: frame.header.package_type,
            sub_type: frame.header.sub_type,
            buffer: BytesMut::new(),
        });
        partial.buffer.extend_from_slice(&payload);

        if frame.header.has_fragment() {
            return Ok(FeedOutcome::Pending);
        }

        let complete = self.in_progress.take().expect("partial just inserted");
        Ok(FeedOutcome::Complete(LogicalMessage {
            package_type: complete.package_type,
            sub_type: complete.sub_type,
            payload: complete.buffer.freeze(),
        }))
    }

    /// Discard any in-progress message, e.g. on reconnect.
    pub fn reset(&mut self) {
        self.in_progress = None;
    }

    /// Check whether a message is currently being reassembled.
    pub fn has_partial(&self) -> bool {
        self.in_progress.is_some()
    }
}
