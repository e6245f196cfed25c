//! Per-connection sequence tracking and ack bookkeeping.
//!
//! Counters are owned by the connection, never process-global, so parallel
//! device sessions cannot bleed into each other. Receive tracking is
//! tolerant: a gap is logged and the expectation resynchronizes to the
//! observed sequence, the link keeps going.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{MowlinkError, Result};

/// Outcome of observing one inbound sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// The frame matched the expected sequence.
    InOrder,
    /// The frame did not; expectation has resynchronized to `got + 1`.
    Gap { expected: u8, got: u8 },
}

/// A registered wait for one link-level ack.
///
/// Produced by [`SequenceTracker::expect_ack`]; resolves when the matching
/// ack is fed to [`SequenceTracker::notify_ack`]. [`AckWait::wait`] bounds
/// the suspension with a deadline; callers that interleave waiting with
/// other work select on the inner receiver directly.
#[derive(Debug)]
pub struct AckWait(pub oneshot::Receiver<()>);

impl AckWait {
    /// Suspend until the ack arrives or `deadline` elapses.
    pub async fn wait(self, deadline: Duration) -> Result<()> {
        match tokio::time::timeout(deadline, self.0).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MowlinkError::Disconnected),
            Err(_) => Err(MowlinkError::Timeout),
        }
    }
}

/// Send/receive sequence state for one device connection.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    next_send: u8,
    expected_recv: Option<u8>,
    outstanding_acks: HashMap<u8, oneshot::Sender<()>>,
}

impl SequenceTracker {
    /// Create a tracker with both directions at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next outbound sequence number, wrapping mod 256.
    ///
    /// Every frame consumes one, fragments included.
    pub fn send_next(&mut self) -> u8 {
        let sequence = self.next_send;
        self.next_send = sequence.wrapping_add(1);
        sequence
    }

    /// Sequence the previous [`send_next`](Self::send_next) returned.
    pub fn last_sent(&self) -> u8 {
        self.next_send.wrapping_sub(1)
    }

    /// Observe one inbound sequence number.
    ///
    /// The first frame of a session seeds the expectation. A mismatch is
    /// reported as a gap but the expectation resynchronizes to `seq + 1`,
    /// so a lost frame costs exactly one gap report.
    pub fn observe_receive(&mut self, seq: u8) -> ReceiveStatus {
        let status = match self.expected_recv {
            Some(expected) if expected != seq => {
                tracing::warn!(expected, got = seq, "receive sequence gap, resyncing");
                ReceiveStatus::Gap { expected, got: seq }
            }
            _ => ReceiveStatus::InOrder,
        };
        self.expected_recv = Some(seq.wrapping_add(1));
        status
    }

    /// Register interest in the ack for `seq`.
    ///
    /// A second registration for the same sequence replaces the first,
    /// which then resolves as disconnected.
    pub fn expect_ack(&mut self, seq: u8) -> AckWait {
        let (tx, rx) = oneshot::channel();
        self.outstanding_acks.insert(seq, tx);
        AckWait(rx)
    }

    /// Resolve the wait registered for `seq`, if any.
    ///
    /// Returns whether a waiter existed; a stray ack is the caller's to log.
    pub fn notify_ack(&mut self, seq: u8) -> bool {
        match self.outstanding_acks.remove(&seq) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Drop the wait registered for `seq` without resolving it.
    pub fn cancel_ack(&mut self, seq: u8) {
        self.outstanding_acks.remove(&seq);
    }

    /// Drop all registered waits, e.g. on disconnect.
    pub fn clear_acks(&mut self) {
        self.outstanding_acks.clear();
    }
}
