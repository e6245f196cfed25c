//! Per-device command dispatcher.
//!
//! One spawned task owns the whole link: transport, sequence tracker,
//! assembler and the pending-command slot, mirroring the half-duplex
//! physical link with a single sequential state machine. The public
//! [`DispatcherHandle`] talks to it over a channel; multiple devices run as
//! fully independent tasks with nothing shared.
//!
//! ```text
//! Disconnected -> Connecting -> Idle <-> Busy -> Disconnecting -> Disconnected
//! ```
//!
//! At most one command is in flight; `submit` while Busy resolves `Busy`
//! immediately and nothing is queued internally. Callers own any
//! higher-level queue, so a latency-sensitive command is never silently
//! stuck behind a bulk map-sync fetch.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};

use super::command::{goodbye_notice, link_sync, CommandRequest, ReplyMatch};
use crate::error::{MowlinkError, Result};
use crate::protocol::{
    chunk, control, decode_header, encode_frame, ctrl_sub, FeedOutcome, FrameHeader,
    FrameTransform, LogicalMessage, NotificationAssembler, PackageType, SequenceTracker,
};
use crate::transport::DeviceTransport;

/// Link lifecycle state, observable through [`DispatcherHandle::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Idle,
    Busy,
    Disconnecting,
}

/// Fragment pacing for multi-frame commands.
///
/// `PerFragment` is the primary mode: each fragment of an ack-required
/// command waits for its link ack before the next write. `DelayOnly` is an
/// explicit degraded mode for firmware that acks unreliably mid-burst: a
/// fixed sleep between fragments, ack checked only after the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAckMode {
    PerFragment,
    DelayOnly(Duration),
}

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Default reply deadline per command.
    pub command_deadline: Duration,
    /// Deadline for one fragment's link ack.
    pub fragment_ack_deadline: Duration,
    /// Idle window with no submitted command before autonomous disconnect.
    pub idle_disconnect: Duration,
    /// Interval between autonomous link-sync submissions.
    pub keepalive_interval: Duration,
    /// Fragment pacing mode.
    pub chunk_ack_mode: ChunkAckMode,
    /// Command submitted right after a successful connect.
    pub handshake: Option<CommandRequest>,
    /// Keep-alive command template; `None` disables keep-alive.
    pub keepalive: Option<CommandRequest>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            command_deadline: Duration::from_secs(5),
            fragment_ack_deadline: Duration::from_secs(1),
            idle_disconnect: Duration::from_secs(90),
            keepalive_interval: Duration::from_secs(20),
            chunk_ack_mode: ChunkAckMode::PerFragment,
            handshake: Some(link_sync()),
            keepalive: Some(link_sync()),
        }
    }
}

enum Op {
    Connect {
        done: oneshot::Sender<Result<()>>,
    },
    Submit {
        request: CommandRequest,
        result: oneshot::Sender<Result<LogicalMessage>>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a spawned per-device dispatcher task.
///
/// Cheaply cloneable; all clones talk to the same link.
#[derive(Clone)]
pub struct DispatcherHandle {
    ops: mpsc::Sender<Op>,
    state: watch::Receiver<LinkState>,
}

impl DispatcherHandle {
    /// Establish the link. On success the dispatcher is Idle, the idle
    /// timer is running, and the configured handshake has been submitted
    /// (it may still occupy the in-flight slot briefly).
    pub async fn connect(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.ops
            .send(Op::Connect { done })
            .await
            .map_err(|_| MowlinkError::Disconnected)?;
        rx.await.map_err(|_| MowlinkError::Disconnected)?
    }

    /// Submit one command and suspend until its reply, timeout, or
    /// disconnection. Resolves `Busy` immediately if a command is already
    /// in flight.
    pub async fn submit(&self, request: CommandRequest) -> Result<LogicalMessage> {
        let (result, rx) = oneshot::channel();
        self.ops
            .send(Op::Submit { request, result })
            .await
            .map_err(|_| MowlinkError::Disconnected)?;
        rx.await.map_err(|_| MowlinkError::Disconnected)?
    }

    /// Tear the link down. Best-effort final notice, then the transport is
    /// released; any in-flight command resolves `Disconnected`.
    pub async fn disconnect(&self) {
        let (done, rx) = oneshot::channel();
        if self.ops.send(Op::Disconnect { done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch channel for link-state transitions.
    pub fn state_stream(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }
}

type ResultSink = Option<oneshot::Sender<Result<LogicalMessage>>>;

struct PendingCommand {
    sent_at: Instant,
    deadline: Instant,
    reply_window: Duration,
    last_sequence: u8,
    reply: ReplyMatch,
    frames: Vec<Vec<u8>>,
    retries_left: u8,
    result: ResultSink,
}

/// Spawn the dispatcher task for one device.
///
/// `notify_rx` carries raw inbound buffers, one per received frame;
/// completed messages that correlate with no in-flight command are
/// forwarded on `push_tx`.
pub fn spawn_dispatcher<T: DeviceTransport>(
    transport: T,
    notify_rx: mpsc::Receiver<Bytes>,
    push_tx: mpsc::Sender<LogicalMessage>,
    transform: Arc<dyn FrameTransform>,
    config: DispatcherConfig,
) -> (DispatcherHandle, JoinHandle<()>) {
    let (ops_tx, ops_rx) = mpsc::channel(8);
    let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);

    let idle_deadline = Instant::now() + config.idle_disconnect;
    let dispatcher = Dispatcher {
        transport,
        tracker: SequenceTracker::new(),
        assembler: NotificationAssembler::new(transform.clone()),
        transform,
        state_tx,
        pending: None,
        push_tx,
        config,
        idle_deadline,
    };
    let task = tokio::spawn(dispatcher.run(ops_rx, notify_rx));

    (
        DispatcherHandle {
            ops: ops_tx,
            state: state_rx,
        },
        task,
    )
}

struct Dispatcher<T> {
    transport: T,
    tracker: SequenceTracker,
    assembler: NotificationAssembler,
    transform: Arc<dyn FrameTransform>,
    state_tx: watch::Sender<LinkState>,
    pending: Option<PendingCommand>,
    push_tx: mpsc::Sender<LogicalMessage>,
    config: DispatcherConfig,
    idle_deadline: Instant,
}

impl<T: DeviceTransport> Dispatcher<T> {
    async fn run(mut self, mut ops: mpsc::Receiver<Op>, mut notify: mpsc::Receiver<Bytes>) {
        let mut keepalive = tokio::time::interval_at(
            Instant::now() + self.config.keepalive_interval,
            self.config.keepalive_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let reply_deadline = self
                .pending
                .as_ref()
                .map(|pending| pending.deadline)
                .unwrap_or_else(far_future);
            let idle_deadline = self.idle_deadline;

            tokio::select! {
                op = ops.recv() => match op {
                    Some(op) => self.handle_op(op, &mut notify).await,
                    None => {
                        // Every handle dropped: tear down and finish.
                        self.do_disconnect().await;
                        return;
                    }
                },
                raw = notify.recv() => match raw {
                    Some(raw) => self.process_raw(&raw).await,
                    None => {
                        if self.state() != LinkState::Disconnected {
                            tracing::warn!("notify stream closed, disconnecting");
                            self.force_disconnect().await;
                        }
                    }
                },
                _ = sleep_until(reply_deadline), if self.pending.is_some() => {
                    self.on_reply_deadline().await;
                }
                _ = keepalive.tick(), if self.keepalive_due() => {
                    self.run_keepalive(&mut notify).await;
                }
                _ = sleep_until(idle_deadline), if self.state() == LinkState::Idle => {
                    self.on_idle_timeout().await;
                }
            }
        }
    }

    fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
    }

    fn reset_idle_deadline(&mut self) {
        self.idle_deadline = Instant::now() + self.config.idle_disconnect;
    }

    fn keepalive_due(&self) -> bool {
        self.state() == LinkState::Idle
            && self.pending.is_none()
            && self.config.keepalive.is_some()
    }

    async fn handle_op(&mut self, op: Op, notify: &mut mpsc::Receiver<Bytes>) {
        match op {
            Op::Connect { done } => {
                let outcome = self.do_connect(notify).await;
                let _ = done.send(outcome);
            }
            Op::Submit { request, result } => {
                self.reset_idle_deadline();
                self.do_submit(request, Some(result), notify).await;
            }
            Op::Disconnect { done } => {
                self.do_disconnect().await;
                let _ = done.send(());
            }
        }
    }

    async fn do_connect(&mut self, notify: &mut mpsc::Receiver<Bytes>) -> Result<()> {
        if self.state() != LinkState::Disconnected {
            return Ok(());
        }
        self.set_state(LinkState::Connecting);

        match self.transport.connect().await {
            Ok(()) => {
                self.tracker = SequenceTracker::new();
                self.assembler.reset();
                self.set_state(LinkState::Idle);
                self.reset_idle_deadline();
                tracing::debug!("link connected");

                if let Some(handshake) = self.config.handshake.clone() {
                    self.do_submit(handshake, None, notify).await;
                }
                Ok(())
            }
            Err(error) => {
                tracing::warn!(%error, "connect failed");
                self.set_state(LinkState::Disconnected);
                Err(MowlinkError::ConnectFailed(error))
            }
        }
    }

    async fn do_submit(
        &mut self,
        request: CommandRequest,
        result: ResultSink,
        notify: &mut mpsc::Receiver<Bytes>,
    ) {
        match self.state() {
            LinkState::Busy => {
                Self::resolve(result, Err(MowlinkError::Busy));
                return;
            }
            LinkState::Idle => {}
            _ => {
                Self::resolve(result, Err(MowlinkError::Disconnected));
                return;
            }
        }
        self.set_state(LinkState::Busy);

        let (frames, sequences) = match self.build_frames(&request) {
            Ok(built) => built,
            Err(error) => {
                Self::resolve(result, Err(error));
                self.set_state(LinkState::Idle);
                return;
            }
        };

        // Register the pending slot before the first write: with
        // per-fragment acks the reply can already be drained while the
        // remaining fragments go out.
        if let Some(reply) = request.reply {
            let now = Instant::now();
            let reply_window = request.deadline.unwrap_or(self.config.command_deadline);
            self.pending = Some(PendingCommand {
                sent_at: now,
                deadline: now + reply_window,
                reply_window,
                last_sequence: *sequences.last().expect("at least one frame"),
                reply,
                frames: frames.clone(),
                retries_left: 1,
                result,
            });

            match self
                .write_frames(&frames, &sequences, request.ack_required, notify)
                .await
            {
                Ok(()) => {}
                Err(error @ MowlinkError::Transport(_)) => {
                    if let Some(pending) = self.pending.take() {
                        Self::resolve(pending.result, Err(error));
                    }
                    self.force_disconnect().await;
                }
                Err(error) => {
                    if let Some(pending) = self.pending.take() {
                        Self::resolve(pending.result, Err(error));
                    }
                    self.set_state(LinkState::Idle);
                }
            }
            return;
        }

        // Fire-and-forget: resolved once everything is on the wire.
        match self
            .write_frames(&frames, &sequences, request.ack_required, notify)
            .await
        {
            Ok(()) => {
                Self::resolve(
                    result,
                    Ok(LogicalMessage {
                        package_type: request.package_type,
                        sub_type: request.sub_type,
                        payload: Bytes::new(),
                    }),
                );
                self.set_state(LinkState::Idle);
            }
            Err(error @ MowlinkError::Transport(_)) => {
                Self::resolve(result, Err(error));
                self.force_disconnect().await;
            }
            Err(error) => {
                Self::resolve(result, Err(error));
                self.set_state(LinkState::Idle);
            }
        }
    }

    /// Chunk, per-fragment encrypt and encode one command into wire frames.
    fn build_frames(&mut self, request: &CommandRequest) -> Result<(Vec<Vec<u8>>, Vec<u8>)> {
        let mut base_bits = 0u8;
        if request.checksum {
            base_bits |= control::CHECKSUM;
        }
        if request.ack_required {
            base_bits |= control::ACK_REQUIRED;
        }
        if request.encrypted {
            base_bits |= control::ENCRYPTED;
        }

        let pieces = chunk(&request.payload, self.transport.max_chunk_len());
        let mut frames = Vec::with_capacity(pieces.len());
        let mut sequences = Vec::with_capacity(pieces.len());

        for piece in pieces {
            let sequence = self.tracker.send_next();
            let mut bits = base_bits;
            if piece.has_fragment {
                bits |= control::HAS_FRAGMENT;
            }

            let body;
            let body_ref: &[u8] = if request.encrypted {
                body = self.transform.encrypt(sequence, piece.data)?;
                &body
            } else {
                piece.data
            };

            let header = FrameHeader::new(request.package_type, request.sub_type, bits, sequence);
            frames.push(encode_frame(&header, body_ref)?);
            sequences.push(sequence);
        }

        Ok((frames, sequences))
    }

    /// Write one command's frames in order, observing the configured
    /// fragment pacing.
    ///
    /// The ops channel is not drained while a burst is in progress: a
    /// `submit` arriving mid-burst gets its `Busy` when the loop resumes,
    /// after the last fragment (and its ack wait) is done.
    async fn write_frames(
        &mut self,
        frames: &[Vec<u8>],
        sequences: &[u8],
        ack_required: bool,
        notify: &mut mpsc::Receiver<Bytes>,
    ) -> Result<()> {
        let last = frames.len() - 1;

        match self.config.chunk_ack_mode {
            ChunkAckMode::PerFragment => {
                for (i, frame) in frames.iter().enumerate() {
                    self.transport.write(frame).await?;
                    if ack_required {
                        self.await_link_ack(sequences[i], notify).await?;
                    }
                }
            }
            ChunkAckMode::DelayOnly(delay) => {
                for (i, frame) in frames.iter().enumerate() {
                    self.transport.write(frame).await?;
                    if i != last {
                        tokio::time::sleep(delay).await;
                    }
                }
                if ack_required {
                    self.await_link_ack(sequences[last], notify).await?;
                }
            }
        }
        Ok(())
    }

    /// Suspend until the link ack for `sequence`, still draining inbound
    /// frames so the ack can actually be observed.
    async fn await_link_ack(
        &mut self,
        sequence: u8,
        notify: &mut mpsc::Receiver<Bytes>,
    ) -> Result<()> {
        let mut wait = self.tracker.expect_ack(sequence);
        let deadline = Instant::now() + self.config.fragment_ack_deadline;

        loop {
            tokio::select! {
                acked = &mut wait.0 => {
                    return acked.map_err(|_| MowlinkError::Disconnected);
                }
                raw = notify.recv() => match raw {
                    Some(raw) => self.process_raw(&raw).await,
                    None => {
                        self.tracker.cancel_ack(sequence);
                        return Err(MowlinkError::Disconnected);
                    }
                },
                _ = sleep_until(deadline) => {
                    self.tracker.cancel_ack(sequence);
                    tracing::warn!(sequence, "fragment ack not received before deadline");
                    return Err(MowlinkError::Timeout);
                }
            }
        }
    }

    async fn process_raw(&mut self, raw: &[u8]) {
        // The peer asked for a link ack on this frame; send it after the
        // frame has gone through normal processing.
        let ack_target = decode_header(raw)
            .ok()
            .filter(|header| header.ack_required() && !header.is_link_ack())
            .map(|header| header.sequence);

        match self.assembler.feed(&mut self.tracker, raw) {
            Err(error) => tracing::warn!(%error, "dropping inbound frame"),
            Ok(FeedOutcome::Pending) => {}
            Ok(FeedOutcome::LinkAck(sequence)) => tracing::trace!(sequence, "link ack"),
            Ok(FeedOutcome::Complete(message)) => self.route_message(message),
        }

        if let Some(sequence) = ack_target {
            self.send_link_ack(sequence).await;
        }
    }

    fn route_message(&mut self, message: LogicalMessage) {
        let correlates = self
            .pending
            .as_ref()
            .map(|pending| message.matches(pending.reply.package_type, pending.reply.sub_type))
            .unwrap_or(false);

        if correlates {
            let pending = self.pending.take().expect("checked above");
            tracing::debug!(elapsed = ?pending.sent_at.elapsed(), "command reply arrived");
            Self::resolve(pending.result, Ok(message));
            self.set_state(LinkState::Idle);
        } else if let Err(error) = self.push_tx.try_send(message) {
            tracing::warn!(%error, "push handler backlogged, dropping message");
        }
    }

    async fn send_link_ack(&mut self, acked: u8) {
        if !matches!(self.state(), LinkState::Idle | LinkState::Busy) {
            return;
        }
        let sequence = self.tracker.send_next();
        let header = FrameHeader::new(PackageType::Ctrl, ctrl_sub::ACK, 0, sequence);
        match encode_frame(&header, &[acked]) {
            Ok(frame) => {
                if let Err(error) = self.transport.write(&frame).await {
                    tracing::warn!(%error, "failed to write link ack");
                }
            }
            Err(error) => tracing::error!(%error, "link ack encode failed"),
        }
    }

    async fn on_reply_deadline(&mut self) {
        let (last_sequence, frames) = match self.pending.as_mut() {
            None => return,
            Some(pending) if pending.retries_left > 0 => {
                pending.retries_left -= 1;
                pending.deadline = Instant::now() + pending.reply_window;
                (pending.last_sequence, Some(pending.frames.clone()))
            }
            Some(pending) => (pending.last_sequence, None),
        };

        match frames {
            Some(frames) => {
                tracing::warn!(last_sequence, "no reply before deadline, retransmitting once");
                for frame in &frames {
                    if let Err(error) = self.transport.write(frame).await {
                        tracing::warn!(%error, "retransmission failed");
                        let pending = self.pending.take().expect("pending checked");
                        Self::resolve(pending.result, Err(error.into()));
                        self.force_disconnect().await;
                        return;
                    }
                }
            }
            None => {
                let pending = self.pending.take().expect("pending checked");
                tracing::warn!(last_sequence, "command timed out");
                Self::resolve(pending.result, Err(MowlinkError::Timeout));
                self.set_state(LinkState::Idle);
            }
        }
    }

    async fn run_keepalive(&mut self, notify: &mut mpsc::Receiver<Bytes>) {
        let Some(request) = self.config.keepalive.clone() else {
            return;
        };
        tracing::debug!("keep-alive link sync");
        self.do_submit(request, None, notify).await;
    }

    async fn on_idle_timeout(&mut self) {
        if self.state() != LinkState::Idle || self.pending.is_some() {
            return;
        }
        tracing::info!("idle window elapsed, disconnecting");
        self.do_disconnect().await;
    }

    async fn do_disconnect(&mut self) {
        match self.state() {
            LinkState::Disconnected => return,
            LinkState::Connecting | LinkState::Disconnecting => {
                self.finish_disconnect().await;
                return;
            }
            LinkState::Idle | LinkState::Busy => {}
        }
        self.set_state(LinkState::Disconnecting);

        // Best-effort final notice; failures are not interesting.
        let notice = goodbye_notice();
        let sequence = self.tracker.send_next();
        let header = FrameHeader::new(notice.package_type, notice.sub_type, 0, sequence);
        if let Ok(frame) = encode_frame(&header, &notice.payload) {
            if let Err(error) = self.transport.write(&frame).await {
                tracing::debug!(%error, "goodbye notice not delivered");
            }
        }

        self.finish_disconnect().await;
    }

    /// Transport is already failing: skip the final notice.
    async fn force_disconnect(&mut self) {
        if self.state() == LinkState::Disconnected {
            return;
        }
        self.set_state(LinkState::Disconnecting);
        self.finish_disconnect().await;
    }

    async fn finish_disconnect(&mut self) {
        self.transport.close().await;
        self.tracker.clear_acks();
        self.assembler.reset();
        if let Some(pending) = self.pending.take() {
            Self::resolve(pending.result, Err(MowlinkError::Disconnected));
        }
        self.set_state(LinkState::Disconnected);
    }

    fn resolve(result: ResultSink, outcome: Result<LogicalMessage>) {
        match result {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => match outcome {
                Ok(_) => tracing::debug!("internal command completed"),
                Err(error) => tracing::warn!(%error, "internal command failed"),
            },
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}
