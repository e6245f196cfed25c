//! Incremental map replication.
//!
//! Synchronisation is split into a pure planner and a thin async driver.
//! [`MapSyncEngine::apply`] folds decoded map messages into the replica and
//! [`MapSyncEngine::plan`] inspects the replica and names the single next
//! fetch, so the whole re-request strategy is testable without a link. The
//! async [`MapSyncEngine::sync`] just alternates submit and drain until the
//! planner has nothing left to ask for.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::store::{GeometryKind, MapReplica};
use crate::dispatch::{CommandRequest, DispatcherHandle};
use crate::error::{MowlinkError, Result};

/// A decoded device-to-app map notification.
///
/// Producing these from [`LogicalMessage`](crate::LogicalMessage) payloads
/// is the caller's job; the body encoding is firmware-specific while the
/// replication strategy below is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapMessage {
    /// One frame of the root hash list for `sub_command`.
    HashList {
        sub_command: u8,
        total_frame: u32,
        frame_index: u32,
        hashes: Vec<u64>,
    },
    /// One frame of a hash-addressed geometry body.
    GeometryFrame {
        kind: GeometryKind,
        hash: u64,
        total_frame: u32,
        frame_index: u32,
        record: Bytes,
    },
    /// One frame of a live mowing-transaction path.
    TransactionPath {
        transaction_id: i64,
        total_frame: u32,
        frame_index: u32,
        record: Bytes,
    },
    /// Device-computed digest of one root hash list.
    SummaryHash { sub_command: u8, digest: u64 },
}

/// The single next fetch the planner wants issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    FetchHashList { sub_command: u8, start_frame: u32 },
    FetchGeometry {
        kind: GeometryKind,
        hash: u64,
        start_frame: u32,
    },
}

/// Builds the device-specific request bodies for the two fetch shapes.
pub trait MapCommandCatalogue: Send + Sync {
    fn hash_list_request(&self, sub_command: u8, start_frame: u32) -> CommandRequest;
    fn geometry_request(&self, kind: GeometryKind, hash: u64, start_frame: u32) -> CommandRequest;
}

/// Driver pacing.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long to wait for the first frame after a fetch.
    pub first_frame_deadline: Duration,
    /// Quiet period ending a burst of frames.
    pub quiet_period: Duration,
    /// Consecutive fetches with no frames at all before giving up.
    pub max_stalled_rounds: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            first_frame_deadline: Duration::from_secs(3),
            quiet_period: Duration::from_millis(300),
            max_stalled_rounds: 3,
        }
    }
}

pub struct MapSyncEngine<C> {
    replica: MapReplica,
    catalogue: C,
    config: SyncConfig,
}

impl<C: MapCommandCatalogue> MapSyncEngine<C> {
    pub fn new(catalogue: C) -> Self {
        Self::with_replica(catalogue, MapReplica::new())
    }

    /// Resume from a previously cached replica.
    pub fn with_replica(catalogue: C, replica: MapReplica) -> Self {
        Self {
            replica,
            catalogue,
            config: SyncConfig::default(),
        }
    }

    pub fn set_config(&mut self, config: SyncConfig) {
        self.config = config;
    }

    pub fn replica(&self) -> &MapReplica {
        &self.replica
    }

    pub fn into_replica(self) -> MapReplica {
        self.replica
    }

    /// Fold one notification into the replica. Safe to call with
    /// duplicates and in any order.
    pub fn apply(&mut self, message: MapMessage) {
        match message {
            MapMessage::HashList {
                sub_command,
                total_frame,
                frame_index,
                hashes,
            } => {
                let list = self.replica.root_list_mut(sub_command);
                list.insert(total_frame, frame_index, hashes);
                if list.is_complete() {
                    let advertised = list.hashes();
                    if let Some(kind) = GeometryKind::from_sub_command(sub_command) {
                        self.replica.geometry.retain_hashes(kind, &advertised);
                    }
                }
            }
            MapMessage::GeometryFrame {
                kind,
                hash,
                total_frame,
                frame_index,
                record,
            } => {
                self.replica
                    .geometry
                    .insert(kind, hash, total_frame, frame_index, record);
            }
            MapMessage::TransactionPath {
                transaction_id,
                total_frame,
                frame_index,
                record,
            } => {
                self.replica
                    .live_paths
                    .insert(transaction_id, total_frame, frame_index, record);
            }
            MapMessage::SummaryHash {
                sub_command,
                digest,
            } => {
                if let Some(list) = self.replica.root_list(sub_command) {
                    if !list.is_complete() || list.digest() != digest {
                        tracing::info!(sub_command, "summary hash mismatch, refetching root list");
                        self.replica.invalidate_root_list(sub_command);
                    }
                }
            }
        }
    }

    /// Name the next fetch needed to complete `kind`, or `None` when the
    /// root list and every advertised body are fully present.
    pub fn plan(&self, kind: GeometryKind) -> Option<SyncAction> {
        let sub_command = kind.sub_command();
        let list = match self.replica.root_list(sub_command) {
            None => {
                return Some(SyncAction::FetchHashList {
                    sub_command,
                    start_frame: 1,
                })
            }
            Some(list) => list,
        };
        if !list.is_complete() {
            return Some(SyncAction::FetchHashList {
                sub_command,
                start_frame: resume_frame(&list.missing_frames()),
            });
        }

        for hash in list.hashes() {
            match self.replica.geometry.get(kind, hash) {
                None => {
                    return Some(SyncAction::FetchGeometry {
                        kind,
                        hash,
                        start_frame: 1,
                    })
                }
                Some(set) if !set.is_complete() => {
                    return Some(SyncAction::FetchGeometry {
                        kind,
                        hash,
                        start_frame: resume_frame(&set.missing_frames()),
                    })
                }
                Some(_) => {}
            }
        }
        None
    }

    /// Drive `kind` to completion over a live link. `messages` must carry
    /// the decoded map notifications for this device; frames for other
    /// kinds that arrive mid-sync are folded in too, never dropped.
    pub async fn sync(
        &mut self,
        handle: &DispatcherHandle,
        messages: &mut mpsc::Receiver<MapMessage>,
        kind: GeometryKind,
    ) -> Result<()> {
        let mut stalled = 0u32;

        while let Some(action) = self.plan(kind) {
            tracing::debug!(?action, "map sync fetch");
            let request = match action {
                SyncAction::FetchHashList {
                    sub_command,
                    start_frame,
                } => self.catalogue.hash_list_request(sub_command, start_frame),
                SyncAction::FetchGeometry {
                    kind,
                    hash,
                    start_frame,
                } => self.catalogue.geometry_request(kind, hash, start_frame),
            };
            handle.submit(request).await?;

            if self.drain_batch(messages).await? {
                stalled = 0;
            } else {
                stalled += 1;
                if stalled >= self.config.max_stalled_rounds {
                    tracing::warn!(?kind, stalled, "map sync made no progress, giving up");
                    return Err(MowlinkError::Timeout);
                }
            }
        }
        Ok(())
    }

    /// Sync every geometry kind in wire order.
    pub async fn sync_all(
        &mut self,
        handle: &DispatcherHandle,
        messages: &mut mpsc::Receiver<MapMessage>,
    ) -> Result<()> {
        for kind in GeometryKind::ALL {
            self.sync(handle, messages, kind).await?;
        }
        Ok(())
    }

    /// Apply frames until the device goes quiet. Returns whether anything
    /// arrived at all.
    async fn drain_batch(&mut self, messages: &mut mpsc::Receiver<MapMessage>) -> Result<bool> {
        let mut progress = false;
        let mut window = self.config.first_frame_deadline;

        loop {
            match timeout(window, messages.recv()).await {
                Ok(Some(message)) => {
                    self.apply(message);
                    progress = true;
                    window = self.config.quiet_period;
                }
                Ok(None) => return Err(MowlinkError::Disconnected),
                Err(_) => return Ok(progress),
            }
        }
    }
}

/// Re-request start point: one frame before the first gap, floored at 1,
/// so the overlap confirms the device is answering from the right offset.
fn resume_frame(missing: &[u32]) -> u32 {
    match missing.first() {
        Some(first) => (*first).saturating_sub(1).max(1),
        None => 1,
    }
}
