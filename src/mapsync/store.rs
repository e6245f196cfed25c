//! Hash-addressed map replica.
//!
//! The device is the source of truth for all geometry. The replica keeps
//! whatever has arrived so far, organised exactly the way the device
//! addresses it on the wire: root hash lists per sub-command, geometry
//! records keyed by 64-bit content hash, and live transaction paths keyed
//! by transaction id. Every multi-frame body is held as a [`FrameSet`], so
//! partial transfers survive and missing frames can be re-requested.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use bytes::Bytes;
use crc::{Crc, CRC_64_ECMA_182};
use serde::{Deserialize, Serialize};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Geometry families the device replicates, in wire order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum GeometryKind {
    Area,
    Obstacle,
    Path,
    Dump,
    Svg,
    Line,
    SafetyZone,
}

impl GeometryKind {
    pub const ALL: [GeometryKind; 7] = [
        GeometryKind::Area,
        GeometryKind::Obstacle,
        GeometryKind::Path,
        GeometryKind::Dump,
        GeometryKind::Svg,
        GeometryKind::Line,
        GeometryKind::SafetyZone,
    ];

    /// Root hash-list sub-command that enumerates this kind.
    pub fn sub_command(self) -> u8 {
        match self {
            GeometryKind::Area => 0,
            GeometryKind::Obstacle => 1,
            GeometryKind::Path => 2,
            GeometryKind::Dump => 3,
            GeometryKind::Svg => 4,
            GeometryKind::Line => 5,
            GeometryKind::SafetyZone => 6,
        }
    }

    pub fn from_sub_command(sub_command: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.sub_command() == sub_command)
    }
}

/// One multi-frame body, frames numbered 1..=total_frame.
///
/// `total_frame == 0` means the body is known to be empty, which counts as
/// complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSet<R> {
    total_frame: u32,
    frames: BTreeMap<u32, R>,
}

impl<R> FrameSet<R> {
    pub fn new() -> Self {
        Self {
            total_frame: 0,
            frames: BTreeMap::new(),
        }
    }

    /// Record one frame. The advertised total travels with every frame, so
    /// each insert refreshes it; a changed total means the body was
    /// rewritten on the device and stale frames outside the new range are
    /// dropped.
    pub fn insert(&mut self, total_frame: u32, frame_index: u32, record: R) {
        if total_frame != self.total_frame {
            self.total_frame = total_frame;
            self.frames.retain(|index, _| *index <= total_frame);
        }
        if frame_index == 0 || frame_index > total_frame {
            tracing::warn!(frame_index, total_frame, "frame index out of range, ignoring");
            return;
        }
        self.frames.insert(frame_index, record);
    }

    pub fn total_frame(&self) -> u32 {
        self.total_frame
    }

    pub fn is_complete(&self) -> bool {
        self.frames.len() as u32 == self.total_frame
    }

    /// Frame indices still absent, ascending.
    pub fn missing_frames(&self) -> Vec<u32> {
        (1..=self.total_frame)
            .filter(|index| !self.frames.contains_key(index))
            .collect()
    }

    /// Frames in index order; meaningful once complete.
    pub fn records(&self) -> impl Iterator<Item = &R> {
        self.frames.values()
    }
}

/// Root hash list for one sub-command: the device's current inventory of
/// content hashes for that geometry family.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootHashList {
    set: FrameSet<Vec<u64>>,
}

impl RootHashList {
    pub fn frame_set(&self) -> &FrameSet<Vec<u64>> {
        &self.set
    }

    pub fn insert(&mut self, total_frame: u32, frame_index: u32, hashes: Vec<u64>) {
        self.set.insert(total_frame, frame_index, hashes);
    }

    pub fn is_complete(&self) -> bool {
        self.set.is_complete()
    }

    pub fn missing_frames(&self) -> Vec<u32> {
        self.set.missing_frames()
    }

    /// All advertised hashes in frame order. Only meaningful when complete.
    pub fn hashes(&self) -> Vec<u64> {
        self.set.records().flatten().copied().collect()
    }

    /// CRC-64 over the concatenated big-endian hash words, compared against
    /// the device's summary hash to detect a stale inventory cheaply.
    pub fn digest(&self) -> u64 {
        let mut digest = CRC64.digest();
        for hash in self.hashes() {
            digest.update(&hash.to_be_bytes());
        }
        digest.finalize()
    }
}

/// Geometry bodies grouped by kind, each keyed by content hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HashedGeometryCollection {
    buckets: BTreeMap<GeometryKind, BTreeMap<u64, FrameSet<Bytes>>>,
}

impl HashedGeometryCollection {
    pub fn insert(
        &mut self,
        kind: GeometryKind,
        hash: u64,
        total_frame: u32,
        frame_index: u32,
        record: Bytes,
    ) {
        self.buckets
            .entry(kind)
            .or_default()
            .entry(hash)
            .or_default()
            .insert(total_frame, frame_index, record);
    }

    pub fn get(&self, kind: GeometryKind, hash: u64) -> Option<&FrameSet<Bytes>> {
        self.buckets.get(&kind).and_then(|bucket| bucket.get(&hash))
    }

    pub fn bucket(&self, kind: GeometryKind) -> Option<&BTreeMap<u64, FrameSet<Bytes>>> {
        self.buckets.get(&kind)
    }

    /// Drop bodies whose hash the device no longer advertises.
    pub fn retain_hashes(&mut self, kind: GeometryKind, advertised: &[u64]) {
        if let Some(bucket) = self.buckets.get_mut(&kind) {
            bucket.retain(|hash, _| advertised.contains(hash));
        }
    }
}

/// Live mowing-transaction paths, keyed by transaction id. These stream in
/// unsolicited while the device works and are never hash-addressed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionPathSet {
    paths: BTreeMap<i64, FrameSet<Bytes>>,
}

impl TransactionPathSet {
    pub fn insert(
        &mut self,
        transaction_id: i64,
        total_frame: u32,
        frame_index: u32,
        record: Bytes,
    ) {
        self.paths
            .entry(transaction_id)
            .or_default()
            .insert(total_frame, frame_index, record);
    }

    pub fn get(&self, transaction_id: i64) -> Option<&FrameSet<Bytes>> {
        self.paths.get(&transaction_id)
    }

    pub fn transaction_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.paths.keys().copied()
    }
}

/// The full client-side map replica.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapReplica {
    root_lists: BTreeMap<u8, RootHashList>,
    pub geometry: HashedGeometryCollection,
    pub live_paths: TransactionPathSet,
}

impl MapReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_list(&self, sub_command: u8) -> Option<&RootHashList> {
        self.root_lists.get(&sub_command)
    }

    pub fn root_list_mut(&mut self, sub_command: u8) -> &mut RootHashList {
        self.root_lists.entry(sub_command).or_default()
    }

    /// Forget one sub-command's inventory so it is fetched afresh. Geometry
    /// bodies stay; still-advertised hashes are reused once the new list
    /// arrives.
    pub fn invalidate_root_list(&mut self, sub_command: u8) {
        self.root_lists.remove(&sub_command);
    }

    /// Persist the replica as JSON so a later session resumes with warm
    /// hashes instead of refetching everything.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        std::fs::write(path, json)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))
    }
}
