//! Hash-addressed map replication.
//!
//! The device holds the authoritative mowing map and advertises it as flat
//! hash lists per geometry family. The client replicates lazily: compare
//! hash inventories, fetch only bodies it does not already hold, and
//! re-request only the frames that went missing. [`store`] is the replica
//! itself, [`engine`] the planner and sync driver on top of it.

mod engine;
mod store;

pub use engine::{MapCommandCatalogue, MapMessage, MapSyncEngine, SyncAction, SyncConfig};
pub use store::{
    FrameSet, GeometryKind, HashedGeometryCollection, MapReplica, RootHashList,
    TransactionPathSet,
};
