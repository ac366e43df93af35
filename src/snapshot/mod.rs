//! Snapshot history and delta compression

pub mod delta;
pub mod entity;
pub mod history;

pub use delta::{encode_snapshot, select_baseline, Baseline, DeltaStats, FullReason, SnapshotPayload};
pub use entity::{EntityDelta, EntityNum, EntityState, EntityUpdate};
pub use history::{ClientFrames, ClientSnapshotRecord, HistoryError, SnapshotHistory};
