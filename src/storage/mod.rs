//! Local durability: the segment log, the WAL built on it, and per-shard storage.

pub mod compaction;
pub mod point;
pub mod segment;
pub mod shard;
pub mod wal;

pub use compaction::CompactionManager;
pub use point::{merge_points, FieldValue, Point, ShardQuery, WriteId, WritePayload};
pub use segment::{LogRecord, SegmentLog};
pub use shard::ShardStore;
pub use wal::{WalEntry, WalRecord, WalReplay, WriteAheadLog};
