//! Common utilities and types shared across chronodb

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod utils;

pub use config::{Config, WalSyncPolicy};
pub use error::{Error, PartialQuery, Result, ShardWriteReport};
pub use hash::{hrw_hash, select_replicas};
pub use metrics::METRICS;
pub use utils::{crc32, format_millis, parse_duration, timestamp_now_millis};
