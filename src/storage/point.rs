//! Write and query payloads
//!
//! Ingest front-ends hand the core already-parsed points; nothing here parses a wire
//! protocol.

use crate::cluster::ServerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
}

/// One timestamped sample of a series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub series: String,
    /// Unix milliseconds
    pub timestamp: i64,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Point {
    pub fn new(series: impl Into<String>, timestamp: i64) -> Self {
        Self {
            series: series.into(),
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Points accepted as one logical write
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WritePayload {
    pub points: Vec<Point>,
}

impl WritePayload {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// A time-range read against one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardQuery {
    /// Restrict to one series; all series if `None`
    pub series: Option<String>,
    /// Inclusive start, unix milliseconds
    pub start: i64,
    /// Exclusive end, unix milliseconds
    pub end: i64,
    pub limit: Option<usize>,
}

impl ShardQuery {
    pub fn range(start: i64, end: i64) -> Self {
        Self {
            series: None,
            start,
            end,
            limit: None,
        }
    }

    pub fn series(mut self, series: impl Into<String>) -> Self {
        self.series = Some(series.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, point: &Point) -> bool {
        point.timestamp >= self.start
            && point.timestamp < self.end
            && self.series.as_deref().map_or(true, |s| s == point.series)
    }
}

/// Identity of a logical write: the coordinating server and its WAL sequence.
///
/// Every owner stores points under the same `WriteId`, so re-applying a
/// forwarded or replayed write overwrites instead of duplicating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriteId {
    pub server: ServerId,
    pub sequence: u64,
}

impl WriteId {
    pub fn new(server: ServerId, sequence: u64) -> Self {
        Self { server, sequence }
    }
}

impl std::fmt::Display for WriteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.server, self.sequence)
    }
}

/// Sort by (series, timestamp) and apply an optional limit.
pub fn merge_points(mut points: Vec<Point>, limit: Option<usize>) -> Vec<Point> {
    points.sort_by(|a, b| {
        a.series
            .cmp(&b.series)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
    if let Some(limit) = limit {
        points.truncate(limit);
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_matches_half_open_range() {
        let query = ShardQuery::range(100, 200).series("cpu");
        assert!(query.matches(&Point::new("cpu", 100)));
        assert!(query.matches(&Point::new("cpu", 199)));
        assert!(!query.matches(&Point::new("cpu", 200)));
        assert!(!query.matches(&Point::new("mem", 150)));
    }

    #[test]
    fn test_merge_points_orders_and_limits() {
        let points = vec![
            Point::new("mem", 5),
            Point::new("cpu", 9),
            Point::new("cpu", 1),
        ];
        let merged = merge_points(points, Some(2));
        assert_eq!(merged.len(), 2);
        assert_eq!((merged[0].series.as_str(), merged[0].timestamp), ("cpu", 1));
        assert_eq!((merged[1].series.as_str(), merged[1].timestamp), ("cpu", 9));
    }
}
