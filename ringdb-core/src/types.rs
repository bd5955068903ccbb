//! Core types for RingDB

use crate::{RingError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp in seconds since Unix epoch
pub type Timestamp = i64;

/// Metric identifier, allocated by the registry or pinned by the caller
pub type MetricId = u64;

/// Sample semantics of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Instantaneous value; stored as-is
    Gauge,
    /// Cumulative raw value; rates are derived at query time
    Counter,
}

impl MetricType {
    /// Stable on-disk encoding (gauge=0, counter=1)
    pub fn as_u8(self) -> u8 {
        match self {
            MetricType::Gauge => 0,
            MetricType::Counter => 1,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(MetricType::Gauge),
            1 => Ok(MetricType::Counter),
            other => Err(RingError::BackendFatal(format!(
                "invalid metric type tag: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricType::Gauge => write!(f, "gauge"),
            MetricType::Counter => write!(f, "counter"),
        }
    }
}

/// Tag set of a metric; sorted so identity comparison is order-independent
pub type TagMap = BTreeMap<String, String>;

/// Persistent record describing a metric's identity and ring geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub metric_id: MetricId,
    pub name: String,
    #[serde(default)]
    pub tags: TagMap,
    /// Nominal sampling interval in seconds; sets slot width
    pub step: u32,
    /// Ring length; `step * slots` is the retention window
    pub slots: u32,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub created_at: Timestamp,
    #[serde(skip)]
    pub deleting: bool,
}

impl MetricDescriptor {
    /// Slot a timestamp hashes to under this descriptor's geometry
    pub fn slot_for(&self, ts: Timestamp) -> u32 {
        slot_for(ts, self.step, self.slots)
    }

    /// Window index of a timestamp (`ts` floor-divided by `step`)
    pub fn window_for(&self, ts: Timestamp) -> i64 {
        ts.div_euclid(i64::from(self.step))
    }

    /// Retention window in seconds
    pub fn window_secs(&self) -> u64 {
        u64::from(self.step) * u64::from(self.slots)
    }
}

/// Slot computation: `(ts // step) mod slots`, flooring toward negative infinity
pub fn slot_for(ts: Timestamp, step: u32, slots: u32) -> u32 {
    debug_assert!(step >= 1 && slots >= 1);
    let window = ts.div_euclid(i64::from(step));
    window.rem_euclid(i64::from(slots)) as u32
}

/// A single stored sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub ts: Timestamp,
    pub value: f64,
}

/// Advisory last-ingested state for a counter metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterState {
    pub last_ts: Timestamp,
    pub last_raw: f64,
}

/// Inclusive time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Duration in seconds; zero-width ranges still cover one instant
    pub fn duration(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }
}

/// How an ingest request identifies its metric
#[derive(Debug, Clone)]
pub enum MetricRef {
    /// Caller pinned the id (fixed-id collectors)
    ById(MetricId),
    /// Lazily created from the `(name, tags)` identity
    ByName { name: String, tags: TagMap },
}

/// A name/tag selector with an alias for SQL placeholder substitution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selector {
    pub metric: String,
    #[serde(default)]
    pub tags: TagMap,
    #[serde(default)]
    pub alias: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_for() {
        assert_eq!(slot_for(1_700_000_000, 60, 1440), 1040);
        assert_eq!(slot_for(100, 1, 4), 0);
        assert_eq!(slot_for(104, 1, 4), 0);
        assert_eq!(slot_for(103, 1, 4), 3);
    }

    #[test]
    fn test_slot_for_negative_ts_floors() {
        // -1 // 60 == -1, and -1 mod 10 == 9
        assert_eq!(slot_for(-1, 60, 10), 9);
        assert_eq!(slot_for(-60, 60, 10), 9);
        assert_eq!(slot_for(-61, 60, 10), 8);
    }

    #[test]
    fn test_metric_type_roundtrip() {
        assert_eq!(MetricType::from_u8(0).unwrap(), MetricType::Gauge);
        assert_eq!(MetricType::from_u8(1).unwrap(), MetricType::Counter);
        assert!(MetricType::from_u8(7).is_err());
    }

    #[test]
    fn test_time_range() {
        let r = TimeRange::new(100, 200);
        assert!(r.contains(100));
        assert!(r.contains(200));
        assert!(!r.contains(201));
        assert_eq!(r.duration(), 100);
    }
}
