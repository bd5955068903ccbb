//! Counter state
//!
//! Counters store their raw cumulative value in the sample ring, so rates
//! are derived at query time (`bucket_rate`, `counter_rate`). The
//! `(3, metric_id)` record tracks the last ingested `(ts, raw)` pair; it is
//! purely advisory and reset detection stays in the query layer.

use crate::backend::{retrying, Backend, Deadline};
use crate::codec;
use crate::registry::load_descriptor;
use crate::{CounterState, MetricId, MetricType, Result, RingError, Sample, Timestamp};
use std::sync::Arc;
use tracing::debug;

pub struct CounterStore {
    backend: Arc<dyn Backend>,
}

impl CounterStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Write a raw cumulative sample and advance the advisory last-state.
    ///
    /// The last-state only moves forward: after a successful ingest its
    /// timestamp is >= every previously ingested timestamp.
    pub fn ingest(&self, metric_id: MetricId, ts: Timestamp, raw_value: f64) -> Result<()> {
        retrying(self.backend.as_ref(), Deadline::default_op(), |txn| {
            let descriptor = load_descriptor(txn, metric_id)?
                .ok_or_else(|| RingError::NotFound(format!("metric {}", metric_id)))?;
            if descriptor.deleting {
                return Err(RingError::NotFound(format!(
                    "metric {} is being deleted",
                    metric_id
                )));
            }
            if descriptor.metric_type != MetricType::Counter {
                return Err(RingError::TypeMismatch(format!(
                    "metric {} is a {}, not a counter",
                    metric_id, descriptor.metric_type
                )));
            }

            let slot = descriptor.slot_for(ts);
            txn.set(
                &codec::sample_key(metric_id, slot),
                &codec::encode_sample(&Sample { ts, value: raw_value }),
            )?;

            let state_key = codec::counter_state_key(metric_id);
            let advance = match txn.get(&state_key)? {
                Some(raw) => codec::decode_counter_state(&raw)?.last_ts <= ts,
                None => true,
            };
            if advance {
                txn.set(
                    &state_key,
                    &codec::encode_counter_state(&CounterState { last_ts: ts, last_raw: raw_value }),
                )?;
            }
            debug!(metric_id, ts, slot, raw_value, "ingested counter sample");
            Ok(())
        })
    }

    /// Advisory last-ingested state, if any
    pub fn state(&self, metric_id: MetricId) -> Result<Option<CounterState>> {
        retrying(self.backend.as_ref(), Deadline::default_op(), |txn| {
            match txn.get(&codec::counter_state_key(metric_id))? {
                Some(raw) => Ok(Some(codec::decode_counter_state(&raw)?)),
                None => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::registry::MetricRegistry;
    use crate::ring::RingStore;
    use crate::TagMap;

    fn fixture() -> (MetricRegistry, RingStore, CounterStore) {
        let backend = Arc::new(MemoryBackend::new()) as Arc<dyn Backend>;
        (
            MetricRegistry::new(backend.clone()),
            RingStore::new(backend.clone()),
            CounterStore::new(backend),
        )
    }

    #[test]
    fn test_counter_stores_raw_values() {
        let (registry, ring, counters) = fixture();
        let id = registry.ensure("reqs", &TagMap::new(), MetricType::Counter, 60, 10).unwrap();
        // a reset: the raw value drops and is stored as-is
        for (ts, raw) in [(0, 100.0), (60, 160.0), (120, 180.0), (180, 50.0)] {
            counters.ingest(id, ts, raw).unwrap();
        }
        let rows = ring.read_range(id, 0, 180).unwrap();
        let raws: Vec<f64> = rows.iter().map(|s| s.value).collect();
        assert_eq!(raws, vec![100.0, 160.0, 180.0, 50.0]);
    }

    #[test]
    fn test_state_tracks_latest_ingest() {
        let (registry, _, counters) = fixture();
        let id = registry.ensure("reqs", &TagMap::new(), MetricType::Counter, 1, 10).unwrap();
        assert_eq!(counters.state(id).unwrap(), None);

        counters.ingest(id, 10, 5.0).unwrap();
        counters.ingest(id, 20, 9.0).unwrap();
        // out-of-order ingest does not move the state backwards
        counters.ingest(id, 15, 7.0).unwrap();
        assert_eq!(
            counters.state(id).unwrap(),
            Some(CounterState { last_ts: 20, last_raw: 9.0 })
        );
    }

    #[test]
    fn test_gauge_rejected() {
        let (registry, _, counters) = fixture();
        let id = registry.ensure("temp", &TagMap::new(), MetricType::Gauge, 1, 10).unwrap();
        assert!(matches!(
            counters.ingest(id, 1, 1.0),
            Err(RingError::TypeMismatch(_))
        ));
    }
}
