//! Virtual tables
//!
//! `samples`, `metrics`, and `metric_tags` are materialised from the
//! storage engine per query. Samples stream through the ring scan with the
//! pushed-down metric ids and time range already applied, and arrive in
//! `(metric_id, ts)` order.

use super::exec::Batch;
use super::Value;
use crate::ring::RingStore;
use crate::{MetricDescriptor, MetricId, Result, Timestamp};

pub const SAMPLES_COLUMNS: [&str; 3] = ["metric_id", "ts", "value"];

/// Stream the requested metrics' rings into a `samples` batch
pub fn samples(
    ring: &RingStore,
    metric_ids: &[MetricId],
    start_ts: Timestamp,
    end_ts: Timestamp,
) -> Result<Batch> {
    let mut metric_col = Vec::new();
    let mut ts_col = Vec::new();
    let mut value_col = Vec::new();
    for &metric_id in metric_ids {
        for sample in ring.read_range(metric_id, start_ts, end_ts)? {
            metric_col.push(Value::Int(metric_id as i64));
            ts_col.push(Value::Int(sample.ts));
            value_col.push(Value::Float(sample.value));
        }
    }
    Ok(Batch::new(
        SAMPLES_COLUMNS.iter().map(|s| s.to_string()).collect(),
        vec![metric_col, ts_col, value_col],
    ))
}

/// Descriptor scan as the `metrics` table
pub fn metrics(descriptors: &[MetricDescriptor]) -> Batch {
    let mut metric_col = Vec::with_capacity(descriptors.len());
    let mut name_col = Vec::with_capacity(descriptors.len());
    let mut type_col = Vec::with_capacity(descriptors.len());
    let mut step_col = Vec::with_capacity(descriptors.len());
    let mut slots_col = Vec::with_capacity(descriptors.len());
    for desc in descriptors {
        metric_col.push(Value::Int(desc.metric_id as i64));
        name_col.push(Value::Str(desc.name.clone()));
        type_col.push(Value::Int(i64::from(desc.metric_type.as_u8())));
        step_col.push(Value::Int(i64::from(desc.step)));
        slots_col.push(Value::Int(i64::from(desc.slots)));
    }
    Batch::new(
        ["metric_id", "name", "type", "step", "slots"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        vec![metric_col, name_col, type_col, step_col, slots_col],
    )
}

/// Descriptor tag maps flattened into the `metric_tags` table
pub fn metric_tags(descriptors: &[MetricDescriptor]) -> Batch {
    let mut metric_col = Vec::new();
    let mut key_col = Vec::new();
    let mut value_col = Vec::new();
    for desc in descriptors {
        for (key, value) in &desc.tags {
            metric_col.push(Value::Int(desc.metric_id as i64));
            key_col.push(Value::Str(key.clone()));
            value_col.push(Value::Str(value.clone()));
        }
    }
    Batch::new(
        ["metric_id", "tag_key", "tag_value"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        vec![metric_col, key_col, value_col],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::registry::MetricRegistry;
    use crate::{MetricType, TagMap};
    use std::sync::Arc;

    #[test]
    fn test_samples_batch_ordered_by_metric_then_ts() {
        let backend = Arc::new(MemoryBackend::new()) as Arc<dyn Backend>;
        let registry = MetricRegistry::new(backend.clone());
        let ring = RingStore::new(backend);
        let a = registry.ensure("a", &TagMap::new(), MetricType::Gauge, 1, 10).unwrap();
        let b = registry.ensure("b", &TagMap::new(), MetricType::Gauge, 1, 10).unwrap();
        ring.write_sample(b, 5, 50.0).unwrap();
        ring.write_sample(a, 2, 20.0).unwrap();
        ring.write_sample(a, 1, 10.0).unwrap();

        let batch = samples(&ring, &[a, b], 0, 100).unwrap();
        assert_eq!(batch.rows(), 3);
        assert_eq!(
            batch.column("ts").unwrap(),
            &vec![Value::Int(1), Value::Int(2), Value::Int(5)]
        );
        assert_eq!(
            batch.column("metric_id").unwrap(),
            &vec![Value::Int(a as i64), Value::Int(a as i64), Value::Int(b as i64)]
        );
    }

    #[test]
    fn test_metric_tables() {
        let mut tags = TagMap::new();
        tags.insert("role".into(), "web".into());
        let descriptors = vec![MetricDescriptor {
            metric_id: 3,
            name: "cpu".into(),
            tags,
            step: 60,
            slots: 1440,
            metric_type: MetricType::Counter,
            created_at: 0,
            deleting: false,
        }];
        let metrics = metrics(&descriptors);
        assert_eq!(metrics.rows(), 1);
        assert_eq!(metrics.column("type").unwrap(), &vec![Value::Int(1)]);

        let tags = metric_tags(&descriptors);
        assert_eq!(tags.rows(), 1);
        assert_eq!(tags.column("tag_key").unwrap(), &vec![Value::Str("role".into())]);
    }
}
