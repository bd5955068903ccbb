//! Metric registry
//!
//! Allocates metric ids, maintains the descriptor record and the name/tag
//! indexes transactionally, and owns the multi-transaction lifecycle
//! operations (delete, retention rewrite). The registry is not cached;
//! lookups always consult the backend.

use crate::backend::{retrying, Backend, Deadline, Transaction};
use crate::codec;
use crate::ring;
use crate::{
    config, MetricDescriptor, MetricId, MetricType, Result, RingError, Sample, TagMap, Timestamp,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Page of descriptors returned by [`MetricRegistry::lookup`]
#[derive(Debug, Clone)]
pub struct LookupPage {
    pub metrics: Vec<MetricDescriptor>,
    /// True when the page was truncated at the caller's limit
    pub hit_limit: bool,
}

/// Registry over a shared backend handle
pub struct MetricRegistry {
    backend: Arc<dyn Backend>,
}

impl MetricRegistry {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Resolve or create the metric identified by `(name, tags)`.
    ///
    /// Linearizable per identity: concurrent creates collapse to a single
    /// id because both transactions read the name index and one of the
    /// commits conflicts. A conflicting commit is retried once against the
    /// winner's state; if the race persists it surfaces as `Conflict`.
    pub fn ensure(
        &self,
        name: &str,
        tags: &TagMap,
        metric_type: MetricType,
        step: u32,
        slots: u32,
    ) -> Result<MetricId> {
        if name.is_empty() {
            return Err(RingError::Validation("metric name is required".into()));
        }
        validate_geometry(step, slots)?;
        let created_at = now();

        let mut attempts = 0u32;
        loop {
            let result = self.try_ensure(name, tags, metric_type, step, slots, created_at);
            match result {
                Err(RingError::BackendTransient(_)) if attempts == 0 => {
                    attempts += 1;
                    continue;
                }
                Err(RingError::BackendTransient(msg)) => {
                    return Err(RingError::Conflict(format!(
                        "concurrent create of metric '{}' ({})",
                        name, msg
                    )));
                }
                other => return other,
            }
        }
    }

    fn try_ensure(
        &self,
        name: &str,
        tags: &TagMap,
        metric_type: MetricType,
        step: u32,
        slots: u32,
        created_at: Timestamp,
    ) -> Result<MetricId> {
        let mut txn = self.backend.transaction()?;
        if let Some(existing) = self.find_exact_tx(txn.as_mut(), name, tags)? {
            if existing.metric_type != metric_type {
                return Err(RingError::TypeMismatch(format!(
                    "metric '{}' is a {}, not a {}",
                    name, existing.metric_type, metric_type
                )));
            }
            // existing geometry wins; retention rewrite is the only way to change it
            return Ok(existing.metric_id);
        }

        let metric_id = allocate_metric_id(txn.as_mut())?;
        let descriptor = MetricDescriptor {
            metric_id,
            name: name.to_string(),
            tags: tags.clone(),
            step,
            slots,
            metric_type,
            created_at,
            deleting: false,
        };
        write_descriptor(txn.as_mut(), &descriptor)?;
        txn.set(&codec::name_index_key(name, metric_id), &[])?;
        for (k, v) in tags {
            txn.set(&codec::tag_index_key(name, k, v, metric_id), &[])?;
        }
        txn.commit()?;
        info!(metric_id, name, %metric_type, step, slots, "created metric");
        Ok(metric_id)
    }

    /// Resolve or create a metric under a caller-pinned id.
    ///
    /// Fixed-id collectors ingest without a name; the descriptor is created
    /// on first use and validated for type on every subsequent one.
    pub fn ensure_by_id(
        &self,
        metric_id: MetricId,
        metric_type: MetricType,
        step: u32,
        slots: u32,
    ) -> Result<MetricId> {
        validate_geometry(step, slots)?;
        let created_at = now();
        retrying(self.backend.as_ref(), Deadline::default_op(), |txn| {
            match load_descriptor(txn, metric_id)? {
                Some(existing) if existing.deleting => Err(RingError::NotFound(format!(
                    "metric {} is being deleted",
                    metric_id
                ))),
                Some(existing) => {
                    if existing.metric_type != metric_type {
                        return Err(RingError::TypeMismatch(format!(
                            "metric {} is a {}, not a {}",
                            metric_id, existing.metric_type, metric_type
                        )));
                    }
                    Ok(metric_id)
                }
                None => {
                    let descriptor = MetricDescriptor {
                        metric_id,
                        name: String::new(),
                        tags: TagMap::new(),
                        step,
                        slots,
                        metric_type,
                        created_at,
                        deleting: false,
                    };
                    write_descriptor(txn, &descriptor)?;
                    Ok(metric_id)
                }
            }
        })
    }

    /// Fetch one descriptor
    pub fn get(&self, metric_id: MetricId) -> Result<MetricDescriptor> {
        retrying(self.backend.as_ref(), Deadline::default_op(), |txn| {
            load_descriptor(txn, metric_id)?
                .ok_or_else(|| RingError::NotFound(format!("metric {}", metric_id)))
        })
    }

    /// Every descriptor, ascending by metric id. Deleting metrics are skipped.
    pub fn list(&self) -> Result<Vec<MetricDescriptor>> {
        retrying(self.backend.as_ref(), Deadline::default_op(), |txn| {
            let (start, end) = codec::descriptor_range();
            let mut out = Vec::new();
            let mut cursor = start.clone();
            loop {
                let rows = txn.get_range(&cursor, &end, config::SCAN_BATCH_ROWS)?;
                let done = rows.len() < config::SCAN_BATCH_ROWS;
                for (key, value) in rows {
                    let metric_id = codec::descriptor_key_metric_id(&key)?;
                    let descriptor = codec::decode_descriptor(metric_id, &value)?;
                    if !descriptor.deleting {
                        out.push(descriptor);
                    }
                    cursor = codec::prefix_end(&key);
                }
                if done {
                    break;
                }
            }
            Ok(out)
        })
    }

    /// Name- and tag-constrained descriptor lookup, paged by metric id order.
    ///
    /// Name-only lookups read the name index; tag-constrained lookups
    /// intersect the per-`(name, tag_key, tag_value)` sets. Lookups with no
    /// name fall back to a descriptor scan. Requested tags are matched as a
    /// subset of the descriptor's tags.
    pub fn lookup(&self, name: Option<&str>, tags: &TagMap, limit: usize) -> Result<LookupPage> {
        let limit = limit.clamp(1, config::MAX_LOOKUP_LIMIT);
        let candidates: Vec<MetricDescriptor> = match name {
            Some(name) => {
                let ids = retrying(self.backend.as_ref(), Deadline::default_op(), |txn| {
                    candidate_ids_tx(txn, name, tags)
                })?;
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.get(id) {
                        Ok(desc) => out.push(desc),
                        // index entry may outlive the descriptor mid-delete
                        Err(RingError::NotFound(_)) => continue,
                        Err(err) => return Err(err),
                    }
                }
                out
            }
            None => self.list()?,
        };

        let mut metrics: Vec<MetricDescriptor> = candidates
            .into_iter()
            .filter(|desc| tags.iter().all(|(k, v)| desc.tags.get(k) == Some(v)))
            .collect();
        metrics.sort_by_key(|d| d.metric_id);
        let hit_limit = metrics.len() > limit;
        metrics.truncate(limit);
        Ok(LookupPage { metrics, hit_limit })
    }

    /// Distinct non-empty metric names, sorted
    pub fn names(&self, limit: usize) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .list()?
            .into_iter()
            .filter(|d| !d.name.is_empty())
            .map(|d| d.name)
            .collect();
        names.sort();
        names.dedup();
        names.truncate(limit);
        Ok(names)
    }

    /// Tag catalog `key -> sorted values`, optionally scoped to one name
    pub fn tag_values(
        &self,
        name: Option<&str>,
    ) -> Result<std::collections::BTreeMap<String, Vec<String>>> {
        let mut catalog: std::collections::BTreeMap<String, std::collections::BTreeSet<String>> =
            Default::default();
        for desc in self.list()? {
            if let Some(name) = name {
                if desc.name != name {
                    continue;
                }
            }
            for (k, v) in desc.tags {
                catalog.entry(k).or_default().insert(v);
            }
        }
        Ok(catalog
            .into_iter()
            .map(|(k, vs)| (k, vs.into_iter().collect()))
            .collect())
    }

    /// Remove a metric and everything hanging off it.
    ///
    /// Multi-transaction: flip the descriptor's deleting flag, clear samples
    /// in bounded batches, clear counter state and index entries, then drop
    /// the descriptor. Every step is idempotent, so an interrupted delete is
    /// safe to re-run; deleting an absent metric succeeds.
    pub fn delete(&self, metric_id: MetricId) -> Result<()> {
        let deadline = Deadline::default_op();
        let descriptor = retrying(self.backend.as_ref(), deadline, |txn| {
            let Some(mut descriptor) = load_descriptor(txn, metric_id)? else {
                return Ok(None);
            };
            if !descriptor.deleting {
                descriptor.deleting = true;
                write_descriptor(txn, &descriptor)?;
            }
            Ok(Some(descriptor))
        })?;
        let Some(descriptor) = descriptor else {
            debug!(metric_id, "delete of absent metric is a no-op");
            return Ok(());
        };

        // samples, in slot-bounded batches
        let mut slot = 0u32;
        while slot < descriptor.slots {
            let last = slot.saturating_add(config::CLEAR_BATCH_SLOTS - 1).min(descriptor.slots - 1);
            let (start, end) = codec::sample_slot_range(metric_id, slot, last);
            retrying(self.backend.as_ref(), deadline, |txn| {
                txn.clear_range(&start, &end);
                Ok(())
            })?;
            if last == u32::MAX {
                break;
            }
            slot = last + 1;
        }

        retrying(self.backend.as_ref(), deadline, |txn| {
            txn.clear(&codec::counter_state_key(metric_id));
            if !descriptor.name.is_empty() {
                txn.clear(&codec::name_index_key(&descriptor.name, metric_id));
                for (k, v) in &descriptor.tags {
                    txn.clear(&codec::tag_index_key(&descriptor.name, k, v, metric_id));
                }
            }
            txn.clear(&codec::descriptor_key(metric_id));
            Ok(())
        })?;
        info!(metric_id, "deleted metric");
        Ok(())
    }

    /// Re-shape a gauge's ring to `(new_step, new_slots)`.
    ///
    /// Reads the surviving samples, rewrites them under the new slot
    /// mapping, clears whatever the new mapping does not cover, and finally
    /// updates the descriptor. Counters are refused: their advisory state
    /// and rate semantics are tied to the original geometry.
    pub fn retention_rewrite(
        &self,
        metric_id: MetricId,
        new_step: u32,
        new_slots: u32,
    ) -> Result<()> {
        validate_geometry(new_step, new_slots)?;
        let descriptor = self.get(metric_id)?;
        if descriptor.metric_type != MetricType::Gauge {
            return Err(RingError::TypeMismatch(
                "retention rewrite is only supported for gauge metrics".into(),
            ));
        }
        if descriptor.deleting {
            return Err(RingError::NotFound(format!("metric {} is being deleted", metric_id)));
        }

        // Old-geometry samples, oldest first. A sample survives when its
        // timestamp still lands in a distinct new slot; later timestamps win
        // within a slot because the replay below runs in ascending ts order.
        let samples = ring::scan_all(self.backend.as_ref(), &descriptor)?;
        let survivors: Vec<Sample> = samples
            .into_iter()
            .filter(|s| s.ts == s.ts.div_euclid(i64::from(new_step)) * i64::from(new_step))
            .collect();

        let deadline = Deadline::default_op();
        for chunk in survivors.chunks(config::REWRITE_BATCH_SAMPLES.max(1)) {
            retrying(self.backend.as_ref(), deadline, |txn| {
                for sample in chunk {
                    let slot = crate::slot_for(sample.ts, new_step, new_slots);
                    txn.set(&codec::sample_key(metric_id, slot), &codec::encode_sample(sample))?;
                }
                Ok(())
            })?;
        }

        let new_slot_set: std::collections::BTreeSet<u32> = survivors
            .iter()
            .map(|s| crate::slot_for(s.ts, new_step, new_slots))
            .collect();
        retrying(self.backend.as_ref(), deadline, |txn| {
            // clear every old slot the rewrite did not claim
            let (start, end) = codec::sample_range(metric_id);
            let mut cursor = start.clone();
            loop {
                let rows = txn.get_range(&cursor, &end, config::SCAN_BATCH_ROWS)?;
                let done = rows.len() < config::SCAN_BATCH_ROWS;
                for (key, _) in rows {
                    let slot = codec::sample_key_slot(&key)?;
                    if slot >= new_slots || !new_slot_set.contains(&slot) {
                        txn.clear(&key);
                    }
                    cursor = codec::prefix_end(&key);
                }
                if done {
                    return Ok(());
                }
            }
        })?;

        retrying(self.backend.as_ref(), deadline, |txn| {
            let mut descriptor = load_descriptor(txn, metric_id)?
                .ok_or_else(|| RingError::NotFound(format!("metric {}", metric_id)))?;
            descriptor.step = new_step;
            descriptor.slots = new_slots;
            write_descriptor(txn, &descriptor)?;
            Ok(())
        })?;
        info!(metric_id, new_step, new_slots, "rewrote retention");
        Ok(())
    }

    fn find_exact_tx(
        &self,
        txn: &mut dyn Transaction,
        name: &str,
        tags: &TagMap,
    ) -> Result<Option<MetricDescriptor>> {
        for id in candidate_ids_tx(txn, name, tags)? {
            if let Some(desc) = load_descriptor(txn, id)? {
                if !desc.deleting && desc.tags == *tags {
                    return Ok(Some(desc));
                }
            }
        }
        Ok(None)
    }
}

/// Ids registered under `name`, intersected with each requested tag set
fn candidate_ids_tx(
    txn: &mut dyn Transaction,
    name: &str,
    tags: &TagMap,
) -> Result<Vec<MetricId>> {
    let (start, end) = codec::name_index_range(name);
    let rows = txn.get_range(&start, &end, config::MAX_LOOKUP_LIMIT)?;
    let mut ids: Vec<MetricId> = rows
        .iter()
        .map(|(key, _)| codec::name_index_key_metric_id(key))
        .collect::<Result<_>>()?;

    for (k, v) in tags {
        if ids.is_empty() {
            break;
        }
        let (start, end) = codec::tag_index_range(name, k, v);
        let rows = txn.get_range(&start, &end, config::MAX_LOOKUP_LIMIT)?;
        let tagged: std::collections::BTreeSet<MetricId> = rows
            .iter()
            .map(|(key, _)| codec::tag_index_key_metric_id(key))
            .collect::<Result<_>>()?;
        ids.retain(|id| tagged.contains(id));
    }
    Ok(ids)
}

pub(crate) fn load_descriptor(
    txn: &mut dyn Transaction,
    metric_id: MetricId,
) -> Result<Option<MetricDescriptor>> {
    match txn.get(&codec::descriptor_key(metric_id))? {
        Some(raw) => Ok(Some(codec::decode_descriptor(metric_id, &raw)?)),
        None => Ok(None),
    }
}

pub(crate) fn write_descriptor(
    txn: &mut dyn Transaction,
    descriptor: &MetricDescriptor,
) -> Result<()> {
    txn.set(
        &codec::descriptor_key(descriptor.metric_id),
        &codec::encode_descriptor(descriptor)?,
    )
}

fn allocate_metric_id(txn: &mut dyn Transaction) -> Result<MetricId> {
    let key = codec::id_counter_key();
    let next = match txn.get(&key)? {
        Some(raw) => codec::decode_id_counter(&raw)? + 1,
        None => 1,
    };
    txn.set(&key, &codec::encode_id_counter(next))?;
    Ok(next)
}

fn validate_geometry(step: u32, slots: u32) -> Result<()> {
    if step < 1 {
        return Err(RingError::Validation("step must be >= 1".into()));
    }
    if slots < 1 {
        return Err(RingError::Validation("slots must be >= 1".into()));
    }
    let window = u64::from(step) * u64::from(slots);
    if window > config::MAX_RETENTION_WINDOW_SECS {
        return Err(RingError::Validation(format!(
            "step * slots = {}s exceeds the {}s retention cap",
            window,
            config::MAX_RETENTION_WINDOW_SECS
        )));
    }
    Ok(())
}

fn now() -> Timestamp {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn registry() -> MetricRegistry {
        MetricRegistry::new(Arc::new(MemoryBackend::new()))
    }

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_ensure_is_idempotent_per_identity() {
        let reg = registry();
        let t = tags(&[("host", "a")]);
        let id1 = reg.ensure("cpu", &t, MetricType::Gauge, 1, 10).unwrap();
        let id2 = reg.ensure("cpu", &t, MetricType::Gauge, 1, 10).unwrap();
        assert_eq!(id1, id2);

        // different tag set is a different metric
        let id3 = reg.ensure("cpu", &tags(&[("host", "b")]), MetricType::Gauge, 1, 10).unwrap();
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_ensure_existing_geometry_wins() {
        let reg = registry();
        let id = reg.ensure("cpu", &TagMap::new(), MetricType::Gauge, 1, 10).unwrap();
        let same = reg.ensure("cpu", &TagMap::new(), MetricType::Gauge, 60, 99).unwrap();
        assert_eq!(id, same);
        let desc = reg.get(id).unwrap();
        assert_eq!((desc.step, desc.slots), (1, 10));
    }

    #[test]
    fn test_ensure_type_is_immutable() {
        let reg = registry();
        reg.ensure("reqs", &TagMap::new(), MetricType::Counter, 1, 10).unwrap();
        let err = reg.ensure("reqs", &TagMap::new(), MetricType::Gauge, 1, 10).unwrap_err();
        assert!(matches!(err, RingError::TypeMismatch(_)));
    }

    #[test]
    fn test_ensure_validation() {
        let reg = registry();
        assert!(reg.ensure("", &TagMap::new(), MetricType::Gauge, 1, 10).is_err());
        assert!(reg.ensure("x", &TagMap::new(), MetricType::Gauge, 0, 10).is_err());
        assert!(reg.ensure("x", &TagMap::new(), MetricType::Gauge, 1, 0).is_err());
        assert!(reg
            .ensure("x", &TagMap::new(), MetricType::Gauge, 86_400, u32::MAX)
            .is_err());
    }

    #[test]
    fn test_ensure_by_id() {
        let reg = registry();
        assert_eq!(reg.ensure_by_id(3001, MetricType::Gauge, 1, 60).unwrap(), 3001);
        // second ingest validates type only
        assert_eq!(reg.ensure_by_id(3001, MetricType::Gauge, 5, 5).unwrap(), 3001);
        assert!(matches!(
            reg.ensure_by_id(3001, MetricType::Counter, 1, 60),
            Err(RingError::TypeMismatch(_))
        ));
        let desc = reg.get(3001).unwrap();
        assert_eq!(desc.name, "");
        assert_eq!((desc.step, desc.slots), (1, 60));
    }

    #[test]
    fn test_allocated_ids_are_dense_and_distinct() {
        let reg = registry();
        let a = reg.ensure("a", &TagMap::new(), MetricType::Gauge, 1, 1).unwrap();
        let b = reg.ensure("b", &TagMap::new(), MetricType::Gauge, 1, 1).unwrap();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_lookup_by_name_and_tags() {
        let reg = registry();
        let web = reg.ensure("cpu", &tags(&[("role", "web"), ("host", "w1")]), MetricType::Gauge, 1, 10).unwrap();
        let db = reg.ensure("cpu", &tags(&[("role", "db"), ("host", "d1")]), MetricType::Gauge, 1, 10).unwrap();
        reg.ensure("mem", &tags(&[("role", "web")]), MetricType::Gauge, 1, 10).unwrap();

        let page = reg.lookup(Some("cpu"), &TagMap::new(), 10).unwrap();
        let ids: Vec<_> = page.metrics.iter().map(|d| d.metric_id).collect();
        assert_eq!(ids, vec![web, db]);

        let page = reg.lookup(Some("cpu"), &tags(&[("role", "db")]), 10).unwrap();
        assert_eq!(page.metrics.len(), 1);
        assert_eq!(page.metrics[0].metric_id, db);

        // tags-only lookup falls back to the descriptor scan
        let page = reg.lookup(None, &tags(&[("role", "web")]), 10).unwrap();
        assert_eq!(page.metrics.len(), 2);
    }

    #[test]
    fn test_lookup_pagination_flag() {
        let reg = registry();
        for host in ["a", "b", "c"] {
            reg.ensure("cpu", &tags(&[("host", host)]), MetricType::Gauge, 1, 10).unwrap();
        }
        let page = reg.lookup(Some("cpu"), &TagMap::new(), 2).unwrap();
        assert_eq!(page.metrics.len(), 2);
        assert!(page.hit_limit);
    }

    #[test]
    fn test_names_and_tag_values() {
        let reg = registry();
        reg.ensure("cpu", &tags(&[("host", "a")]), MetricType::Gauge, 1, 10).unwrap();
        reg.ensure("cpu", &tags(&[("host", "b")]), MetricType::Gauge, 1, 10).unwrap();
        reg.ensure("mem", &tags(&[("zone", "eu")]), MetricType::Gauge, 1, 10).unwrap();
        reg.ensure_by_id(900, MetricType::Gauge, 1, 10).unwrap();

        assert_eq!(reg.names(10).unwrap(), vec!["cpu".to_string(), "mem".to_string()]);
        let catalog = reg.tag_values(Some("cpu")).unwrap();
        assert_eq!(catalog.get("host").unwrap(), &vec!["a".to_string(), "b".to_string()]);
        assert!(catalog.get("zone").is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let reg = registry();
        let id = reg.ensure("cpu", &tags(&[("h", "x")]), MetricType::Gauge, 1, 10).unwrap();
        reg.delete(id).unwrap();
        assert!(matches!(reg.get(id), Err(RingError::NotFound(_))));
        // second delete is a no-op
        reg.delete(id).unwrap();
        // indexes are gone too
        assert!(reg.lookup(Some("cpu"), &TagMap::new(), 10).unwrap().metrics.is_empty());
    }
}
