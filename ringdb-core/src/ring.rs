//! Ring storage
//!
//! Each metric owns a fixed keyspace of `slots` sample keys; a write maps
//! its timestamp to `(ts // step) mod slots` and overwrites that slot
//! unconditionally, so the live key set never grows past the ring. A slot
//! is only *present* for a query when its stored timestamp falls inside the
//! requested range; stale ring content is filtered at read time.

use crate::backend::{retrying, Backend, Deadline, Transaction};
use crate::codec;
use crate::registry::load_descriptor;
use crate::{config, MetricDescriptor, MetricId, Result, RingError, Sample, Timestamp};
use std::sync::Arc;
use tracing::debug;

/// Ring reader/writer over a shared backend handle
pub struct RingStore {
    backend: Arc<dyn Backend>,
}

impl RingStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Overwrite the slot `ts` maps to. Older timestamps landing in the same
    /// slot silently lose to the last committed write.
    pub fn write_sample(&self, metric_id: MetricId, ts: Timestamp, value: f64) -> Result<()> {
        retrying(self.backend.as_ref(), Deadline::default_op(), |txn| {
            let descriptor = load_descriptor(txn, metric_id)?
                .ok_or_else(|| RingError::NotFound(format!("metric {}", metric_id)))?;
            if descriptor.deleting {
                return Err(RingError::NotFound(format!(
                    "metric {} is being deleted",
                    metric_id
                )));
            }
            let slot = descriptor.slot_for(ts);
            txn.set(
                &codec::sample_key(metric_id, slot),
                &codec::encode_sample(&Sample { ts, value }),
            )?;
            debug!(metric_id, ts, slot, "wrote sample");
            Ok(())
        })
    }

    /// Samples whose stored timestamp lies in `[start_ts, end_ts]`,
    /// ascending by timestamp. Memory is bounded by the ring size.
    pub fn read_range(
        &self,
        metric_id: MetricId,
        start_ts: Timestamp,
        end_ts: Timestamp,
    ) -> Result<Vec<Sample>> {
        if end_ts < start_ts {
            return Ok(Vec::new());
        }
        let descriptor = retrying(self.backend.as_ref(), Deadline::default_op(), |txn| {
            load_descriptor(txn, metric_id)
        })?;
        let Some(descriptor) = descriptor else {
            return Ok(Vec::new());
        };

        let mut samples: Vec<Sample> =
            RangeScan::new(self.backend.as_ref(), &descriptor, start_ts, end_ts)
                .collect::<Result<_>>()?;
        samples.sort_by_key(|s| s.ts);
        Ok(samples)
    }
}

/// Every live sample of a metric, ascending by timestamp
pub(crate) fn scan_all(backend: &dyn Backend, descriptor: &MetricDescriptor) -> Result<Vec<Sample>> {
    let mut samples: Vec<Sample> = RangeScan::new(backend, descriptor, i64::MIN, i64::MAX)
        .collect::<Result<_>>()?;
    samples.sort_by_key(|s| s.ts);
    Ok(samples)
}

/// Which keys a scan visits
enum ScanState {
    /// Range-scan the whole `(1, metric_id, *)` keyspace from a cursor
    Scan { cursor: Vec<u8>, end: Vec<u8> },
    /// Multi-get an explicit slot list (tail holds the remainder)
    Enumerate { metric_id: MetricId, slots: Vec<u32> },
}

impl ScanState {
    fn full(metric_id: MetricId) -> Self {
        let (cursor, end) = codec::sample_range(metric_id);
        ScanState::Scan { cursor, end }
    }
}

/// Lazy, restartable scan over one metric's ring.
///
/// Yields samples in slot order; callers needing timestamp order sort the
/// bounded result. Each batch runs in its own read-only transaction; a
/// batch that loses its snapshot restarts from the last yielded key with a
/// fresh read version, accepting that slots overwritten in between may
/// surface with their newer timestamp (relaxed read consistency).
pub struct RangeScan<'a> {
    backend: &'a dyn Backend,
    start_ts: Timestamp,
    end_ts: Timestamp,
    state: Option<ScanState>,
    buffered: std::vec::IntoIter<Sample>,
}

impl<'a> RangeScan<'a> {
    pub fn new(
        backend: &'a dyn Backend,
        descriptor: &MetricDescriptor,
        start_ts: Timestamp,
        end_ts: Timestamp,
    ) -> Self {
        let state = plan(descriptor, start_ts, end_ts);
        Self {
            backend,
            start_ts,
            end_ts,
            state,
            buffered: Vec::new().into_iter(),
        }
    }

    fn refill(&mut self) -> Result<bool> {
        match self.state.take() {
            None => Ok(false),
            Some(ScanState::Scan { cursor, end }) => self.scan_batch(cursor, end),
            Some(ScanState::Enumerate { metric_id, slots }) => {
                self.enumerate_batch(metric_id, slots)
            }
        }
    }

    fn scan_batch(&mut self, cursor: Vec<u8>, end: Vec<u8>) -> Result<bool> {
        let rows = retry_read(self.backend, |txn| {
            txn.get_range(&cursor, &end, config::SCAN_BATCH_ROWS)
        })?;
        if rows.is_empty() {
            return Ok(false);
        }
        let exhausted = rows.len() < config::SCAN_BATCH_ROWS;
        let mut out = Vec::with_capacity(rows.len());
        let mut next_cursor = cursor;
        for (key, value) in rows {
            next_cursor = codec::prefix_end(&key);
            let sample = codec::decode_sample(&value)?;
            if sample.ts >= self.start_ts && sample.ts <= self.end_ts {
                out.push(sample);
            }
        }
        if !exhausted {
            self.state = Some(ScanState::Scan { cursor: next_cursor, end });
        }
        self.buffered = out.into_iter();
        Ok(true)
    }

    fn enumerate_batch(&mut self, metric_id: MetricId, slots: Vec<u32>) -> Result<bool> {
        if slots.is_empty() {
            return Ok(false);
        }
        let take = slots.len().min(config::SCAN_BATCH_ROWS);
        let (head, tail) = slots.split_at(take);
        let samples = retry_read(self.backend, |txn| {
            let mut out = Vec::with_capacity(head.len());
            for &slot in head {
                if let Some(raw) = txn.get(&codec::sample_key(metric_id, slot))? {
                    out.push(codec::decode_sample(&raw)?);
                }
            }
            Ok(out)
        })?;
        if !tail.is_empty() {
            self.state = Some(ScanState::Enumerate {
                metric_id,
                slots: tail.to_vec(),
            });
        }
        let (start_ts, end_ts) = (self.start_ts, self.end_ts);
        self.buffered = samples
            .into_iter()
            .filter(|s| s.ts >= start_ts && s.ts <= end_ts)
            .collect::<Vec<_>>()
            .into_iter();
        Ok(true)
    }
}

/// Pick the cheaper strategy: enumerate exactly the slots the window
/// touches when the query covers less than half the ring, otherwise scan
/// the whole keyspace.
fn plan(
    descriptor: &MetricDescriptor,
    start_ts: Timestamp,
    end_ts: Timestamp,
) -> Option<ScanState> {
    if end_ts < start_ts {
        return None;
    }
    let step = i64::from(descriptor.step);
    let slots = i64::from(descriptor.slots);
    let start_window = start_ts.div_euclid(step);
    let end_window = end_ts.div_euclid(step);
    let touched = end_window.saturating_sub(start_window).saturating_add(1);

    if touched.saturating_mul(2) >= slots {
        Some(ScanState::full(descriptor.metric_id))
    } else {
        let start_slot = start_window.rem_euclid(slots);
        let slot_list: Vec<u32> = (0..touched)
            .map(|i| ((start_slot + i).rem_euclid(slots)) as u32)
            .collect();
        Some(ScanState::Enumerate {
            metric_id: descriptor.metric_id,
            slots: slot_list,
        })
    }
}

impl Iterator for RangeScan<'_> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(sample) = self.buffered.next() {
                return Some(Ok(sample));
            }
            match self.refill() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(err) => {
                    self.state = None;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Read-only batches restart with a fresh snapshot when the window expires
fn retry_read<T>(
    backend: &dyn Backend,
    mut f: impl FnMut(&mut dyn Transaction) -> Result<T>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        let mut txn = backend.transaction()?;
        match f(txn.as_mut()) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < config::MAX_RETRIES => {
                attempt += 1;
                debug!(attempt, error = %err, "restarting read batch");
            }
            Err(err) => return Err(err),
        }
    }
}
