//! Top-level TSDB facade
//!
//! Owns the process-wide backend handle and composes the registry, ring,
//! counter, and dashboard stores into the ingest-facing API. The facade is
//! stateless across requests; all coordination happens in backend
//! transactions.

use crate::backend::Backend;
use crate::counter::CounterStore;
use crate::dashboards::DashboardStore;
use crate::registry::MetricRegistry;
use crate::ring::RingStore;
use crate::{
    config, MetricDescriptor, MetricId, MetricRef, MetricType, Result, Sample, Timestamp,
};
use std::sync::Arc;
use tracing::info;

pub struct Tsdb {
    backend: Arc<dyn Backend>,
    registry: MetricRegistry,
    ring: RingStore,
    counters: CounterStore,
    dashboards: DashboardStore,
}

impl Tsdb {
    /// Initialise the process-wide handle over an opened backend
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        info!("initialising tsdb");
        Self {
            registry: MetricRegistry::new(backend.clone()),
            ring: RingStore::new(backend.clone()),
            counters: CounterStore::new(backend.clone()),
            dashboards: DashboardStore::new(backend.clone()),
            backend,
        }
    }

    /// Tear down the backend handle. Pending transactions are aborted by
    /// drop; nothing here blocks.
    pub fn shutdown(self) {
        info!("shutting down tsdb");
        drop(self);
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn ring(&self) -> &RingStore {
        &self.ring
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    pub fn dashboards(&self) -> &DashboardStore {
        &self.dashboards
    }

    /// Resolve a metric reference for an ingest, creating the descriptor
    /// lazily on first use
    fn resolve(
        &self,
        metric: &MetricRef,
        metric_type: MetricType,
        step: Option<u32>,
        slots: Option<u32>,
    ) -> Result<MetricId> {
        let step = step.unwrap_or(config::DEFAULT_STEP);
        let slots = slots.unwrap_or(config::DEFAULT_SLOTS);
        match metric {
            MetricRef::ById(id) => self.registry.ensure_by_id(*id, metric_type, step, slots),
            MetricRef::ByName { name, tags } => {
                self.registry.ensure(name, tags, metric_type, step, slots)
            }
        }
    }

    /// Ingest a gauge sample, returning the resolved metric id
    pub fn write_gauge(
        &self,
        metric: &MetricRef,
        ts: Timestamp,
        value: f64,
        step: Option<u32>,
        slots: Option<u32>,
    ) -> Result<MetricId> {
        let metric_id = self.resolve(metric, MetricType::Gauge, step, slots)?;
        self.ring.write_sample(metric_id, ts, value)?;
        Ok(metric_id)
    }

    /// Ingest a raw cumulative counter sample, returning the resolved metric id
    pub fn write_counter(
        &self,
        metric: &MetricRef,
        ts: Timestamp,
        raw_value: f64,
        step: Option<u32>,
        slots: Option<u32>,
    ) -> Result<MetricId> {
        let metric_id = self.resolve(metric, MetricType::Counter, step, slots)?;
        self.counters.ingest(metric_id, ts, raw_value)?;
        Ok(metric_id)
    }

    pub fn read_range(
        &self,
        metric_id: MetricId,
        start_ts: Timestamp,
        end_ts: Timestamp,
    ) -> Result<Vec<Sample>> {
        self.ring.read_range(metric_id, start_ts, end_ts)
    }

    pub fn describe(&self, metric_id: MetricId) -> Result<MetricDescriptor> {
        self.registry.get(metric_id)
    }
}
