//! SQL query layer
//!
//! A vectorised relational engine fed by the storage engine as virtual
//! tables `samples`, `metrics`, and `metric_tags`, extended with
//! time-series UDFs. The orchestrator binds metric ids, pushes the
//! `metric_id`/`ts` pre-filter into the samples provider, runs the plan,
//! and returns rows in plan order.

mod exec;
mod functions;
mod plan;
mod tables;

pub use exec::Batch;
pub use plan::{Pushdown, SelectPlan};

use crate::backend::Backend;
use crate::registry::MetricRegistry;
use crate::ring::RingStore;
use crate::{config, MetricId, Result, RingError, Selector, Timestamp};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Scalar cell of a query result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }
}

/// A query against the virtual tables
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub metric_ids: Vec<MetricId>,
    pub selectors: Vec<Selector>,
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    pub sql: String,
}

/// Result rows plus the SQL that actually ran (selector placeholders resolved)
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutput {
    pub rows: Vec<BTreeMap<String, serde_json::Value>>,
    pub sql: String,
}

/// Query orchestrator over the shared backend handle
pub struct QueryEngine {
    registry: MetricRegistry,
    ring: RingStore,
}

impl QueryEngine {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            registry: MetricRegistry::new(backend.clone()),
            ring: RingStore::new(backend),
        }
    }

    /// Run one query end to end: resolve metric ids, validate and plan the
    /// SQL, materialise the virtual tables under the pushed-down bounds,
    /// and execute.
    pub fn run(&self, request: &QueryRequest) -> Result<QueryOutput> {
        if request.start_ts > request.end_ts {
            return Err(RingError::Validation("start_ts must be <= end_ts".into()));
        }

        let (selector_ids, alias_map) = self.resolve_selectors(&request.selectors)?;
        if !selector_ids.is_empty() && !request.metric_ids.is_empty() {
            let provided: BTreeSet<MetricId> = request.metric_ids.iter().copied().collect();
            if provided != selector_ids {
                return Err(RingError::Validation(
                    "metric_ids do not match selectors".into(),
                ));
            }
        }
        let mut metric_ids: Vec<MetricId> = if selector_ids.is_empty() {
            let mut ids = request.metric_ids.clone();
            ids.sort_unstable();
            ids.dedup();
            ids
        } else {
            selector_ids.into_iter().collect()
        };
        if metric_ids.is_empty() {
            return Err(RingError::NotFound(
                "metric_ids or selectors must resolve to at least one metric".into(),
            ));
        }

        let sql = substitute_aliases(&request.sql, &alias_map)?;
        let (plan, pushdown) = plan::parse(&sql)?;

        // intersect the SQL's own predicates with the caller's bounds
        metric_ids.retain(|id| {
            pushdown.metric_ids.is_empty() || pushdown.metric_ids.contains(&(*id as i64))
        });
        let start_ts = pushdown.ts_min.map_or(request.start_ts, |t| t.max(request.start_ts));
        let end_ts = pushdown.ts_max.map_or(request.end_ts, |t| t.min(request.end_ts));
        debug!(?metric_ids, start_ts, end_ts, "executing query");

        let descriptors = self.registry.list()?;
        let mut registered: HashMap<String, Batch> = HashMap::new();
        registered.insert(
            plan::TABLE_SAMPLES.to_string(),
            tables::samples(&self.ring, &metric_ids, start_ts, end_ts)?,
        );
        registered.insert(plan::TABLE_METRICS.to_string(), tables::metrics(&descriptors));
        registered.insert(
            plan::TABLE_METRIC_TAGS.to_string(),
            tables::metric_tags(&descriptors),
        );

        let batch = exec::run(&plan, &mut registered)?;
        if batch.rows() > config::MAX_RESULT_ROWS {
            return Err(RingError::LimitExceeded(format!(
                "query returned {} rows (cap {})",
                batch.rows(),
                config::MAX_RESULT_ROWS
            )));
        }

        Ok(QueryOutput { rows: batch_rows(&batch), sql })
    }

    /// Resolve each selector through the registry; aliases map to the id
    /// sets used for SQL placeholder substitution
    fn resolve_selectors(
        &self,
        selectors: &[Selector],
    ) -> Result<(BTreeSet<MetricId>, BTreeMap<String, Vec<MetricId>>)> {
        let mut ids = BTreeSet::new();
        let mut alias_map: BTreeMap<String, Vec<MetricId>> = BTreeMap::new();
        for (idx, selector) in selectors.iter().enumerate() {
            if selector.metric.is_empty() {
                return Err(RingError::Validation("selector.metric is required".into()));
            }
            let alias = selector
                .alias
                .clone()
                .unwrap_or_else(|| format!("S{}", idx + 1));
            if alias_map.contains_key(&alias) {
                return Err(RingError::Validation(format!(
                    "duplicate selector alias: {}",
                    alias
                )));
            }
            let page = self.registry.lookup(
                Some(&selector.metric),
                &selector.tags,
                config::MAX_SELECTOR_MATCHES,
            )?;
            if page.metrics.is_empty() {
                return Err(RingError::NotFound(format!(
                    "selector '{}' did not match any metrics",
                    alias
                )));
            }
            if page.hit_limit {
                return Err(RingError::Validation(format!(
                    "selector '{}' matched too many metrics; narrow tags",
                    alias
                )));
            }
            let matched: Vec<MetricId> = page.metrics.iter().map(|d| d.metric_id).collect();
            ids.extend(matched.iter().copied());
            alias_map.insert(alias, matched);
        }
        Ok((ids, alias_map))
    }
}

/// Replace `{{alias}}` placeholders with the resolved metric id. An alias
/// used in SQL must resolve to exactly one metric.
fn substitute_aliases(sql: &str, alias_map: &BTreeMap<String, Vec<MetricId>>) -> Result<String> {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            return Err(RingError::Validation("unterminated {{alias}} placeholder".into()));
        };
        let alias = after[..close].trim();
        let ids = alias_map.get(alias).ok_or_else(|| {
            RingError::Validation(format!("unknown selector alias in sql: {}", alias))
        })?;
        let [id] = ids.as_slice() else {
            return Err(RingError::Validation(format!(
                "selector alias '{}' must resolve to exactly one metric for SQL substitution",
                alias
            )));
        };
        out.push_str(&id.to_string());
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn batch_rows(batch: &Batch) -> Vec<BTreeMap<String, serde_json::Value>> {
    (0..batch.rows())
        .map(|row| {
            batch
                .names()
                .iter()
                .map(|name| {
                    let value = batch.column(name).map(|col| &col[row]).unwrap_or(&Value::Null);
                    (name.clone(), to_json(value))
                })
                .collect()
        })
        .collect()
}

/// JSON cannot carry NaN or infinities; they surface as null
fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => serde_json::Value::from(s.clone()),
        Value::Bool(b) => serde_json::Value::from(*b),
    }
}
