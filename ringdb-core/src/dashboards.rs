//! Dashboard persistence
//!
//! Dashboards are opaque JSON blobs stored verbatim under `(6, slug)`. The
//! core contract only promises round-tripping; the definition schema belongs
//! to the front-end.

use crate::backend::{retrying, Backend, Deadline};
use crate::codec;
use crate::{config, Result, RingError};
use serde_json::Value as Json;
use std::sync::Arc;

/// Listing entry: slug plus whatever title the blob carries
#[derive(Debug, Clone, serde::Serialize)]
pub struct DashboardSummary {
    pub slug: String,
    pub title: String,
}

pub struct DashboardStore {
    backend: Arc<dyn Backend>,
}

impl DashboardStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn save(&self, slug: &str, title: &str, definition: &Json) -> Result<()> {
        if slug.is_empty() {
            return Err(RingError::Validation("dashboard slug is required".into()));
        }
        let payload = serde_json::json!({ "title": title, "definition": definition });
        let encoded = serde_json::to_vec(&payload)
            .map_err(|e| RingError::Validation(format!("dashboard not serializable: {}", e)))?;
        let key = codec::dashboard_key(slug);
        retrying(self.backend.as_ref(), Deadline::default_op(), |txn| {
            txn.set(&key, &encoded)
        })
    }

    pub fn get(&self, slug: &str) -> Result<Json> {
        let key = codec::dashboard_key(slug);
        retrying(self.backend.as_ref(), Deadline::default_op(), |txn| {
            let raw = txn
                .get(&key)?
                .ok_or_else(|| RingError::NotFound(format!("dashboard '{}'", slug)))?;
            serde_json::from_slice(&raw)
                .map_err(|e| RingError::BackendFatal(format!("corrupt dashboard blob: {}", e)))
        })
    }

    pub fn delete(&self, slug: &str) -> Result<()> {
        let key = codec::dashboard_key(slug);
        retrying(self.backend.as_ref(), Deadline::default_op(), |txn| {
            txn.clear(&key);
            Ok(())
        })
    }

    pub fn list(&self) -> Result<Vec<DashboardSummary>> {
        retrying(self.backend.as_ref(), Deadline::default_op(), |txn| {
            let (start, end) = codec::dashboard_range();
            let rows = txn.get_range(&start, &end, config::MAX_LOOKUP_LIMIT)?;
            let mut out = Vec::with_capacity(rows.len());
            for (key, value) in rows {
                let slug = codec::dashboard_key_slug(&key)?;
                let title = serde_json::from_slice::<Json>(&value)
                    .ok()
                    .and_then(|p| p.get("title").and_then(|t| t.as_str()).map(String::from))
                    .unwrap_or_else(|| slug.clone());
                out.push(DashboardSummary { slug, title });
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn store() -> DashboardStore {
        DashboardStore::new(Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn test_roundtrip() {
        let dashboards = store();
        let definition = serde_json::json!({"panels": [{"metric": "cpu", "bucket": 60}]});
        dashboards.save("fleet", "Fleet Overview", &definition).unwrap();

        let blob = dashboards.get("fleet").unwrap();
        assert_eq!(blob["title"], "Fleet Overview");
        assert_eq!(blob["definition"], definition);
    }

    #[test]
    fn test_list_sorted_by_slug() {
        let dashboards = store();
        dashboards.save("zeta", "Z", &serde_json::json!({})).unwrap();
        dashboards.save("alpha", "A", &serde_json::json!({})).unwrap();
        let slugs: Vec<_> = dashboards.list().unwrap().into_iter().map(|d| d.slug).collect();
        assert_eq!(slugs, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_delete_and_missing() {
        let dashboards = store();
        dashboards.save("tmp", "T", &serde_json::json!({})).unwrap();
        dashboards.delete("tmp").unwrap();
        assert!(matches!(dashboards.get("tmp"), Err(RingError::NotFound(_))));
        // deleting an absent slug is a no-op
        dashboards.delete("tmp").unwrap();
    }
}
