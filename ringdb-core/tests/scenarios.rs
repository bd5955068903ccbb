//! End-to-end scenarios exercising the full stack: registry, ring storage,
//! counter ingest, retention rewrite, and the SQL layer over the in-memory
//! backend.

use ringdb_core::backend::{Backend, MemoryBackend};
use ringdb_core::query::{QueryEngine, QueryRequest};
use ringdb_core::{MetricRef, MetricType, RingError, TagMap, Tsdb};
use std::sync::Arc;

fn fixture() -> (Tsdb, QueryEngine) {
    let backend = Arc::new(MemoryBackend::new()) as Arc<dyn Backend>;
    (Tsdb::new(backend.clone()), QueryEngine::new(backend))
}

fn gauge(name: &str) -> MetricRef {
    MetricRef::ByName {
        name: name.to_string(),
        tags: TagMap::new(),
    }
}

#[test]
fn ring_overwrite_keeps_latest_per_slot() {
    let (db, _) = fixture();
    let id = db.write_gauge(&gauge("m"), 100, 1.0, Some(1), Some(4)).unwrap();
    for (ts, value) in [(101, 2.0), (102, 3.0), (103, 4.0), (104, 5.0)] {
        db.write_gauge(&MetricRef::ById(id), ts, value, None, None).unwrap();
    }

    let rows = db.read_range(id, 100, 104).unwrap();
    let got: Vec<(i64, f64)> = rows.iter().map(|s| (s.ts, s.value)).collect();
    assert_eq!(got, vec![(101, 2.0), (102, 3.0), (103, 4.0), (104, 5.0)]);
}

#[test]
fn full_history_returns_latest_sample_per_slot() {
    let (db, _) = fixture();
    let id = db.write_gauge(&gauge("m"), 0, 0.0, Some(1), Some(7)).unwrap();
    for ts in 1..50 {
        db.write_gauge(&MetricRef::ById(id), ts, ts as f64, None, None).unwrap();
    }
    let rows = db.read_range(id, i64::MIN, i64::MAX).unwrap();
    assert_eq!(rows.len(), 7);
    // each surviving sample is the latest timestamp that mapped to its slot
    let ts: Vec<i64> = rows.iter().map(|s| s.ts).collect();
    assert_eq!(ts, (43..50).collect::<Vec<i64>>());
}

#[test]
fn slot_math_matches_geometry() {
    let (db, _) = fixture();
    let id = db
        .write_gauge(&gauge("m"), 1_700_000_000, 0.5, Some(60), Some(1440))
        .unwrap();
    let descriptor = db.describe(id).unwrap();
    assert_eq!(descriptor.slot_for(1_700_000_000), 1040);
}

#[test]
fn counter_rates_with_reset_clamped_to_zero() {
    let (db, engine) = fixture();
    let counter = MetricRef::ByName {
        name: "reqs".to_string(),
        tags: TagMap::new(),
    };
    let mut id = 0;
    for (ts, raw) in [(0, 100.0), (60, 160.0), (120, 180.0), (180, 50.0)] {
        id = db.write_counter(&counter, ts, raw, Some(60), Some(10)).unwrap();
    }

    let sql = format!(
        "WITH bucketed AS ( \
           SELECT ts_bucket(ts, 60) AS bucket, max(value) AS value \
           FROM samples WHERE metric_id = {id} AND ts >= 0 AND ts <= 180 \
           GROUP BY bucket \
         ) \
         SELECT bucket, bucket_rate(value, lag(value) OVER (ORDER BY bucket), 60) AS rate \
         FROM bucketed ORDER BY bucket",
        id = id
    );
    let out = engine
        .run(&QueryRequest {
            metric_ids: vec![id],
            selectors: Vec::new(),
            start_ts: 0,
            end_ts: 180,
            sql,
        })
        .unwrap();

    let rates: Vec<Option<f64>> = out.rows.iter().map(|r| r["rate"].as_f64()).collect();
    assert_eq!(rates[0], None);
    assert_eq!(rates[1], Some(1.0));
    assert!((rates[2].unwrap() - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(rates[3], Some(0.0));
}

#[test]
fn concurrent_ensure_collapses_to_one_metric() {
    let backend = Arc::new(MemoryBackend::new()) as Arc<dyn Backend>;
    let mut handles = Vec::new();
    for _ in 0..8 {
        let backend = backend.clone();
        handles.push(std::thread::spawn(move || {
            let db = Tsdb::new(backend);
            let mut tags = TagMap::new();
            tags.insert("h".to_string(), "a".to_string());
            db.registry().ensure("x", &tags, MetricType::Gauge, 1, 10)
        }));
    }
    let ids: Vec<u64> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]), "ids diverged: {:?}", ids);

    let db = Tsdb::new(backend);
    let page = db.registry().lookup(Some("x"), &TagMap::new(), 10).unwrap();
    assert_eq!(page.metrics.len(), 1);
}

#[test]
fn retention_rewrite_preserves_aligned_samples() {
    let (db, _) = fixture();
    let id = db.write_gauge(&gauge("m"), 0, 0.0, Some(1), Some(10)).unwrap();
    for ts in 1..10 {
        db.write_gauge(&MetricRef::ById(id), ts, ts as f64, None, None).unwrap();
    }

    db.registry().retention_rewrite(id, 2, 10).unwrap();

    let descriptor = db.describe(id).unwrap();
    assert_eq!((descriptor.step, descriptor.slots), (2, 10));
    let rows = db.read_range(id, 0, 100).unwrap();
    let ts: Vec<i64> = rows.iter().map(|s| s.ts).collect();
    assert_eq!(ts, vec![0, 2, 4, 6, 8]);
    for sample in &rows {
        assert_eq!(sample.value, sample.ts as f64);
    }
}

#[test]
fn retention_rewrite_refuses_counters() {
    let (db, _) = fixture();
    let id = db
        .write_counter(
            &MetricRef::ByName { name: "c".into(), tags: TagMap::new() },
            0,
            1.0,
            Some(1),
            Some(10),
        )
        .unwrap();
    let err = db.registry().retention_rewrite(id, 2, 10).unwrap_err();
    assert!(matches!(err, RingError::TypeMismatch(_)));
}

#[test]
fn delete_is_idempotent_and_complete() {
    let (db, _) = fixture();
    let mut tags = TagMap::new();
    tags.insert("host".to_string(), "a".to_string());
    let id = db
        .write_gauge(
            &MetricRef::ByName { name: "m".into(), tags },
            1,
            1.0,
            Some(1),
            Some(100),
        )
        .unwrap();

    db.registry().delete(id).unwrap();
    assert!(matches!(db.describe(id), Err(RingError::NotFound(_))));
    assert!(db.read_range(id, 0, 100).unwrap().is_empty());
    assert!(db.registry().lookup(Some("m"), &TagMap::new(), 10).unwrap().metrics.is_empty());
    // a second delete leaves the store unchanged and succeeds
    db.registry().delete(id).unwrap();
    // writes to the deleted metric fail until it is re-created
    assert!(matches!(
        db.ring().write_sample(id, 5, 5.0),
        Err(RingError::NotFound(_))
    ));
}

#[test]
fn unbounded_sql_is_rejected() {
    let (db, engine) = fixture();
    let id = db.write_gauge(&gauge("m"), 1, 1.0, None, None).unwrap();
    let err = engine
        .run(&QueryRequest {
            metric_ids: vec![id],
            selectors: Vec::new(),
            start_ts: 0,
            end_ts: 10,
            sql: "SELECT * FROM samples".to_string(),
        })
        .unwrap_err();
    assert_eq!(err.kind_code(), "VALIDATION");
}

#[test]
fn gauge_and_counter_share_namespace_without_collisions() {
    let (db, _) = fixture();
    let g = db.write_gauge(&gauge("g"), 1, 1.0, None, None).unwrap();
    let c = db
        .write_counter(
            &MetricRef::ByName { name: "c".into(), tags: TagMap::new() },
            1,
            1.0,
            None,
            None,
        )
        .unwrap();
    assert_ne!(g, c);
    assert_eq!(db.describe(g).unwrap().metric_type, MetricType::Gauge);
    assert_eq!(db.describe(c).unwrap().metric_type, MetricType::Counter);
}
