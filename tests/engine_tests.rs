//! End-to-end tests through the engine context.
//!
//! Tests cover:
//! - Write, search, and aggregate across registered sources
//! - Tier migration of aged files and queries over the cold tier
//! - Plan generation and cost-model feedback through the engine surface
//! - Source registration errors and failure isolation
//! - Clean startup and shutdown of background loops

use stratalake::optimizer::{AggregateFunction, AggregateSpec, QueryRequest};
use stratalake::predicate::Predicate;
use stratalake::source::SourceConfig;
use stratalake::value::{Record, ScalarValue};
use stratalake::{Engine, EngineConfig, Error, StorageBackend, StorageConfig};

use tempfile::TempDir;

fn make_engine(dir: &TempDir) -> Engine {
    Engine::new(EngineConfig {
        tenant_id: "test-tenant".to_string(),
        storage: StorageConfig {
            backend: StorageBackend::Memory,
            base_path: dir.path().to_path_buf(),
        },
        ..Default::default()
    })
}

fn make_rows(count: usize, region: &str, base_value: f64) -> Vec<Record> {
    (0..count)
        .map(|i| {
            let mut row = Record::new();
            row.insert(
                "timestamp".to_string(),
                ScalarValue::Int(1_700_000_000_000 + i as i64 * 1_000),
            );
            row.insert("region".to_string(), ScalarValue::Str(region.to_string()));
            row.insert(
                "value".to_string(),
                ScalarValue::Float(base_value + i as f64),
            );
            row
        })
        .collect()
}

fn events_config() -> SourceConfig {
    SourceConfig {
        index_columns: vec!["region".to_string()],
        ..SourceConfig::new("events")
    }
}

#[tokio::test]
async fn write_then_search_returns_matching_rows() {
    let dir = TempDir::new().unwrap();
    let engine = make_engine(&dir);
    engine.add_source(events_config()).await.unwrap();

    let receipt = engine
        .write("events", make_rows(20, "us-east", 0.0))
        .await
        .unwrap();
    assert_eq!(receipt.row_count, 20);
    assert!(!receipt.files.is_empty());
    engine
        .write("events", make_rows(20, "eu-west", 100.0))
        .await
        .unwrap();

    let predicates = vec![Predicate::Eq {
        column: "region".to_string(),
        value: ScalarValue::Str("us-east".to_string()),
    }];
    let results = engine
        .search(&["events".to_string()], predicates, None, 0)
        .await;
    assert_eq!(results.len(), 1);
    assert!(results[0].error.is_none());
    assert_eq!(results[0].rows.len(), 20);
    for row in &results[0].rows {
        assert_eq!(
            row.get("region"),
            Some(&ScalarValue::Str("us-east".to_string()))
        );
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn aggregate_spans_sources() {
    let dir = TempDir::new().unwrap();
    let engine = make_engine(&dir);
    engine.add_source(events_config()).await.unwrap();
    engine
        .add_source(SourceConfig::new("audit"))
        .await
        .unwrap();

    engine
        .write("events", make_rows(10, "us-east", 0.0))
        .await
        .unwrap();
    engine
        .write("audit", make_rows(5, "us-east", 1_000.0))
        .await
        .unwrap();

    // Both aggregations fold in a single pass, keyed by alias
    let ids = vec!["events".to_string(), "audit".to_string()];
    let specs = vec![
        AggregateSpec::new(AggregateFunction::Count, None),
        AggregateSpec::aliased(
            AggregateFunction::Sum,
            Some("value".to_string()),
            "total_value",
        ),
        AggregateSpec::new(AggregateFunction::Avg, Some("value".to_string())),
    ];
    let results = engine.aggregate(&ids, specs, Vec::new()).await.unwrap();
    assert_eq!(results.get("count"), Some(&Some(15.0)));
    // events: 0..10 sums to 45; audit: 1000..1005 sums to 5010
    assert_eq!(results.get("total_value"), Some(&Some(5_055.0)));
    assert_eq!(results.get("avg_value"), Some(&Some(5_055.0 / 15.0)));

    engine.shutdown().await;
}

#[tokio::test]
async fn migrate_cold_keeps_files_queryable() {
    let dir = TempDir::new().unwrap();
    let engine = make_engine(&dir);
    engine.add_source(events_config()).await.unwrap();
    engine
        .add_source(SourceConfig::new("audit"))
        .await
        .unwrap();
    engine
        .write("events", make_rows(30, "us-east", 0.0))
        .await
        .unwrap();
    engine
        .write("audit", make_rows(10, "us-east", 0.0))
        .await
        .unwrap();

    // Engine-wide migration sums moved counts over every source
    let moved = engine.migrate_cold(0).await.unwrap();
    assert_eq!(moved, 2);

    // A second pass finds nothing left in the hot tier.
    assert_eq!(engine.migrate_cold(0).await.unwrap(), 0);
    assert_eq!(engine.migrate_cold_source("events", 0).await.unwrap(), 0);

    let results = engine
        .search(&["events".to_string()], Vec::new(), None, 0)
        .await;
    assert!(results[0].error.is_none());
    assert_eq!(results[0].rows.len(), 30);

    engine.shutdown().await;
}

#[tokio::test]
async fn optimizer_plans_against_live_statistics() {
    let dir = TempDir::new().unwrap();
    let engine = make_engine(&dir);
    engine.add_source(events_config()).await.unwrap();
    engine
        .write("events", make_rows(100, "us-east", 0.0))
        .await
        .unwrap();

    let request = QueryRequest {
        source_ids: vec!["events".to_string()],
        predicates: vec![Predicate::Gt {
            column: "value".to_string(),
            value: ScalarValue::Float(50.0),
        }],
        aggregations: Vec::new(),
        limit: None,
    };
    let plan = engine.optimize(&request).await;
    assert!(!plan.operators.is_empty());
    assert!(plan.cost.total > 0.0);
    assert!(plan.estimated_time_ms > 0.0);

    // Feedback changes nothing until enough executions accumulate.
    let version_before = engine.optimizer().stats().cost_model.version;
    engine.record_execution(&plan.plan_id, plan.estimated_time_ms, 100, true);
    assert_eq!(
        engine.optimizer().stats().cost_model.version,
        version_before
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn unknown_and_duplicate_sources_error() {
    let dir = TempDir::new().unwrap();
    let engine = make_engine(&dir);
    engine.add_source(events_config()).await.unwrap();

    let err = engine.write("nope", make_rows(1, "x", 0.0)).await;
    assert!(matches!(err, Err(Error::SourceNotFound(_))));

    let dup = engine.add_source(events_config()).await;
    assert!(matches!(dup, Err(Error::SourceExists(_))));

    engine.shutdown().await;
}

#[tokio::test]
async fn search_isolates_failing_sources() {
    let dir = TempDir::new().unwrap();
    let engine = make_engine(&dir);
    engine.add_source(events_config()).await.unwrap();
    engine
        .write("events", make_rows(10, "us-east", 0.0))
        .await
        .unwrap();

    let ids = vec!["events".to_string(), "missing".to_string()];
    let results = engine.search(&ids, Vec::new(), None, 0).await;
    assert_eq!(results.len(), 2);

    let healthy = results.iter().find(|r| r.source_id == "events").unwrap();
    assert!(healthy.error.is_none());
    assert_eq!(healthy.rows.len(), 10);

    let failing = results.iter().find(|r| r.source_id == "missing").unwrap();
    assert!(failing.error.is_some());
    assert!(failing.rows.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn manual_compaction_preserves_rows() {
    let dir = TempDir::new().unwrap();
    let engine = make_engine(&dir);
    engine.add_source(events_config()).await.unwrap();

    for batch in 0..3 {
        engine
            .write("events", make_rows(50, "us-east", batch as f64 * 100.0))
            .await
            .unwrap();
    }

    let ran = engine.compact("events").await.unwrap();
    assert!(ran);

    let results = engine
        .search(&["events".to_string()], Vec::new(), None, 0)
        .await;
    assert!(results[0].error.is_none());
    assert_eq!(results[0].rows.len(), 150);

    let status = engine.status().await;
    assert_eq!(status.compaction.failed_jobs, 0);
    assert_eq!(status.sources.len(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn start_and_shutdown_stop_all_loops() {
    let dir = TempDir::new().unwrap();
    let engine = make_engine(&dir);
    engine.add_source(events_config()).await.unwrap();
    engine.start();

    engine
        .write("events", make_rows(5, "us-east", 0.0))
        .await
        .unwrap();

    // Must not hang waiting on a loop that ignores cancellation.
    tokio::time::timeout(std::time::Duration::from_secs(5), engine.shutdown())
        .await
        .unwrap();
}
