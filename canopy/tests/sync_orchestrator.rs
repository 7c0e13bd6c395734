//! Integration tests for a full sync run over the standard registry

use canopy::caches::{self, CacheContext};
use canopy::source::StaticSource;
use canopy::store::{MemoryStore, Store};
use canopy::sync::{Registry, SyncOrchestrator};
use canopy::{CacheError, MemberFilter, SyncConfig};
use serde_json::{json, Value};
use std::sync::Arc;

fn asset(id: &str, subject: &str, level: &str, sources: &[&str]) -> Value {
    json!({
        "_id": id,
        "_last_modified": 1,
        "name": format!("{}_{}", level, id),
        "subject": {"subject_id": subject},
        "data_description": {
            "project_name": format!("project-{}", subject),
            "data_level": level,
            "source_data": sources
        },
        "quality_control": {"metrics": [
            {"name": "drift", "value": {"max": 1}, "status_history": [{"status": "Pass"}]}
        ]}
    })
}

fn documents() -> Vec<Value> {
    vec![
        asset("1", "S1", "raw", &[]),
        asset("2", "S1", "derived", &["raw_1"]),
        asset("3", "S2", "raw", &[]),
        asset("4", "S3", "raw", &[]),
        asset("5", "S4", "raw", &[]),
    ]
}

fn setup(source: StaticSource) -> (Arc<MemoryStore>, CacheContext) {
    let store = Arc::new(MemoryStore::new());
    let ctx = CacheContext::new(store.clone(), Arc::new(source));
    (store, ctx)
}

#[tokio::test]
async fn test_full_sync_populates_every_cache() {
    let (store, ctx) = setup(StaticSource::new(documents()));
    let orchestrator = SyncOrchestrator::new(
        ctx.clone(),
        Registry::standard().unwrap(),
        SyncConfig { max_workers: 2 },
    );

    let report = orchestrator.run().await.unwrap();
    assert_eq!(
        report.refreshed,
        vec![
            "unique_project_names",
            "unique_subject_ids",
            "asset_basics",
            "source_data",
            "raw_to_derived",
            "qc"
        ]
    );
    assert_eq!(report.groups.total, 4);
    assert_eq!(report.groups.synchronous, 1);
    assert_eq!(report.groups.parallel, 3);
    assert!(!report.fell_back);

    let keys = store.keys().await;
    for subject in ["S1", "S2", "S3", "S4"] {
        assert!(keys.contains(&format!("qc/{}", subject)), "missing qc/{}", subject);
    }

    // five single-key sidecars plus one shared qc sidecar
    assert_eq!(store.sidecar_count().await, 6);

    let ids = caches::unique_subject_ids(&ctx, false).await.unwrap();
    assert_eq!(ids, vec!["S1", "S2", "S3", "S4"]);

    let r2d = caches::raw_to_derived(&ctx, false).await.unwrap();
    assert_eq!(r2d.value(0, "derived_records"), Some(&json!("derived_2")));

    let s1 = caches::qc(&ctx, "S1", Some(MemberFilter::from("derived_2")), false)
        .await
        .unwrap();
    assert_eq!(s1.data.len(), 1);
    assert!(s1.missing.is_empty());
}

#[tokio::test]
async fn test_failing_group_is_reported_after_others_finish() {
    let source = StaticSource::new(documents())
        .fail_when(|q| q.filter.get("subject.subject_id") == Some(&json!("S2")));
    let (store, ctx) = setup(source);

    let result = SyncOrchestrator::new(ctx, Registry::standard().unwrap(), SyncConfig { max_workers: 1 })
        .run()
        .await;

    assert!(matches!(result, Err(CacheError::SourceError(_))));
    let keys = store.keys().await;
    assert!(keys.contains(&"qc/S1".to_string()));
    assert!(!keys.contains(&"qc/S2".to_string()));
    assert!(keys.contains(&"qc/S3".to_string()));
    assert!(keys.contains(&"qc/S4".to_string()));
}

#[tokio::test]
async fn test_family_sidecar_written_when_first_subject_has_no_metrics() {
    let mut without_qc = asset("1", "S1", "raw", &[]);
    if let Some(doc) = without_qc.as_object_mut() {
        doc.remove("quality_control");
    }
    let documents = vec![
        without_qc,
        asset("2", "S2", "raw", &[]),
        asset("3", "S3", "raw", &[]),
    ];
    let (store, ctx) = setup(StaticSource::new(documents));

    let report = SyncOrchestrator::new(ctx.clone(), Registry::standard().unwrap(), SyncConfig { max_workers: 2 })
        .run()
        .await
        .unwrap();
    assert_eq!(report.groups.synchronous, 2);

    let keys = store.keys().await;
    assert!(!keys.contains(&"qc/S1".to_string()));
    assert!(keys.contains(&"qc/S2".to_string()));
    assert!(keys.contains(&"qc/S3".to_string()));

    let columns = caches::qc_columns(&ctx).await.unwrap();
    assert!(columns.contains(&"asset_name".to_string()));
}

#[tokio::test]
async fn test_failing_first_subject_still_refreshes_the_rest() {
    let source = StaticSource::new(documents())
        .fail_when(|q| q.filter.get("subject.subject_id") == Some(&json!("S1")));
    let (store, ctx) = setup(source);

    let result = SyncOrchestrator::new(ctx.clone(), Registry::standard().unwrap(), SyncConfig::default())
        .run()
        .await;

    assert!(matches!(result, Err(CacheError::SourceError(_))));
    let keys = store.keys().await;
    assert!(!keys.contains(&"qc/S1".to_string()));
    for subject in ["S2", "S3", "S4"] {
        assert!(keys.contains(&format!("qc/{}", subject)), "missing qc/{}", subject);
    }
    assert!(caches::qc_columns(&ctx).await.is_ok());
}

#[tokio::test]
async fn test_simple_cache_failure_aborts_before_fan_out() {
    let (store, ctx) = setup(StaticSource::new(documents()).fail_aggregations());

    let result = SyncOrchestrator::new(ctx, Registry::standard().unwrap(), SyncConfig::default())
        .run()
        .await;

    assert!(result.is_err());
    assert!(store.keys().await.is_empty());
}

#[tokio::test]
async fn test_empty_source_completes_without_groups() {
    let (store, ctx) = setup(StaticSource::default());

    let report = SyncOrchestrator::new(ctx, Registry::standard().unwrap(), SyncConfig::default())
        .run()
        .await
        .unwrap();

    assert_eq!(report.groups.total, 0);
    assert!(report.finished_at.is_some());
    assert!(store.read("asset_basics").await.is_empty());
}
