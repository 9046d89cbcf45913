// ABOUTME: Integration tests for timestamp-based incremental sync
// ABOUTME: Full runs against in-memory accounts: repeat runs, updates, cancellation, resume

use chrono::{DateTime, Utc};
use table_replicator::config::{PersistPolicy, SyncSettings};
use table_replicator::incremental::{
    SyncOrchestrator, SyncOutcome, SyncReport, WatermarkStore, WATERMARK_PARTITION,
};
use table_replicator::table::{min_timestamp, Entity, EntityProperty, MemoryTableService};
use tokio_util::sync::CancellationToken;

const META: &str = "aaareplicatormeta";

fn entity(pk: &str, rk: &str, value: i64) -> Entity {
    Entity::new(pk, rk)
        .with_property("Value", EntityProperty::Int64(value))
        .with_property("Label", EntityProperty::String(format!("{}-{}", pk, rk)))
}

fn settings(persist: PersistPolicy) -> SyncSettings {
    SyncSettings {
        persist,
        ..SyncSettings::default()
    }
}

async fn run(
    source: &MemoryTableService,
    destination: &MemoryTableService,
    persist: PersistPolicy,
    cancel: &CancellationToken,
) -> SyncOutcome {
    SyncOrchestrator::new(source, destination, settings(persist))
        .run(cancel)
        .await
        .expect("sync run failed")
}

async fn run_to_completion(
    source: &MemoryTableService,
    destination: &MemoryTableService,
) -> SyncReport {
    match run(source, destination, PersistPolicy::AfterRun, &CancellationToken::new()).await {
        SyncOutcome::Completed(report) => report,
        SyncOutcome::Cancelled => panic!("run was cancelled"),
    }
}

async fn watermarks(
    destination: &MemoryTableService,
    tables: &[&str],
) -> Vec<DateTime<Utc>> {
    let store = WatermarkStore::new(destination, META);
    let marks = store.load(tables).await.unwrap();
    tables.iter().map(|t| marks[*t]).collect()
}

/// Destination rows without timestamps, which differ between accounts.
fn contents(service: &MemoryTableService, table: &str) -> Vec<Entity> {
    service
        .entities(table)
        .into_iter()
        .map(|mut e| {
            e.timestamp = None;
            e
        })
        .collect()
}

#[tokio::test]
async fn test_repeated_runs_only_copy_changes() {
    let source = MemoryTableService::new();
    let destination = MemoryTableService::new();
    for i in 0..40 {
        source.insert("orders", entity(&format!("p{}", i % 3), &format!("{:03}", i), i));
    }
    source.insert("users", entity("u", "1", 1));

    let first = run_to_completion(&source, &destination).await;
    assert_eq!(first.rows_written(), 41);
    assert_eq!(contents(&destination, "orders"), contents(&source, "orders"));

    // no changes: nothing written
    let second = run_to_completion(&source, &destination).await;
    assert_eq!(second.rows_written(), 0);
    assert_eq!(second.tables_changed(), 0);

    // one update and one insert
    source.insert("orders", entity("p1", "001", 999));
    source.insert("users", entity("u", "2", 2));
    let third = run_to_completion(&source, &destination).await;
    assert_eq!(third.rows_written(), 2);
    assert_eq!(
        destination
            .get("orders", "p1", "001")
            .unwrap()
            .property("Value"),
        Some(&EntityProperty::Int64(999))
    );
    assert_eq!(contents(&destination, "users"), contents(&source, "users"));
}

#[tokio::test]
async fn test_persisted_watermarks_never_decrease() {
    let source = MemoryTableService::new();
    let destination = MemoryTableService::new();
    source.insert("orders", entity("p", "1", 1));
    source.create_table("quiet");

    run_to_completion(&source, &destination).await;
    let before = watermarks(&destination, &["orders", "quiet"]).await;
    assert_eq!(before[1], min_timestamp());

    source.insert("orders", entity("p", "2", 2));
    run_to_completion(&source, &destination).await;
    let after = watermarks(&destination, &["orders", "quiet"]).await;

    assert!(after[0] > before[0]);
    assert_eq!(after[1], before[1]);

    run_to_completion(&source, &destination).await;
    assert_eq!(watermarks(&destination, &["orders", "quiet"]).await, after);
}

#[tokio::test]
async fn test_cancelled_run_is_redone_by_next_run() {
    let source = MemoryTableService::new();
    let destination = MemoryTableService::new();
    for i in 0..250 {
        source.insert("big", entity(&format!("p{}", i % 2), &format!("{:03}", i), i));
    }
    source.insert("small", entity("p", "1", 1));

    let cancel = CancellationToken::new();
    destination.cancel_after_batches(2, cancel.clone());
    let outcome = run(&source, &destination, PersistPolicy::AfterRun, &cancel).await;

    assert_eq!(outcome, SyncOutcome::Cancelled);
    assert!(destination.entities(META).is_empty());
    assert!(destination.entities("small").is_empty());
    assert_eq!(
        watermarks(&destination, &["big", "small"]).await,
        vec![min_timestamp(), min_timestamp()]
    );

    let resumed = run_to_completion(&source, &destination).await;
    assert_eq!(resumed.rows_written(), 251);
    assert_eq!(contents(&destination, "big"), contents(&source, "big"));
    assert_eq!(contents(&destination, "small"), contents(&source, "small"));
}

#[tokio::test]
async fn test_per_table_persistence_survives_cancellation() {
    let source = MemoryTableService::new();
    let destination = MemoryTableService::new();
    let first_last = source.insert("first", entity("p", "1", 1));
    for i in 0..150 {
        source.insert("second", entity("p", &format!("{:03}", i), i));
    }

    let cancel = CancellationToken::new();
    // "first" data, "first" watermark, first chunk of "second"
    destination.cancel_after_batches(3, cancel.clone());
    let outcome = run(&source, &destination, PersistPolicy::PerTable, &cancel).await;
    assert_eq!(outcome, SyncOutcome::Cancelled);

    assert_eq!(
        watermarks(&destination, &["first", "second"]).await,
        vec![first_last, min_timestamp()]
    );

    destination.clear_logs();
    let report = run_to_completion(&source, &destination).await;
    let first = report.tables.iter().find(|t| t.table == "first").unwrap();
    assert_eq!(first.rows_pulled, 0);
    let second = report.tables.iter().find(|t| t.table == "second").unwrap();
    assert_eq!(second.rows_written, 150);
}

#[tokio::test]
async fn test_failed_run_keeps_previous_watermarks() {
    let source = MemoryTableService::new();
    let destination = MemoryTableService::new();
    source.insert("aaa", entity("p", "1", 1));
    source.insert("bbb", entity("p", "1", 1));
    run_to_completion(&source, &destination).await;
    let before = watermarks(&destination, &["aaa", "bbb"]).await;

    source.insert("aaa", entity("p", "2", 2));
    source.insert("bbb", entity("p", "2", 2));
    // "aaa" goes through, "bbb" fails
    destination.fail_batches_after(1);
    let result = SyncOrchestrator::new(&source, &destination, settings(PersistPolicy::AfterRun))
        .run(&CancellationToken::new())
        .await;
    assert!(result.is_err());

    destination.fail_batches_after(usize::MAX);
    assert_eq!(watermarks(&destination, &["aaa", "bbb"]).await, before);
}

#[tokio::test]
async fn test_many_tables_with_small_pages() {
    let source = MemoryTableService::new().with_page_size(7);
    let destination = MemoryTableService::new();
    let names: Vec<String> = (0..40).map(|i| format!("table{:02}", i)).collect();
    for (i, name) in names.iter().enumerate() {
        for r in 0..=i % 5 {
            source.insert(name, entity("p", &r.to_string(), r as i64));
        }
    }

    let report = run_to_completion(&source, &destination).await;
    assert_eq!(report.tables.len(), 40);

    destination.clear_logs();
    let again = run_to_completion(&source, &destination).await;
    assert_eq!(again.rows_written(), 0);

    // 40 names need three load queries; none exceeds the comparison limit
    let meta_queries: Vec<_> = destination
        .queries()
        .into_iter()
        .filter(|q| q.table == META)
        .collect();
    assert_eq!(meta_queries.len(), 3);
    assert!(meta_queries.iter().all(|q| q.comparisons <= 15));

    let rows = destination.entities(META);
    assert_eq!(rows.len(), 40);
    assert!(rows.iter().all(|r| r.partition_key == WATERMARK_PARTITION));
}
