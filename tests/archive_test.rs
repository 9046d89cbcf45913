// ABOUTME: Integration tests for archive export and import
// ABOUTME: Round-trips typed rows through Table_<name>.json files between two accounts

use chrono::{TimeZone, Utc};
use table_replicator::archive::{
    archive_path, list_archived_tables, read_archive, ArchiveOutcome, Exporter, Importer,
};
use table_replicator::table::{Entity, EntityProperty, MemoryTableService};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn typed_row(pk: &str, rk: &str) -> Entity {
    Entity::new(pk, rk)
        .with_property("Name", EntityProperty::String("Zoë \"quoted\"".to_string()))
        .with_property("Small", EntityProperty::Int32(-7))
        .with_property("Big", EntityProperty::Int64(9_007_199_254_740_993))
        .with_property("Ratio", EntityProperty::Double(0.25))
        .with_property("NotANumber", EntityProperty::Double(f64::NAN))
        .with_property("Huge", EntityProperty::Double(f64::INFINITY))
        .with_property("Active", EntityProperty::Boolean(true))
        .with_property("Blob", EntityProperty::Binary(vec![0, 1, 2, 254, 255]))
        .with_property(
            "Id",
            EntityProperty::Guid(Uuid::parse_str("6f9619ff-8b86-d011-b42d-00cf4fc964ff").unwrap()),
        )
        .with_property(
            "When",
            EntityProperty::DateTime(Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap()),
        )
}

fn completed(outcome: ArchiveOutcome) -> table_replicator::archive::ArchiveReport {
    match outcome {
        ArchiveOutcome::Completed(report) => report,
        ArchiveOutcome::Cancelled => panic!("run was cancelled"),
    }
}

/// Compare everything but timestamps; NaN compares equal to NaN.
fn assert_same_rows(left: &[Entity], right: &[Entity]) {
    assert_eq!(left.len(), right.len());
    for (a, b) in left.iter().zip(right) {
        assert_eq!(a.key(), b.key());
        assert_eq!(a.properties.len(), b.properties.len());
        for (name, value) in &a.properties {
            let other = b.property(name).unwrap_or_else(|| panic!("missing {}", name));
            match (value, other) {
                (EntityProperty::Double(x), EntityProperty::Double(y)) if x.is_nan() => {
                    assert!(y.is_nan(), "{} should be NaN", name)
                }
                _ => assert_eq!(value, other, "property {}", name),
            }
        }
    }
}

#[tokio::test]
async fn test_export_then_import_round_trips_typed_values() {
    let dir = TempDir::new().unwrap();
    let source = MemoryTableService::new();
    for i in 0..3 {
        source.insert("inventory", typed_row(&format!("p{}", i % 2), &format!("r{}", i)));
    }
    source.create_table("empty");

    let exported = completed(
        Exporter::new(&source, dir.path())
            .run(&CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(exported.total_rows(), 3);

    let json = std::fs::read_to_string(archive_path(dir.path(), "inventory")).unwrap();
    assert!(json.contains("\"Meta\""));
    assert!(json.contains("\"NaN\""));
    assert!(json.contains("\"INF\""));

    let destination = MemoryTableService::new();
    let imported = completed(
        Importer::new(&destination, dir.path())
            .run(&CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(imported.tables_created, vec!["empty", "inventory"]);
    assert_eq!(imported.total_rows(), 3);

    assert_same_rows(
        &destination.entities("inventory"),
        &source.entities("inventory"),
    );
    assert!(destination.entities("empty").is_empty());
    assert_eq!(destination.table_names(), vec!["empty", "inventory"]);
}

#[tokio::test]
async fn test_reexport_mirrors_dropped_tables() {
    let dir = TempDir::new().unwrap();
    let source = MemoryTableService::new();
    source.insert("keep", typed_row("p", "1"));
    source.insert("dropme", typed_row("p", "1"));

    Exporter::new(&source, dir.path())
        .run(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(list_archived_tables(dir.path()).await.unwrap().len(), 2);

    let account = MemoryTableService::new();
    account.insert("keep", typed_row("p", "1"));
    account.insert("keep", typed_row("p", "2"));

    let report = completed(
        Exporter::new(&account, dir.path())
            .run(&CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(report.tables_deleted, vec!["dropme"]);
    assert_eq!(
        list_archived_tables(dir.path()).await.unwrap(),
        vec!["keep".to_string()]
    );
    let keep = read_archive(&archive_path(dir.path(), "keep")).await.unwrap();
    assert_eq!(keep.data.len(), 2);
}

#[tokio::test]
async fn test_import_overwrites_existing_rows() {
    let dir = TempDir::new().unwrap();
    let source = MemoryTableService::new();
    source.insert(
        "users",
        Entity::new("p", "1").with_property("Name", EntityProperty::String("new".into())),
    );
    Exporter::new(&source, dir.path())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let destination = MemoryTableService::new();
    destination.insert(
        "users",
        Entity::new("p", "1")
            .with_property("Name", EntityProperty::String("old".into()))
            .with_property("Extra", EntityProperty::Boolean(false)),
    );

    Importer::new(&destination, dir.path())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let row = destination.get("users", "p", "1").unwrap();
    assert_eq!(
        row.property("Name"),
        Some(&EntityProperty::String("new".into()))
    );
    // insert-or-replace drops properties the archive does not carry
    assert!(row.property("Extra").is_none());
}
