// ABOUTME: Exporter - mirrors every table of an account into archive files
// ABOUTME: Creates, deletes and rewrites Table_<name>.json files per the table plan

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use super::format::{
    archive_path, list_archived_tables, remove_archive, write_archive, TableArchive,
};
use super::{ArchiveOutcome, ArchiveReport};
use crate::incremental::ChangeReader;
use crate::plan::{plan_table_actions, TableAction, TablePlan};
use crate::table::{min_timestamp, TableService};

/// Exports whole tables of an account into a directory.
///
/// Archive files with no matching table are deleted, so after a completed
/// run the directory mirrors the account.
pub struct Exporter<'a> {
    service: &'a dyn TableService,
    dir: PathBuf,
    skip_table: Option<String>,
}

impl<'a> Exporter<'a> {
    pub fn new(service: &'a dyn TableService, dir: impl Into<PathBuf>) -> Self {
        Self {
            service,
            dir: dir.into(),
            skip_table: None,
        }
    }

    /// Leave one table (the replicator's metadata table) out of the export.
    pub fn skip_table(mut self, table: impl Into<String>) -> Self {
        self.skip_table = Some(table.into());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Account tables are the source, archive files the destination.
    pub async fn plan(&self) -> Result<TablePlan> {
        let mut tables = self
            .service
            .list_tables()
            .await
            .context("Failed to list tables to export")?;
        if let Some(ref skip) = self.skip_table {
            tables.retain(|t| t != skip);
        }
        let archived = list_archived_tables(&self.dir).await?;
        Ok(plan_table_actions(tables, archived))
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<ArchiveOutcome> {
        let plan = self.plan().await?;
        let mut report = ArchiveReport::default();

        for (table, action) in plan.table_level() {
            if cancel.is_cancelled() {
                return Ok(ArchiveOutcome::Cancelled);
            }
            let path = archive_path(&self.dir, table);
            match action {
                TableAction::CreateTable => {
                    tracing::info!("TABLE CREATE  {}", table);
                    write_archive(&path, &TableArchive::empty()).await?;
                    report.tables_created.push(table.to_string());
                }
                TableAction::DeleteTable => {
                    tracing::info!("TABLE DELETE  {}", table);
                    remove_archive(&path).await?;
                    report.tables_deleted.push(table.to_string());
                }
                TableAction::SyncData => {}
            }
        }

        let reader = ChangeReader::new(self.service);
        for table in plan.data_level() {
            if cancel.is_cancelled() {
                return Ok(ArchiveOutcome::Cancelled);
            }
            tracing::info!("DATA SYNC     {}", table);

            let rows = reader
                .pull(table, min_timestamp(), cancel, |_| {})
                .await
                .with_context(|| format!("Failed to export table '{}'", table))?;
            if cancel.is_cancelled() {
                return Ok(ArchiveOutcome::Cancelled);
            }

            let count = rows.len();
            write_archive(&archive_path(&self.dir, table), &TableArchive::new(rows)).await?;
            tracing::info!("  {} row(s) written", count);
            report.rows.insert(table.to_string(), count);
        }

        Ok(ArchiveOutcome::Completed(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::format::read_archive;
    use crate::table::{Entity, EntityProperty, MemoryTableService};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_export_mirrors_account() {
        let dir = tempdir().unwrap();
        let service = MemoryTableService::new();
        service.insert("users", Entity::new("b", "2"));
        service.insert(
            "users",
            Entity::new("a", "1").with_property("Name", EntityProperty::String("Ada".into())),
        );
        service.create_table("empty");
        write_archive(&archive_path(dir.path(), "stale"), &TableArchive::empty())
            .await
            .unwrap();

        let outcome = Exporter::new(&service, dir.path())
            .run(&CancellationToken::new())
            .await
            .unwrap();

        let ArchiveOutcome::Completed(report) = outcome else {
            panic!("export was cancelled");
        };
        assert_eq!(report.tables_created, vec!["empty", "users"]);
        assert_eq!(report.tables_deleted, vec!["stale"]);
        assert_eq!(report.rows.get("users"), Some(&2));

        assert_eq!(
            list_archived_tables(dir.path()).await.unwrap(),
            vec!["empty".to_string(), "users".to_string()]
        );
        let users = read_archive(&archive_path(dir.path(), "users")).await.unwrap();
        assert_eq!(users.data[0].row_key, "1");
        assert_eq!(users.data[1].row_key, "2");
        assert!(users.data[0].timestamp.is_some());
    }

    #[tokio::test]
    async fn test_export_skips_metadata_table() {
        let dir = tempdir().unwrap();
        let service = MemoryTableService::new();
        service.insert("meta", Entity::new("SyncTimestamps", "users"));
        service.insert("users", Entity::new("a", "1"));

        let plan = Exporter::new(&service, dir.path())
            .skip_table("meta")
            .plan()
            .await
            .unwrap();
        assert_eq!(plan.get("meta"), None);
        assert_eq!(plan.get("users"), Some(TableAction::CreateTable));
    }

    #[tokio::test]
    async fn test_export_cancelled_writes_no_data() {
        let dir = tempdir().unwrap();
        let service = MemoryTableService::new();
        service.insert("users", Entity::new("a", "1"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = Exporter::new(&service, dir.path()).run(&cancel).await.unwrap();

        assert_eq!(outcome, ArchiveOutcome::Cancelled);
        assert!(list_archived_tables(dir.path()).await.unwrap().is_empty());
    }
}
