// ABOUTME: Importer - loads archive files into an account as insert-or-replace writes
// ABOUTME: Tables missing from the archive are deleted from the account

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use super::format::{archive_path, list_archived_tables, read_archive};
use super::{ArchiveOutcome, ArchiveReport};
use crate::incremental::BatchReplicator;
use crate::plan::{plan_table_actions, TableAction, TablePlan};
use crate::table::{min_timestamp, TableService, MAX_BATCH_SIZE};
use crate::utils::validate_table_name;

/// Imports a directory of archive files into an account.
pub struct Importer<'a> {
    service: &'a dyn TableService,
    dir: PathBuf,
    skip_table: Option<String>,
    batch_size: usize,
}

impl<'a> Importer<'a> {
    pub fn new(service: &'a dyn TableService, dir: impl Into<PathBuf>) -> Self {
        Self {
            service,
            dir: dir.into(),
            skip_table: None,
            batch_size: MAX_BATCH_SIZE,
        }
    }

    /// Never touch this account table (the replicator's metadata table).
    pub fn skip_table(mut self, table: impl Into<String>) -> Self {
        self.skip_table = Some(table.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Archive files are the source, account tables the destination.
    pub async fn plan(&self) -> Result<TablePlan> {
        let mut archived = list_archived_tables(&self.dir).await?;
        let mut tables = self
            .service
            .list_tables()
            .await
            .context("Failed to list tables of the import target")?;
        if let Some(ref skip) = self.skip_table {
            archived.retain(|t| t != skip);
            tables.retain(|t| t != skip);
        }
        Ok(plan_table_actions(archived, tables))
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<ArchiveOutcome> {
        let plan = self.plan().await?;
        for table in plan.data_level() {
            validate_table_name(table)
                .with_context(|| format!("Archive {:?} cannot be imported", archive_path(&self.dir, table)))?;
        }

        let mut report = ArchiveReport::default();
        for (table, action) in plan.table_level() {
            if cancel.is_cancelled() {
                return Ok(ArchiveOutcome::Cancelled);
            }
            match action {
                TableAction::CreateTable => {
                    tracing::info!("TABLE CREATE  {}", table);
                    self.service
                        .create_table_if_absent(table)
                        .await
                        .with_context(|| format!("Failed to create table '{}'", table))?;
                    report.tables_created.push(table.to_string());
                }
                TableAction::DeleteTable => {
                    tracing::info!("TABLE DELETE  {}", table);
                    self.service
                        .delete_table_if_exists(table)
                        .await
                        .with_context(|| format!("Failed to delete table '{}'", table))?;
                    report.tables_deleted.push(table.to_string());
                }
                TableAction::SyncData => {}
            }
        }

        let replicator = BatchReplicator::new(self.service).with_batch_size(self.batch_size);
        for table in plan.data_level() {
            if cancel.is_cancelled() {
                return Ok(ArchiveOutcome::Cancelled);
            }
            tracing::info!("DATA SYNC     {}", table);

            let archive = read_archive(&archive_path(&self.dir, table)).await?;
            let written = replicator
                .write(table, archive.data, min_timestamp(), cancel)
                .await
                .with_context(|| format!("Failed to import table '{}'", table))?;
            if !written.complete {
                return Ok(ArchiveOutcome::Cancelled);
            }

            tracing::info!(
                "  {} row(s) in {} batch(es)",
                written.rows_written,
                written.chunks_written
            );
            report.rows.insert(table.to_string(), written.rows_written);
        }

        Ok(ArchiveOutcome::Completed(report))
    }
}
