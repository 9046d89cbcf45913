// ABOUTME: SyncOrchestrator - one incremental replication run from source to destination
// ABOUTME: Precheck, gather watermarks, pull and write each table, then persist watermarks

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::reader::ChangeReader;
use super::watermark::{status_line, WatermarkStore, Watermarks};
use super::writer::BatchReplicator;
use crate::config::{PersistPolicy, SyncSettings};
use crate::table::{min_timestamp, TableService};

/// Stages of a run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Precheck,
    GatherInfo,
    Sync,
    Persist,
    Done,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Precheck => "precheck",
            SyncPhase::GatherInfo => "gather info",
            SyncPhase::Sync => "sync",
            SyncPhase::Persist => "persist",
            SyncPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Progress notifications emitted while a run is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent<'e> {
    Phase(SyncPhase),
    TableStarted {
        table: &'e str,
        index: usize,
        total: usize,
    },
    RowsPulled {
        table: &'e str,
        rows: usize,
    },
    TableFinished {
        table: &'e str,
        rows_written: usize,
    },
}

/// What happened to one table during a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSyncReport {
    pub table: String,
    pub rows_pulled: usize,
    pub rows_written: usize,
    pub chunks_written: usize,
    pub previous_watermark: DateTime<Utc>,
    pub watermark: DateTime<Utc>,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub tables: Vec<TableSyncReport>,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn rows_written(&self) -> usize {
        self.tables.iter().map(|t| t.rows_written).sum()
    }

    /// Tables that had at least one changed row.
    pub fn tables_changed(&self) -> usize {
        self.tables.iter().filter(|t| t.rows_pulled > 0).count()
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Cancelled,
}

type ProgressFn<'a> = Box<dyn Fn(SyncEvent<'_>) + Send + Sync + 'a>;

/// Drives one incremental replication run.
///
/// Tables are processed one at a time in name order. A table's in-memory
/// watermark only advances when both its pull and its write ran to the end.
/// With [`PersistPolicy::AfterRun`] the watermarks are saved once after every
/// table was attempted, so a cancelled or failed run persists nothing and
/// the next run re-sends the same rows as idempotent upserts.
pub struct SyncOrchestrator<'a> {
    source: &'a dyn TableService,
    destination: &'a dyn TableService,
    settings: SyncSettings,
    tables: Vec<String>,
    page_size: Option<usize>,
    progress: Option<ProgressFn<'a>>,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(
        source: &'a dyn TableService,
        destination: &'a dyn TableService,
        settings: SyncSettings,
    ) -> Self {
        Self {
            source,
            destination,
            settings,
            tables: Vec::new(),
            page_size: None,
            progress: None,
        }
    }

    /// Restrict the run to these source tables (empty = all tables).
    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = tables;
        self
    }

    /// Page size requested from the source.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(SyncEvent<'_>) + Send + Sync + 'a,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    fn emit(&self, event: SyncEvent<'_>) {
        if let Some(ref progress) = self.progress {
            progress(event);
        }
    }

    fn enter(&self, phase: SyncPhase) {
        tracing::info!("Phase: {}", phase);
        self.emit(SyncEvent::Phase(phase));
    }

    fn cancelled(&self, phase: SyncPhase) -> SyncOutcome {
        tracing::warn!(
            "Sync cancelled during {}; watermarks not yet saved are discarded",
            phase
        );
        SyncOutcome::Cancelled
    }

    /// Run every phase once.
    ///
    /// Returns `Ok(SyncOutcome::Cancelled)` when `cancel` fired before the run
    /// could finish, and `Err` when any phase failed.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let start = Instant::now();
        let store = WatermarkStore::new(self.destination, self.settings.metadata_table.clone());

        self.enter(SyncPhase::Precheck);
        store.ensure_table().await.context("Precheck failed")?;

        if cancel.is_cancelled() {
            return Ok(self.cancelled(SyncPhase::Precheck));
        }

        self.enter(SyncPhase::GatherInfo);
        let tables = self.source_tables().await?;
        let mut watermarks = store
            .load(&tables)
            .await
            .context("Failed to load watermarks")?;
        for table in &tables {
            let mark = watermarks.get(table).copied().unwrap_or_else(min_timestamp);
            tracing::info!("{}", status_line(table, mark));
        }

        self.enter(SyncPhase::Sync);
        let mut reader = ChangeReader::new(self.source);
        if let Some(size) = self.page_size {
            reader = reader.with_page_size(size);
        }
        let replicator =
            BatchReplicator::new(self.destination).with_batch_size(self.settings.batch_size);

        let mut report = SyncReport::default();
        for (index, table) in tables.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(self.cancelled(SyncPhase::Sync));
            }
            self.emit(SyncEvent::TableStarted {
                table,
                index,
                total: tables.len(),
            });

            let previous = watermarks.get(table).copied().unwrap_or_else(min_timestamp);
            let rows = reader
                .pull(table, previous, cancel, |rows| {
                    self.emit(SyncEvent::RowsPulled { table, rows })
                })
                .await?;
            if cancel.is_cancelled() {
                return Ok(self.cancelled(SyncPhase::Sync));
            }

            let rows_pulled = rows.len();
            let written = replicator
                .write(table, rows, previous, cancel)
                .await
                .with_context(|| format!("Failed to sync table '{}'", table))?;
            if !written.complete {
                return Ok(self.cancelled(SyncPhase::Sync));
            }

            watermarks.insert(table.clone(), written.new_watermark);
            if self.settings.persist == PersistPolicy::PerTable && written.new_watermark > previous
            {
                let single: Watermarks = [(table.clone(), written.new_watermark)]
                    .into_iter()
                    .collect();
                store
                    .save(&single)
                    .await
                    .with_context(|| format!("Failed to save watermark of '{}'", table))?;
            }

            tracing::info!(
                "'{}': {} row(s) pulled, {} written in {} chunk(s)",
                table,
                rows_pulled,
                written.rows_written,
                written.chunks_written
            );
            self.emit(SyncEvent::TableFinished {
                table,
                rows_written: written.rows_written,
            });
            report.tables.push(TableSyncReport {
                table: table.clone(),
                rows_pulled,
                rows_written: written.rows_written,
                chunks_written: written.chunks_written,
                previous_watermark: previous,
                watermark: written.new_watermark,
            });
        }

        if cancel.is_cancelled() {
            return Ok(self.cancelled(SyncPhase::Sync));
        }

        self.enter(SyncPhase::Persist);
        if self.settings.persist == PersistPolicy::AfterRun {
            store
                .save(&watermarks)
                .await
                .context("Failed to persist watermarks")?;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        self.enter(SyncPhase::Done);
        tracing::info!(
            "Sync complete: {} table(s), {} changed, {} row(s) written in {}ms",
            report.tables.len(),
            report.tables_changed(),
            report.rows_written(),
            report.duration_ms
        );

        Ok(SyncOutcome::Completed(report))
    }

    /// Source tables to sync, sorted, without the metadata table.
    async fn source_tables(&self) -> Result<Vec<String>> {
        let mut tables = self
            .source
            .list_tables()
            .await
            .context("Failed to list source tables")?;

        tables.retain(|t| *t != self.settings.metadata_table);
        if !self.tables.is_empty() {
            for wanted in &self.tables {
                if !tables.contains(wanted) {
                    tracing::warn!("Requested table '{}' does not exist in the source", wanted);
                }
            }
            tables.retain(|t| self.tables.contains(t));
        }
        tables.sort();
        tables.dedup();

        tracing::info!("Found {} source table(s) to sync", tables.len());
        Ok(tables)
    }
}
