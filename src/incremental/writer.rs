// ABOUTME: BatchReplicator - writes pulled rows to the destination as group upserts
// ABOUTME: Groups by partition key, chunks to the batch limit and tracks the new watermark

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::table::{Entity, TableBatch, TableService, MAX_BATCH_SIZE};
use crate::utils::sanitize_identifier;

/// Result of one [`BatchReplicator::write`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    /// Largest of the input watermark and every row timestamp passed in
    pub new_watermark: DateTime<Utc>,
    pub rows_written: usize,
    pub chunks_written: usize,
    /// False when cancellation stopped the write before every chunk was sent
    pub complete: bool,
}

/// Writes rows to a destination table with insert-or-replace group writes.
///
/// Every chunk holds rows of a single partition key and at most
/// `batch_size` rows, which is what the service accepts as one atomic write.
pub struct BatchReplicator<'a> {
    service: &'a dyn TableService,
    batch_size: usize,
}

impl<'a> BatchReplicator<'a> {
    pub fn new(service: &'a dyn TableService) -> Self {
        Self {
            service,
            batch_size: MAX_BATCH_SIZE,
        }
    }

    /// Rows per chunk, clamped to 1..=[`MAX_BATCH_SIZE`].
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    /// Upsert `rows` into `table`.
    ///
    /// The table is created first if it does not exist, even when `rows` is
    /// empty. Cancellation is checked before each chunk and once more after
    /// the last; on cancellation the remaining chunks are skipped and the
    /// report is marked incomplete. A
    /// failed chunk aborts the write; chunks already written stay written.
    pub async fn write(
        &self,
        table: &str,
        rows: Vec<Entity>,
        watermark: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<WriteReport> {
        let new_watermark = rows
            .iter()
            .filter_map(|row| row.timestamp)
            .fold(watermark, DateTime::max);

        self.service
            .create_table_if_absent(table)
            .await
            .with_context(|| format!("Failed to create destination table '{}'", table))?;

        let chunks = chunk_rows(rows, self.batch_size);
        let total = chunks.len();
        let mut report = WriteReport {
            new_watermark,
            rows_written: 0,
            chunks_written: 0,
            complete: true,
        };

        for chunk in &chunks {
            if cancel.is_cancelled() {
                break;
            }

            let batch = TableBatch::new(chunk)?;
            self.service
                .execute_batch(table, &batch)
                .await
                .with_context(|| {
                    format!(
                        "Failed to write {} row(s) of partition '{}' to '{}'",
                        batch.len(),
                        sanitize_identifier(batch.partition_key()),
                        table
                    )
                })?;

            report.rows_written += batch.len();
            report.chunks_written += 1;
            tracing::debug!(
                "'{}': chunk {}/{} written ({} rows)",
                table,
                report.chunks_written,
                total,
                batch.len()
            );
        }

        // a request observed during the last chunk still counts
        if cancel.is_cancelled() {
            tracing::warn!(
                "Write to '{}' cancelled after {} of {} chunk(s)",
                table,
                report.chunks_written,
                total
            );
            report.complete = false;
        }

        Ok(report)
    }
}

/// Split rows into single-partition chunks of at most `batch_size` rows.
///
/// Partition keys keep the order in which they first appear, and rows keep
/// their relative order within a partition.
pub fn chunk_rows(rows: Vec<Entity>, batch_size: usize) -> Vec<Vec<Entity>> {
    let batch_size = batch_size.max(1);

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<Entity>> = Vec::new();
    for row in rows {
        let slot = match index.get(&row.partition_key) {
            Some(&slot) => slot,
            None => {
                index.insert(row.partition_key.clone(), groups.len());
                groups.push(Vec::new());
                groups.len() - 1
            }
        };
        groups[slot].push(row);
    }

    let mut chunks = Vec::new();
    for group in groups {
        let mut group = group.into_iter().peekable();
        while group.peek().is_some() {
            chunks.push(group.by_ref().take(batch_size).collect());
        }
    }
    chunks
}
