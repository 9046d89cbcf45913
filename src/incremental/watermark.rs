// ABOUTME: WatermarkStore - per-table high-water mark timestamps kept on the destination
// ABOUTME: One row per table in the SyncTimestamps partition of the metadata table

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::table::{
    min_timestamp, Entity, EntityProperty, Filter, TableBatch, TableQuery, TableService,
    MAX_BATCH_SIZE,
};
use crate::utils::sanitize_identifier;

/// Partition of the metadata table holding watermark rows.
pub const WATERMARK_PARTITION: &str = "SyncTimestamps";

/// Property carrying the watermark of the table named by the row key.
pub const WATERMARK_PROPERTY: &str = "SourceTimestamp";

/// Row-key comparisons per load query; together with the partition key
/// predicate this stays within the 15 comparisons a filter may contain.
pub const MAX_NAMES_PER_QUERY: usize = 14;

/// Watermark per table name.
pub type Watermarks = BTreeMap<String, DateTime<Utc>>;

/// Loads and saves watermarks in a metadata table of the destination account.
pub struct WatermarkStore<'a> {
    service: &'a dyn TableService,
    table: String,
}

impl<'a> WatermarkStore<'a> {
    pub fn new(service: &'a dyn TableService, table: impl Into<String>) -> Self {
        Self {
            service,
            table: table.into(),
        }
    }

    /// Name of the metadata table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the metadata table if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<()> {
        let created = self
            .service
            .create_table_if_absent(&self.table)
            .await
            .with_context(|| format!("Failed to create metadata table '{}'", self.table))?;

        if created {
            tracing::info!("Created metadata table '{}'", self.table);
        }
        Ok(())
    }

    /// Watermarks for exactly `tables`.
    ///
    /// Tables without a stored watermark get [`min_timestamp`]. Stored rows for
    /// other tables are ignored.
    pub async fn load<S: AsRef<str>>(&self, tables: &[S]) -> Result<Watermarks> {
        let mut marks: Watermarks = tables
            .iter()
            .map(|t| (t.as_ref().to_string(), min_timestamp()))
            .collect();
        let names: Vec<String> = marks.keys().cloned().collect();

        for chunk in names.chunks(MAX_NAMES_PER_QUERY) {
            let Some(row_keys) = Filter::any_of(chunk.iter().map(|n| Filter::row_key_eq(n.clone())))
            else {
                continue;
            };
            let query = TableQuery::new()
                .filter(Filter::partition_key_eq(WATERMARK_PARTITION).and(row_keys))
                .select([WATERMARK_PROPERTY]);

            let mut continuation = None;
            loop {
                let page = self
                    .service
                    .query_page(&self.table, &query, continuation)
                    .await
                    .with_context(|| {
                        format!("Failed to load watermarks from '{}'", self.table)
                    })?;

                for entity in page.entities {
                    let Some(mark) = marks.get_mut(&entity.row_key) else {
                        continue;
                    };
                    match entity
                        .property(WATERMARK_PROPERTY)
                        .and_then(EntityProperty::as_datetime)
                    {
                        Some(timestamp) => *mark = timestamp,
                        None => tracing::warn!(
                            "Watermark row for '{}' has no {} value; syncing it from the beginning",
                            sanitize_identifier(&entity.row_key),
                            WATERMARK_PROPERTY
                        ),
                    }
                }

                continuation = page.continuation;
                if continuation.is_none() {
                    break;
                }
            }
        }

        Ok(marks)
    }

    /// Upsert one watermark row per entry.
    ///
    /// Rows are written in name order, up to [`MAX_BATCH_SIZE`] per batch. Each
    /// batch is all-or-nothing. Every batch is attempted; failures are reported
    /// together afterwards.
    pub async fn save(&self, marks: &Watermarks) -> Result<()> {
        let rows: Vec<Entity> = marks
            .iter()
            .map(|(table, timestamp)| watermark_row(table, *timestamp))
            .collect();

        let mut failures = Vec::new();
        for chunk in rows.chunks(MAX_BATCH_SIZE) {
            let batch = TableBatch::new(chunk)?;
            match self.service.execute_batch(&self.table, &batch).await {
                Ok(()) => {
                    for row in chunk {
                        if let Some(EntityProperty::DateTime(ts)) =
                            row.property(WATERMARK_PROPERTY)
                        {
                            tracing::info!("{}", status_line(&row.row_key, *ts));
                        }
                    }
                }
                Err(e) => {
                    let names = chunk
                        .iter()
                        .map(|e| e.row_key.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    tracing::warn!("Failed to save watermarks for [{}]: {:#}", names, e);
                    failures.push(format!("[{}]: {:#}", names, e));
                }
            }
        }

        if !failures.is_empty() {
            bail!(
                "Failed to save {} of {} watermark batch(es) to '{}':\n{}",
                failures.len(),
                rows.len().div_ceil(MAX_BATCH_SIZE),
                self.table,
                failures.join("\n")
            );
        }

        tracing::debug!("Saved {} watermark(s) to '{}'", rows.len(), self.table);
        Ok(())
    }
}

/// One-line status of a table's watermark, as shown when loading and saving.
pub fn status_line(table: &str, watermark: DateTime<Utc>) -> String {
    if watermark == min_timestamp() {
        format!("'{}': never synced", table)
    } else {
        format!("'{}': synced up to {}", table, watermark.to_rfc3339())
    }
}

fn watermark_row(table: &str, timestamp: DateTime<Utc>) -> Entity {
    Entity::new(WATERMARK_PARTITION, table)
        .with_property(WATERMARK_PROPERTY, EntityProperty::DateTime(timestamp))
}
