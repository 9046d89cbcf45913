// ABOUTME: ChangeReader - pulls rows modified after a watermark from a source table
// ABOUTME: Drains continuation pages, reports progress and stops early on cancellation

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::table::{Entity, Filter, TableQuery, TableService};

/// Reads changed rows from a table using its modification timestamp.
///
/// The service stamps every write, so the rows to replicate are those with
/// `Timestamp` strictly greater than the last watermark.
pub struct ChangeReader<'a> {
    service: &'a dyn TableService,
    page_size: Option<usize>,
}

impl<'a> ChangeReader<'a> {
    pub fn new(service: &'a dyn TableService) -> Self {
        Self {
            service,
            page_size: None,
        }
    }

    /// Ask the service for pages of at most `page_size` rows.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Read every row of `table` modified after `watermark`.
    ///
    /// Rows come back in service page order. `on_page` receives the running
    /// row count after each page. Cancellation is checked before every page
    /// request; a cancelled pull returns the rows read so far, so callers
    /// must check the token to tell a partial result from a complete one.
    pub async fn pull<F>(
        &self,
        table: &str,
        watermark: DateTime<Utc>,
        cancel: &CancellationToken,
        mut on_page: F,
    ) -> Result<Vec<Entity>>
    where
        F: FnMut(usize),
    {
        let mut query = TableQuery::new().filter(Filter::modified_after(watermark));
        if let Some(size) = self.page_size {
            query = query.page_size(size);
        }

        let mut rows = Vec::new();
        let mut continuation = None;
        let mut pages = 0usize;

        loop {
            if cancel.is_cancelled() {
                tracing::warn!(
                    "Pull of '{}' cancelled after {} page(s), {} row(s)",
                    table,
                    pages,
                    rows.len()
                );
                break;
            }

            let page = self
                .service
                .query_page(table, &query, continuation)
                .await
                .with_context(|| format!("Failed to read changes from '{}'", table))?;

            pages += 1;
            rows.extend(page.entities);
            on_page(rows.len());
            tracing::debug!("'{}': page {} read, {} row(s) so far", table, pages, rows.len());

            continuation = page.continuation;
            if continuation.is_none() {
                break;
            }
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{min_timestamp, EntityProperty, MemoryTableService};
    use chrono::{Duration, TimeZone};

    fn row(pk: &str, rk: &str) -> Entity {
        Entity::new(pk, rk).with_property("Name", EntityProperty::String(rk.to_string()))
    }

    #[tokio::test]
    async fn test_pull_returns_rows_after_watermark() {
        let service = MemoryTableService::new();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        service.insert_at("orders", row("p", "old"), t0 - Duration::seconds(1));
        service.insert_at("orders", row("p", "edge"), t0);
        service.insert_at("orders", row("p", "new1"), t0 + Duration::seconds(1));
        service.insert_at("orders", row("p", "new5"), t0 + Duration::seconds(5));

        let reader = ChangeReader::new(&service);
        let rows = reader
            .pull("orders", t0, &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        let keys: Vec<&str> = rows.iter().map(|r| r.row_key.as_str()).collect();
        assert_eq!(keys, vec!["new1", "new5"]);
    }

    #[tokio::test]
    async fn test_pull_drains_pages_and_reports_progress() {
        let service = MemoryTableService::new().with_page_size(10);
        for i in 0..25 {
            service.insert("users", row("p", &format!("r{:02}", i)));
        }

        let mut progress = Vec::new();
        let rows = ChangeReader::new(&service)
            .pull("users", min_timestamp(), &CancellationToken::new(), |n| {
                progress.push(n)
            })
            .await
            .unwrap();

        assert_eq!(rows.len(), 25);
        assert_eq!(progress, vec![10, 20, 25]);
    }

    #[tokio::test]
    async fn test_pull_empty_table_reports_one_page() {
        let service = MemoryTableService::new();
        service.create_table("empty");

        let mut progress = Vec::new();
        let rows = ChangeReader::new(&service)
            .pull("empty", min_timestamp(), &CancellationToken::new(), |n| {
                progress.push(n)
            })
            .await
            .unwrap();

        assert!(rows.is_empty());
        assert_eq!(progress, vec![0]);
    }

    #[tokio::test]
    async fn test_pull_stops_when_cancelled() {
        let service = MemoryTableService::new().with_page_size(10);
        for i in 0..25 {
            service.insert("users", row("p", &format!("r{:02}", i)));
        }

        let cancel = CancellationToken::new();
        let rows = ChangeReader::new(&service)
            .pull("users", min_timestamp(), &cancel, |n| {
                if n >= 10 {
                    cancel.cancel();
                }
            })
            .await
            .unwrap();

        assert_eq!(rows.len(), 10);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_pull_cancelled_before_start_issues_no_query() {
        let service = MemoryTableService::new();
        service.insert("users", row("p", "r"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let rows = ChangeReader::new(&service)
            .pull("users", min_timestamp(), &cancel, |_| {})
            .await
            .unwrap();

        assert!(rows.is_empty());
        assert!(service.queries().is_empty());
    }

    #[tokio::test]
    async fn test_pull_missing_table_fails() {
        let service = MemoryTableService::new();
        let result = ChangeReader::new(&service)
            .pull("missing", min_timestamp(), &CancellationToken::new(), |_| {})
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_requested_page_size_is_sent() {
        let service = MemoryTableService::new();
        for i in 0..7 {
            service.insert("users", row("p", &format!("r{}", i)));
        }

        let mut progress = Vec::new();
        ChangeReader::new(&service)
            .with_page_size(3)
            .pull("users", min_timestamp(), &CancellationToken::new(), |n| {
                progress.push(n)
            })
            .await
            .unwrap();

        assert_eq!(progress, vec![3, 6, 7]);
    }
}
