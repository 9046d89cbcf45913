// ABOUTME: In-memory TableService with a logical clock, paging and fault injection
// ABOUTME: Stands in for a real account in tests and dry runs

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use super::entity::Entity;
use super::error::TableError;
use super::query::{Continuation, QueryPage, TableQuery};
use super::service::{TableBatch, TableService};

/// Largest page the service hands out, matching the real service.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

type Rows = BTreeMap<(String, String), Entity>;

/// Record of one executed group write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    pub table: String,
    pub partition_key: String,
    pub len: usize,
}

/// Record of one page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    pub table: String,
    pub comparisons: usize,
}

#[derive(Default)]
struct Account {
    tables: BTreeMap<String, Rows>,
    clock: Option<DateTime<Utc>>,
    batches: Vec<BatchRecord>,
    queries: Vec<QueryRecord>,
    fail_batches_after: Option<usize>,
    cancel_after_batches: Option<(usize, CancellationToken)>,
}

impl Account {
    /// Next write timestamp: strictly after every timestamp handed out so far.
    fn tick(&mut self) -> DateTime<Utc> {
        let next = match self.clock {
            Some(last) => last + Duration::milliseconds(1),
            None => Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_else(Utc::now),
        };
        self.clock = Some(next);
        next
    }

    fn observe(&mut self, timestamp: DateTime<Utc>) {
        if self.clock.map_or(true, |clock| timestamp > clock) {
            self.clock = Some(timestamp);
        }
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut Rows, TableError> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))
    }
}

/// A table account held in memory.
///
/// Timestamps come from a logical clock that advances by one millisecond per
/// written row, so every write gets a distinct, increasing timestamp.
pub struct MemoryTableService {
    account: Mutex<Account>,
    page_size: usize,
}

impl Default for MemoryTableService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTableService {
    pub fn new() -> Self {
        Self {
            account: Mutex::new(Account::default()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Cap every page at `page_size` rows.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn account(&self) -> MutexGuard<'_, Account> {
        self.account.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert a row as a client write would, creating the table if needed.
    /// Returns the timestamp assigned to the row.
    pub fn insert(&self, table: &str, mut entity: Entity) -> DateTime<Utc> {
        let mut account = self.account();
        let timestamp = account.tick();
        entity.timestamp = Some(timestamp);
        account
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key_of(&entity), entity);
        timestamp
    }

    /// Store a row with a caller-chosen timestamp, creating the table if needed.
    pub fn insert_at(&self, table: &str, mut entity: Entity, timestamp: DateTime<Utc>) {
        let mut account = self.account();
        account.observe(timestamp);
        entity.timestamp = Some(timestamp);
        account
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key_of(&entity), entity);
    }

    pub fn create_table(&self, table: &str) {
        self.account().tables.entry(table.to_string()).or_default();
    }

    /// All rows of a table in key order; empty if the table does not exist.
    pub fn entities(&self, table: &str) -> Vec<Entity> {
        self.account()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, table: &str, partition_key: &str, row_key: &str) -> Option<Entity> {
        self.account()
            .tables
            .get(table)?
            .get(&(partition_key.to_string(), row_key.to_string()))
            .cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.account().tables.keys().cloned().collect()
    }

    pub fn batches(&self) -> Vec<BatchRecord> {
        self.account().batches.clone()
    }

    pub fn batches_for(&self, table: &str) -> Vec<BatchRecord> {
        self.account()
            .batches
            .iter()
            .filter(|b| b.table == table)
            .cloned()
            .collect()
    }

    pub fn queries(&self) -> Vec<QueryRecord> {
        self.account().queries.clone()
    }

    pub fn clear_logs(&self) {
        let mut account = self.account();
        account.batches.clear();
        account.queries.clear();
    }

    /// Let `count` more batches succeed, then fail every following one.
    pub fn fail_batches_after(&self, count: usize) {
        self.account().fail_batches_after = Some(count);
    }

    /// Cancel `token` right after the `count`-th batch from now completes.
    pub fn cancel_after_batches(&self, count: usize, token: CancellationToken) {
        self.account().cancel_after_batches = Some((count, token));
    }
}

fn key_of(entity: &Entity) -> (String, String) {
    (entity.partition_key.clone(), entity.row_key.clone())
}

fn project(entity: &Entity, select: Option<&[String]>) -> Entity {
    match select {
        None => entity.clone(),
        Some(columns) => {
            let mut projected = entity.clone();
            projected
                .properties
                .retain(|name, _| columns.iter().any(|c| c == name));
            projected
        }
    }
}

#[async_trait]
impl TableService for MemoryTableService {
    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.table_names())
    }

    async fn create_table_if_absent(&self, table: &str) -> Result<bool> {
        let mut account = self.account();
        if account.tables.contains_key(table) {
            return Ok(false);
        }
        account.tables.insert(table.to_string(), Rows::new());
        Ok(true)
    }

    async fn delete_table_if_exists(&self, table: &str) -> Result<bool> {
        Ok(self.account().tables.remove(table).is_some())
    }

    async fn query_page(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<Continuation>,
    ) -> Result<QueryPage> {
        let mut account = self.account();
        account.queries.push(QueryRecord {
            table: table.to_string(),
            comparisons: query.filter.as_ref().map_or(0, |f| f.comparison_count()),
        });

        let rows = account
            .tables
            .get(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;

        let page_size = query
            .page_size
            .map_or(self.page_size, |size| size.min(self.page_size))
            .max(1);

        let start = continuation
            .map(|c| (c.next_partition_key, c.next_row_key.unwrap_or_default()))
            .unwrap_or_default();

        let mut matching = rows
            .range(start..)
            .map(|(_, entity)| entity)
            .filter(|entity| query.filter.as_ref().map_or(true, |f| f.matches(entity)));

        let entities: Vec<Entity> = matching
            .by_ref()
            .take(page_size)
            .map(|entity| project(entity, query.select.as_deref()))
            .collect();

        let continuation = matching.next().map(|next| Continuation {
            next_partition_key: next.partition_key.clone(),
            next_row_key: Some(next.row_key.clone()),
        });

        Ok(QueryPage {
            entities,
            continuation,
        })
    }

    async fn execute_batch(&self, table: &str, batch: &TableBatch<'_>) -> Result<()> {
        let mut account = self.account();

        if let Some(remaining) = account.fail_batches_after {
            if remaining == 0 {
                return Err(TableError::Status {
                    operation: format!("batch write to table '{}'", table),
                    status: 503,
                    code: Some("ServerBusy".to_string()),
                    message: "injected failure".to_string(),
                }
                .into());
            }
            account.fail_batches_after = Some(remaining - 1);
        }

        account.table_mut(table)?;
        let stamped: Vec<Entity> = batch
            .entities()
            .iter()
            .map(|entity| {
                let mut entity = entity.clone();
                entity.timestamp = Some(account.tick());
                entity
            })
            .collect();

        let rows = account.table_mut(table)?;
        for entity in stamped {
            rows.insert(key_of(&entity), entity);
        }

        account.batches.push(BatchRecord {
            table: table.to_string(),
            partition_key: batch.partition_key().to_string(),
            len: batch.len(),
        });

        if let Some((remaining, token)) = account.cancel_after_batches.take() {
            if remaining <= 1 {
                token.cancel();
            } else {
                account.cancel_after_batches = Some((remaining - 1, token));
            }
        }

        Ok(())
    }
}
