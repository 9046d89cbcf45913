// ABOUTME: TableService trait - the capabilities replication needs from a table account
// ABOUTME: TableBatch enforces the single-partition, bounded-size rule of group writes

use anyhow::Result;
use async_trait::async_trait;

use super::entity::Entity;
use super::error::TableError;
use super::query::{Continuation, QueryPage, TableQuery};

/// Maximum number of operations in one entity group transaction.
pub const MAX_BATCH_SIZE: usize = 100;

/// Operations a table account must provide.
///
/// Implementations are passed explicitly to the components that use them, so
/// tests can substitute [`MemoryTableService`](super::memory::MemoryTableService).
/// Every call is a single fallible operation; retries and timeouts belong to
/// the implementation.
#[async_trait]
pub trait TableService: Send + Sync {
    /// Names of all tables in the account.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Create a table unless it already exists. Returns true if it was created.
    async fn create_table_if_absent(&self, table: &str) -> Result<bool>;

    /// Delete a table if it exists. Returns true if it was deleted.
    async fn delete_table_if_exists(&self, table: &str) -> Result<bool>;

    /// Fetch one page of a query, starting at `continuation` if given.
    async fn query_page(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<Continuation>,
    ) -> Result<QueryPage>;

    /// Insert-or-replace every entity of the batch as one atomic operation.
    ///
    /// The write is unconditional: no ETag check, last writer wins.
    async fn execute_batch(&self, table: &str, batch: &TableBatch<'_>) -> Result<()>;
}

/// A group of entities written atomically.
///
/// Only constructible with 1..=[`MAX_BATCH_SIZE`] entities sharing one
/// partition key.
#[derive(Debug, Clone, Copy)]
pub struct TableBatch<'a> {
    partition_key: &'a str,
    entities: &'a [Entity],
}

impl<'a> TableBatch<'a> {
    pub fn new(entities: &'a [Entity]) -> Result<Self, TableError> {
        let first = entities
            .first()
            .ok_or_else(|| TableError::InvalidBatch("batch is empty".to_string()))?;

        if entities.len() > MAX_BATCH_SIZE {
            return Err(TableError::InvalidBatch(format!(
                "batch has {} entities, limit is {}",
                entities.len(),
                MAX_BATCH_SIZE
            )));
        }

        if let Some(other) = entities
            .iter()
            .find(|e| e.partition_key != first.partition_key)
        {
            return Err(TableError::InvalidBatch(format!(
                "batch spans partition keys '{}' and '{}'",
                first.partition_key, other.partition_key
            )));
        }

        Ok(Self {
            partition_key: &first.partition_key,
            entities,
        })
    }

    pub fn partition_key(&self) -> &'a str {
        self.partition_key
    }

    pub fn entities(&self) -> &'a [Entity] {
        self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(partition: &str, count: usize) -> Vec<Entity> {
        (0..count)
            .map(|i| Entity::new(partition, format!("r{:03}", i)))
            .collect()
    }

    #[test]
    fn test_batch_accepts_single_partition() {
        let entities = rows("p1", 100);
        let batch = TableBatch::new(&entities).unwrap();
        assert_eq!(batch.partition_key(), "p1");
        assert_eq!(batch.len(), 100);
    }

    #[test]
    fn test_batch_rejects_empty() {
        assert!(matches!(
            TableBatch::new(&[]),
            Err(TableError::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_batch_rejects_oversize() {
        let entities = rows("p1", 101);
        let err = TableBatch::new(&entities).unwrap_err();
        assert!(err.to_string().contains("101"));
    }

    #[test]
    fn test_batch_rejects_mixed_partitions() {
        let mut entities = rows("p1", 2);
        entities.push(Entity::new("p2", "x"));
        let err = TableBatch::new(&entities).unwrap_err();
        assert!(err.to_string().contains("'p1' and 'p2'"));
    }
}
