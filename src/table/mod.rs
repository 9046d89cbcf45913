// ABOUTME: Table storage abstraction - entity model, queries and service backends
// ABOUTME: Backends: Azure Table REST (azure) and an in-memory account (memory)

pub mod azure;
pub mod entity;
pub mod error;
pub mod memory;
pub mod odata;
pub mod query;
pub mod service;

pub use azure::AzureTableService;
pub use entity::{min_timestamp, Entity, EntityProperty};
pub use error::TableError;
pub use memory::MemoryTableService;
pub use query::{Column, CompareOp, Continuation, Filter, FilterValue, QueryPage, TableQuery};
pub use service::{TableBatch, TableService, MAX_BATCH_SIZE};
