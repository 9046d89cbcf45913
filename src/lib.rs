// ABOUTME: Library root for table-replicator
// ABOUTME: Incremental sync, archive export/import and the table service backends

pub mod archive;
pub mod config;
pub mod incremental;
pub mod plan;
pub mod table;
pub mod utils;

pub use config::{AccountConfig, PersistPolicy, ReplicatorConfig, SyncSettings};
pub use incremental::{SyncOrchestrator, SyncOutcome, SyncReport};
pub use table::{AzureTableService, MemoryTableService, TableService};
