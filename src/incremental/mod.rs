// ABOUTME: Timestamp-based incremental replication between table accounts
// ABOUTME: Watermarks on the destination track how far each source table has been copied

pub mod orchestrator;
pub mod reader;
pub mod watermark;
pub mod writer;

pub use orchestrator::{
    SyncEvent, SyncOrchestrator, SyncOutcome, SyncPhase, SyncReport, TableSyncReport,
};
pub use reader::ChangeReader;
pub use watermark::{WatermarkStore, Watermarks, WATERMARK_PARTITION, WATERMARK_PROPERTY};
pub use writer::{chunk_rows, BatchReplicator, WriteReport};
