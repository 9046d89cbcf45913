// ABOUTME: One-shot export/import of whole tables to and from a directory of JSON files
// ABOUTME: Both directions reconcile the table set with the planner before moving rows

pub mod export;
pub mod format;
pub mod import;

use std::collections::BTreeMap;

pub use export::Exporter;
pub use format::{archive_path, list_archived_tables, read_archive, write_archive, TableArchive};
pub use import::Importer;

/// What an export or import changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub tables_created: Vec<String>,
    pub tables_deleted: Vec<String>,
    /// Rows copied per table
    pub rows: BTreeMap<String, usize>,
}

impl ArchiveReport {
    pub fn total_rows(&self) -> usize {
        self.rows.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Completed(ArchiveReport),
    Cancelled,
}
