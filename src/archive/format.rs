// ABOUTME: Archive file format - one JSON document per table in a directory
// ABOUTME: Table_<name>.json holds {"Meta":{"version":"1.0"},"Data":[entities...]}

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::table::Entity;

pub const FILE_PREFIX: &str = "Table_";
pub const FILE_EXTENSION: &str = "json";
pub const ARCHIVE_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub version: String,
}

/// Contents of one table archive file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TableArchive {
    pub meta: ArchiveMeta,
    #[serde(default)]
    pub data: Vec<Entity>,
}

impl TableArchive {
    /// Archive of `rows`, sorted by partition key then row key.
    pub fn new(mut rows: Vec<Entity>) -> Self {
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        Self {
            meta: ArchiveMeta {
                version: ARCHIVE_VERSION.to_string(),
            },
            data: rows,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

/// `<dir>/Table_<table>.json`
pub fn archive_path(dir: &Path, table: &str) -> PathBuf {
    dir.join(format!("{}{}.{}", FILE_PREFIX, table, FILE_EXTENSION))
}

/// Table name encoded in an archive file name, if it is one.
pub fn table_from_file_name(file_name: &str) -> Option<&str> {
    let table = file_name
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_EXTENSION)?
        .strip_suffix('.')?;
    (!table.is_empty()).then_some(table)
}

/// Names of the tables archived in `dir`, sorted. A missing directory holds none.
pub async fn list_archived_tables(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to list archive directory {:?}", dir))
        }
    };

    let mut tables = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to list archive directory {:?}", dir))?
    {
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("Failed to inspect {:?}", entry.path()))?;
        if !file_type.is_file() {
            continue;
        }
        if let Some(table) = entry.file_name().to_str().and_then(table_from_file_name) {
            tables.push(table.to_string());
        }
    }

    tables.sort();
    Ok(tables)
}

/// Read an archive file. A zero-length file reads as an empty archive.
pub async fn read_archive(path: &Path) -> Result<TableArchive> {
    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read archive {:?}", path))?;

    if contents.trim().is_empty() {
        return Ok(TableArchive::empty());
    }

    let archive: TableArchive = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse archive {:?}", path))?;
    if archive.meta.version != ARCHIVE_VERSION {
        bail!(
            "Archive {:?} has unsupported version '{}' (expected '{}')",
            path,
            archive.meta.version,
            ARCHIVE_VERSION
        );
    }
    Ok(archive)
}

/// Write an archive file, replacing any previous content.
pub async fn write_archive(path: &Path, archive: &TableArchive) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let contents = serde_json::to_string_pretty(archive).context("Failed to serialize archive")?;
    fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write archive {:?}", path))?;
    Ok(())
}

/// Delete an archive file. Returns false if it did not exist.
pub async fn remove_archive(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to delete archive {:?}", path)),
    }
}
