// ABOUTME: Replicator configuration - accounts and sync settings loaded from TOML
// ABOUTME: CLI flags override file values; validate() rejects fatal misconfiguration

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::table::MAX_BATCH_SIZE;
use crate::utils::{redact_sas, validate_table_name};

/// Default name of the destination table holding per-table watermarks.
pub const DEFAULT_METADATA_TABLE: &str = "aaareplicatormeta";

/// How to reach one table account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Table endpoint, e.g. `https://myaccount.table.core.windows.net`
    pub endpoint: String,
    /// Shared access signature query string, passed through verbatim
    #[serde(default)]
    pub sas_token: Option<String>,
}

impl AccountConfig {
    pub fn new(endpoint: impl Into<String>, sas_token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            sas_token,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.endpoint)
            .with_context(|| format!("Invalid endpoint '{}'", redact_sas(&self.endpoint)))?;
        if url.scheme() != "https" && url.scheme() != "http" {
            bail!(
                "Endpoint '{}' must use http or https",
                redact_sas(&self.endpoint)
            );
        }
        Ok(())
    }

    /// Endpoint safe to print: any signature in it is masked.
    pub fn describe(&self) -> String {
        redact_sas(&self.endpoint)
    }
}

/// When watermarks are written to the metadata table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PersistPolicy {
    /// Once, after every table has been attempted
    #[default]
    AfterRun,
    /// After each table's rows have been written
    PerTable,
}

/// Settings of the incremental sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Destination table holding the watermarks
    pub metadata_table: String,
    /// Rows per group write, at most 100
    pub batch_size: usize,
    pub persist: PersistPolicy,
    /// Per-request timeout of the HTTP client
    pub request_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            metadata_table: DEFAULT_METADATA_TABLE.to_string(),
            batch_size: MAX_BATCH_SIZE,
            persist: PersistPolicy::AfterRun,
            request_timeout_secs: 30,
        }
    }
}

impl SyncSettings {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            bail!(
                "batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE,
                self.batch_size
            );
        }
        validate_table_name(&self.metadata_table).context("Invalid metadata_table")?;
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Contents of `config.toml`.
///
/// ```toml
/// [source]
/// endpoint = "https://src.table.core.windows.net"
/// sas_token = "sv=...&sig=..."
///
/// [destination]
/// endpoint = "https://dst.table.core.windows.net"
///
/// [sync]
/// persist = "per_table"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    #[serde(default)]
    pub source: Option<AccountConfig>,
    #[serde(default)]
    pub destination: Option<AccountConfig>,
    #[serde(default)]
    pub sync: SyncSettings,
}

impl ReplicatorConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse replicator configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {:?}", path))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid configuration in {:?}", path))
    }

    /// Load `path` if given, else the default file if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// `~/.table-replicator/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".table-replicator").join("config.toml"))
    }

    /// Source account, failing with a hint when it is not configured.
    pub fn require_source(&self) -> Result<&AccountConfig> {
        let account = self.source.as_ref().ok_or_else(|| {
            anyhow::anyhow!("Source account not configured. Use `--source` or [source] in the config file.")
        })?;
        account.validate().context("Invalid source account")?;
        Ok(account)
    }

    /// Destination account, failing with a hint when it is not configured.
    pub fn require_destination(&self) -> Result<&AccountConfig> {
        let account = self.destination.as_ref().ok_or_else(|| {
            anyhow::anyhow!("Destination account not configured. Use `--destination` or [destination] in the config file.")
        })?;
        account.validate().context("Invalid destination account")?;
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sync_settings_default() {
        let settings = SyncSettings::default();
        assert_eq!(settings.metadata_table, "aaareplicatormeta");
        assert_eq!(settings.batch_size, 100);
        assert_eq!(settings.persist, PersistPolicy::AfterRun);
        assert_eq!(settings.request_timeout(), Duration::from_secs(30));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = ReplicatorConfig::from_toml(
            r#"
            [source]
            endpoint = "https://src.table.core.windows.net"
            sas_token = "sv=2019&sig=abc"

            [destination]
            endpoint = "http://127.0.0.1:10002/devstoreaccount1"

            [sync]
            persist = "per_table"
            batch_size = 50
            "#,
        )
        .unwrap();

        assert_eq!(
            config.source.as_ref().unwrap().sas_token.as_deref(),
            Some("sv=2019&sig=abc")
        );
        assert!(config.destination.as_ref().unwrap().sas_token.is_none());
        assert_eq!(config.sync.persist, PersistPolicy::PerTable);
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.sync.metadata_table, DEFAULT_METADATA_TABLE);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ReplicatorConfig::from_toml("").unwrap();
        assert_eq!(config, ReplicatorConfig::default());
        assert!(config.require_source().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_batch_size() {
        for batch_size in [0, 101] {
            let settings = SyncSettings {
                batch_size,
                ..SyncSettings::default()
            };
            assert!(settings.validate().is_err());
        }
    }

    #[test]
    fn test_validate_rejects_bad_metadata_table() {
        let settings = SyncSettings {
            metadata_table: "1-bad".to_string(),
            ..SyncSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_account_validation() {
        assert!(AccountConfig::new("https://a.table.core.windows.net", None)
            .validate()
            .is_ok());
        assert!(AccountConfig::new("ftp://a", None).validate().is_err());
        assert!(AccountConfig::new("nope", None).validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[sync]\nmetadata_table = \"mymeta\"\n").unwrap();

        let config = ReplicatorConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.sync.metadata_table, "mymeta");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempdir().unwrap();
        assert!(ReplicatorConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
