// ABOUTME: Validation and display helpers shared by the CLI and the sync engine
// ABOUTME: Table name rules, account identity checks and SAS redaction for logs

use anyhow::{bail, Context, Result};

use crate::config::AccountConfig;

/// Validate a table name against the table service naming rules
///
/// Table names are 3 to 63 characters long, alphanumeric only, and must not
/// start with a digit.
///
/// # Examples
///
/// ```
/// # use table_replicator::utils::validate_table_name;
/// assert!(validate_table_name("customers").is_ok());
/// assert!(validate_table_name("Orders2024").is_ok());
///
/// assert!(validate_table_name("1orders").is_err());
/// assert!(validate_table_name("my-table").is_err());
/// assert!(validate_table_name("ab").is_err());
/// ```
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("Table name cannot be empty or whitespace-only");
    }

    let len = name.chars().count();
    if !(3..=63).contains(&len) {
        bail!(
            "Table name '{}' must be between 3 and 63 characters (got {})",
            sanitize_identifier(name),
            len
        );
    }

    let starts_with_letter = name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false);
    if !starts_with_letter {
        bail!(
            "Table name '{}' must start with a letter",
            sanitize_identifier(name)
        );
    }

    for (i, c) in name.chars().enumerate() {
        if !c.is_ascii_alphanumeric() {
            bail!(
                "Table name '{}' contains invalid character '{}' at position {}. \
                 Only letters and digits are allowed",
                sanitize_identifier(name),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            );
        }
    }

    Ok(())
}

/// Sanitize an identifier (table name, partition key) for display
///
/// Removes control characters and limits length to 100 characters so that
/// keys coming from the service cannot inject into log lines.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Mask the signature of a SAS token or URL
///
/// ```
/// # use table_replicator::utils::redact_sas;
/// assert_eq!(
///     redact_sas("https://a.table.core.windows.net/?sv=2019&sig=abc%2B"),
///     "https://a.table.core.windows.net/?sv=2019&sig=***"
/// );
/// assert_eq!(redact_sas("sv=2019&se=2030"), "sv=2019&se=2030");
/// ```
pub fn redact_sas(value: &str) -> String {
    let (prefix, query) = match value.find('?') {
        Some(idx) => (&value[..=idx], &value[idx + 1..]),
        None => ("", value),
    };

    let redacted: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if key.eq_ignore_ascii_case("sig") => format!("{}=***", key),
            _ => pair.to_string(),
        })
        .collect();

    format!("{}{}", prefix, redacted.join("&"))
}

/// Refuse to replicate an account onto itself
///
/// Compares scheme, host, port and path of both endpoints, ignoring any
/// trailing slash and query string.
pub fn validate_source_destination_different(
    source: &AccountConfig,
    destination: &AccountConfig,
) -> Result<()> {
    let source_url = url::Url::parse(&source.endpoint)
        .with_context(|| format!("Failed to parse source endpoint: {}", source.describe()))?;
    let destination_url = url::Url::parse(&destination.endpoint).with_context(|| {
        format!(
            "Failed to parse destination endpoint: {}",
            destination.describe()
        )
    })?;

    let same = source_url.scheme() == destination_url.scheme()
        && source_url.host_str() == destination_url.host_str()
        && source_url.port_or_known_default() == destination_url.port_or_known_default()
        && source_url.path().trim_end_matches('/') == destination_url.path().trim_end_matches('/');

    if same {
        bail!(
            "Source and destination point to the same table account!\n\
             \n\
             Replicating onto the source would overwrite its rows with themselves\n\
             and store watermarks next to the data being read.\n\
             \n\
             Source:      {}\n\
             Destination: {}",
            source.describe(),
            destination.describe()
        );
    }

    Ok(())
}
