// ABOUTME: HTTP client for the Azure Table REST API implementing TableService
// ABOUTME: Authenticates with a SAS token and speaks JSON/OData plus $batch changesets

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use url::Url;

use super::error::TableError;
use super::odata;
use super::query::{Continuation, QueryPage, TableQuery};
use super::service::{TableBatch, TableService};
use crate::config::AccountConfig;

const API_VERSION: &str = "2019-02-02";
const DATA_SERVICE_VERSION: &str = "3.0;NetFx";
const FULL_METADATA: &str = "application/json;odata=fullmetadata";
const NO_METADATA: &str = "application/json;odata=nometadata";

const NEXT_TABLE_NAME: &str = "x-ms-continuation-NextTableName";
const NEXT_PARTITION_KEY: &str = "x-ms-continuation-NextPartitionKey";
const NEXT_ROW_KEY: &str = "x-ms-continuation-NextRowKey";

#[derive(Deserialize)]
struct TableList {
    value: Vec<TableEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TableEntry {
    table_name: String,
}

#[derive(Deserialize)]
struct EntityList {
    value: Vec<Map<String, Value>>,
}

/// Table service of one storage account, reached over HTTPS.
pub struct AzureTableService {
    client: Client,
    endpoint: Url,
    sas_token: Option<String>,
}

impl AzureTableService {
    pub fn new(account: &AccountConfig, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(&account.endpoint)
            .with_context(|| format!("Invalid table endpoint '{}'", account.endpoint))?;
        if endpoint.cannot_be_a_base() {
            anyhow::bail!("Table endpoint '{}' is not a base URL", account.endpoint);
        }

        let mut headers = HeaderMap::new();
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));
        headers.insert(
            "DataServiceVersion",
            HeaderValue::from_static(DATA_SERVICE_VERSION),
        );
        headers.insert(
            "MaxDataServiceVersion",
            HeaderValue::from_static(DATA_SERVICE_VERSION),
        );

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            sas_token: account
                .sas_token
                .as_ref()
                .map(|t| t.trim_start_matches('?').to_string())
                .filter(|t| !t.is_empty()),
        })
    }

    /// Account URL with `segment` appended and the SAS token as query string.
    fn url_for(&self, segment: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Table endpoint is not a base URL"))?
            .pop_if_empty()
            .push(segment);
        url.set_query(self.sas_token.as_deref());
        Ok(url)
    }

    /// Absolute URL of an entity, without credentials, as used inside batches.
    fn entity_url(&self, table: &str, partition_key: &str, row_key: &str) -> String {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push(&odata::entity_path(table, partition_key, row_key));
        }
        url.set_query(None);
        url.to_string()
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("x-ms-date", httpdate_now())
    }

    async fn status_error(response: Response, operation: String) -> TableError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let (code, message) = odata::parse_error_body(&body);
        TableError::Status {
            operation,
            status,
            code,
            message,
        }
    }
}

fn httpdate_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn header_str(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl TableService for AzureTableService {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut tables = Vec::new();
        let mut next_table: Option<String> = None;

        loop {
            let mut url = self.url_for("Tables")?;
            if let Some(ref next) = next_table {
                url.query_pairs_mut().append_pair("NextTableName", next);
            }

            let response = self
                .request(Method::GET, url)
                .header(ACCEPT, NO_METADATA)
                .send()
                .await
                .map_err(reqwest::Error::without_url)
                .context("Failed to list tables")?;

            if !response.status().is_success() {
                return Err(Self::status_error(response, "list tables".to_string())
                    .await
                    .into());
            }

            next_table = header_str(&response, NEXT_TABLE_NAME);
            let page: TableList = response
                .json()
                .await
                .map_err(reqwest::Error::without_url)
                .context("Failed to parse table list")?;
            tables.extend(page.value.into_iter().map(|t| t.table_name));

            if next_table.is_none() {
                break;
            }
        }

        Ok(tables)
    }

    async fn create_table_if_absent(&self, table: &str) -> Result<bool> {
        let response = self
            .request(Method::POST, self.url_for("Tables")?)
            .header(ACCEPT, NO_METADATA)
            .header("Prefer", "return-no-content")
            .json(&serde_json::json!({ "TableName": table }))
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Failed to create table '{}'", table))?;

        match response.status() {
            StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(true),
            StatusCode::CONFLICT => Ok(false),
            _ => Err(Self::status_error(response, format!("create table '{}'", table))
                .await
                .into()),
        }
    }

    async fn delete_table_if_exists(&self, table: &str) -> Result<bool> {
        let segment = format!("Tables('{}')", table.replace('\'', "''"));
        let response = self
            .request(Method::DELETE, self.url_for(&segment)?)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Failed to delete table '{}'", table))?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::status_error(response, format!("delete table '{}'", table))
                .await
                .into()),
        }
    }

    async fn query_page(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<Continuation>,
    ) -> Result<QueryPage> {
        let mut url = self.url_for(&format!("{}()", table))?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(ref filter) = query.filter {
                pairs.append_pair("$filter", &odata::render_filter(filter));
            }
            if let Some(ref columns) = query.select {
                let mut all = vec!["PartitionKey", "RowKey", "Timestamp"];
                all.extend(columns.iter().map(String::as_str));
                pairs.append_pair("$select", &all.join(","));
            }
            if let Some(size) = query.page_size {
                pairs.append_pair("$top", &size.to_string());
            }
            if let Some(ref next) = continuation {
                pairs.append_pair("NextPartitionKey", &next.next_partition_key);
                if let Some(ref row_key) = next.next_row_key {
                    pairs.append_pair("NextRowKey", row_key);
                }
            }
        }

        let response = self
            .request(Method::GET, url)
            .header(ACCEPT, FULL_METADATA)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Failed to query table '{}'", table))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(TableError::TableNotFound(table.to_string()).into());
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response, format!("query table '{}'", table))
                .await
                .into());
        }

        let continuation =
            header_str(&response, NEXT_PARTITION_KEY).map(|next_partition_key| Continuation {
                next_partition_key,
                next_row_key: header_str(&response, NEXT_ROW_KEY),
            });

        let list: EntityList = response
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Failed to parse rows of table '{}'", table))?;

        let entities = list
            .value
            .iter()
            .map(odata::entity_from_json)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Failed to decode rows of table '{}'", table))?;

        Ok(QueryPage {
            entities,
            continuation,
        })
    }

    async fn execute_batch(&self, table: &str, batch: &TableBatch<'_>) -> Result<()> {
        let batch_boundary = format!("batch_{}", uuid::Uuid::new_v4());
        let changeset_boundary = format!("changeset_{}", uuid::Uuid::new_v4());
        let body = odata::build_batch_body(batch, &batch_boundary, &changeset_boundary, |e| {
            self.entity_url(table, &e.partition_key, &e.row_key)
        });

        let response = self
            .request(Method::POST, self.url_for("$batch")?)
            .header(
                CONTENT_TYPE,
                format!("multipart/mixed; boundary={}", batch_boundary),
            )
            .header(ACCEPT, NO_METADATA)
            .body(body)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| {
                format!(
                    "Failed to send batch of {} rows to table '{}'",
                    batch.len(),
                    table
                )
            })?;

        if !response.status().is_success() {
            return Err(Self::status_error(
                response,
                format!("batch write to table '{}'", table),
            )
            .await
            .into());
        }

        let text = response
            .text()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to read batch response")?;
        odata::check_batch_response(&text).with_context(|| {
            format!(
                "Batch of {} rows for partition '{}' in table '{}' was rejected",
                batch.len(),
                batch.partition_key(),
                table
            )
        })?;

        Ok(())
    }
}
