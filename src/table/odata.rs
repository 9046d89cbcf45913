// ABOUTME: OData wire format for the table REST protocol - filters, entity JSON, batches
// ABOUTME: Pure encode/decode helpers; the HTTP client lives in azure.rs

use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

use super::entity::{parse_special_double, Entity, EntityProperty};
use super::error::TableError;
use super::query::{Filter, FilterValue};
use super::service::TableBatch;

const TYPE_SUFFIX: &str = "@odata.type";

/// Format a timestamp the way the service stores it: 100ns precision, UTC.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    format!(
        "{}.{:07}Z",
        value.format("%Y-%m-%dT%H:%M:%S"),
        value.timestamp_subsec_nanos() / 100
    )
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a filter as an OData `$filter` expression.
pub fn render_filter(filter: &Filter) -> String {
    match filter {
        Filter::Compare { column, op, value } => {
            let literal = match value {
                FilterValue::String(s) => quote(s),
                FilterValue::DateTime(dt) => format!("datetime'{}'", format_datetime(dt)),
            };
            format!("{} {} {}", column.name(), op.keyword(), literal)
        }
        Filter::And(left, right) => {
            format!("({}) and ({})", render_filter(left), render_filter(right))
        }
        Filter::Or(left, right) => {
            format!("({}) or ({})", render_filter(left), render_filter(right))
        }
    }
}

/// Resource path segment addressing one entity, e.g. `users(PartitionKey='a',RowKey='b')`.
pub fn entity_path(table: &str, partition_key: &str, row_key: &str) -> String {
    format!(
        "{}(PartitionKey={},RowKey={})",
        table,
        quote(partition_key),
        quote(row_key)
    )
}

/// Encode an entity as a JSON request body. The timestamp is never sent.
pub fn entity_to_json(entity: &Entity) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert(
        "PartitionKey".to_string(),
        Value::String(entity.partition_key.clone()),
    );
    body.insert("RowKey".to_string(), Value::String(entity.row_key.clone()));

    for (name, property) in &entity.properties {
        let (value, annotate) = encode_property(property);
        body.insert(name.clone(), value);
        if annotate {
            body.insert(
                format!("{}{}", name, TYPE_SUFFIX),
                Value::String(property.edm_type().to_string()),
            );
        }
    }

    body
}

/// Returns the JSON value and whether it needs an explicit type annotation.
fn encode_property(property: &EntityProperty) -> (Value, bool) {
    match property {
        EntityProperty::String(s) => (Value::String(s.clone()), false),
        EntityProperty::Int32(v) => (Value::Number((*v).into()), false),
        EntityProperty::Int64(v) => (Value::String(v.to_string()), true),
        EntityProperty::Double(v) => {
            let value = match Number::from_f64(*v) {
                Some(number) => Value::Number(number),
                None if v.is_nan() => Value::String("NaN".to_string()),
                None if *v > 0.0 => Value::String("INF".to_string()),
                None => Value::String("-INF".to_string()),
            };
            (value, true)
        }
        EntityProperty::Boolean(b) => (Value::Bool(*b), false),
        EntityProperty::Binary(bytes) => (
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
            true,
        ),
        EntityProperty::Guid(id) => (Value::String(id.to_string()), true),
        EntityProperty::DateTime(dt) => (Value::String(format_datetime(dt)), true),
    }
}

/// Decode an entity from a JSON response object.
pub fn entity_from_json(object: &Map<String, Value>) -> Result<Entity> {
    let partition_key = object
        .get("PartitionKey")
        .and_then(Value::as_str)
        .ok_or_else(|| TableError::Protocol("entity without PartitionKey".to_string()))?;
    let row_key = object
        .get("RowKey")
        .and_then(Value::as_str)
        .ok_or_else(|| TableError::Protocol("entity without RowKey".to_string()))?;

    let mut entity = Entity::new(partition_key, row_key);

    for (name, value) in object {
        if name.starts_with("odata.")
            || name.ends_with(TYPE_SUFFIX)
            || name == "PartitionKey"
            || name == "RowKey"
            || value.is_null()
        {
            continue;
        }

        if name == "Timestamp" {
            let raw = value
                .as_str()
                .ok_or_else(|| TableError::Protocol("Timestamp is not a string".to_string()))?;
            entity.timestamp = Some(parse_datetime(raw)?);
            continue;
        }

        let annotation = object
            .get(&format!("{}{}", name, TYPE_SUFFIX))
            .and_then(Value::as_str);
        let property = decode_property(value, annotation)
            .with_context(|| format!("Failed to decode property '{}'", name))?;
        entity.properties.insert(name.clone(), property);
    }

    Ok(entity)
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid datetime '{}'", raw))?
        .with_timezone(&Utc))
}

fn decode_property(value: &Value, annotation: Option<&str>) -> Result<EntityProperty> {
    let as_str = || {
        value
            .as_str()
            .ok_or_else(|| TableError::Protocol(format!("expected string, got {}", value)))
    };

    let property = match annotation {
        Some("Edm.String") => EntityProperty::String(as_str()?.to_string()),
        Some("Edm.Int32") => {
            let v = value
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| TableError::Protocol(format!("invalid Int32 {}", value)))?;
            EntityProperty::Int32(v)
        }
        Some("Edm.Int64") => {
            let v = match value {
                Value::String(s) => s.parse().ok(),
                other => other.as_i64(),
            }
            .ok_or_else(|| TableError::Protocol(format!("invalid Int64 {}", value)))?;
            EntityProperty::Int64(v)
        }
        Some("Edm.Double") => {
            let v = match value {
                Value::String(s) => parse_special_double(s),
                other => other.as_f64(),
            }
            .ok_or_else(|| TableError::Protocol(format!("invalid Double {}", value)))?;
            EntityProperty::Double(v)
        }
        Some("Edm.Boolean") => EntityProperty::Boolean(
            value
                .as_bool()
                .ok_or_else(|| TableError::Protocol(format!("invalid Boolean {}", value)))?,
        ),
        Some("Edm.Binary") => EntityProperty::Binary(
            base64::engine::general_purpose::STANDARD
                .decode(as_str()?)
                .context("Invalid base64 in Binary property")?,
        ),
        Some("Edm.Guid") => {
            EntityProperty::Guid(Uuid::parse_str(as_str()?).context("Invalid Guid property")?)
        }
        Some("Edm.DateTime") => EntityProperty::DateTime(parse_datetime(as_str()?)?),
        Some(other) => {
            return Err(TableError::Protocol(format!("unsupported type {}", other)).into())
        }
        None => match value {
            Value::String(s) => EntityProperty::String(s.clone()),
            Value::Bool(b) => EntityProperty::Boolean(*b),
            Value::Number(n) => match n.as_i64() {
                Some(v) => match i32::try_from(v) {
                    Ok(small) => EntityProperty::Int32(small),
                    Err(_) => EntityProperty::Int64(v),
                },
                None => EntityProperty::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            other => {
                return Err(TableError::Protocol(format!("unsupported value {}", other)).into())
            }
        },
    };

    Ok(property)
}

/// Build the multipart body of an entity group transaction that
/// insert-or-replaces every entity of `batch`.
///
/// `entity_url` maps an entity to the absolute URL of its resource.
pub fn build_batch_body(
    batch: &TableBatch<'_>,
    batch_boundary: &str,
    changeset_boundary: &str,
    entity_url: impl Fn(&Entity) -> String,
) -> String {
    let mut body = String::new();
    body.push_str(&format!("--{}\r\n", batch_boundary));
    body.push_str(&format!(
        "Content-Type: multipart/mixed; boundary={}\r\n\r\n",
        changeset_boundary
    ));

    for entity in batch.entities() {
        let json = Value::Object(entity_to_json(entity));
        body.push_str(&format!("--{}\r\n", changeset_boundary));
        body.push_str("Content-Type: application/http\r\n");
        body.push_str("Content-Transfer-Encoding: binary\r\n\r\n");
        body.push_str(&format!("PUT {} HTTP/1.1\r\n", entity_url(entity)));
        body.push_str("Content-Type: application/json\r\n");
        body.push_str("Accept: application/json;odata=minimalmetadata\r\n");
        body.push_str("Prefer: return-no-content\r\n");
        body.push_str("DataServiceVersion: 3.0;\r\n\r\n");
        body.push_str(&json.to_string());
        body.push_str("\r\n");
    }

    body.push_str(&format!("--{}--\r\n", changeset_boundary));
    body.push_str(&format!("--{}--\r\n", batch_boundary));
    body
}

/// Check the multipart response of an entity group transaction.
///
/// The service answers a failed changeset with a single inner response
/// carrying the error, so any inner status of 300 or above fails the batch.
pub fn check_batch_response(body: &str) -> Result<(), TableError> {
    let mut saw_response = false;

    for (offset, line) in body.match_indices("HTTP/1.1 ") {
        let rest = &body[offset + line.len()..];
        let status: u16 = rest
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TableError::Protocol("malformed batch response status".to_string()))?;
        saw_response = true;

        if status >= 300 {
            let (code, message) = rest
                .find('{')
                .map(|start| parse_error_body(&rest[start..]))
                .unwrap_or((None, String::new()));
            return Err(TableError::Status {
                operation: "batch write".to_string(),
                status,
                code,
                message,
            });
        }
    }

    if saw_response {
        Ok(())
    } else {
        Err(TableError::Protocol(
            "batch response contained no operation results".to_string(),
        ))
    }
}

/// Extract the error code and message from an OData error payload.
///
/// Accepts trailing bytes after the JSON object, as found inside multipart
/// bodies.
pub fn parse_error_body(text: &str) -> (Option<String>, String) {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    let parsed = match stream.next() {
        Some(Ok(value)) => value,
        _ => return (None, text.trim().to_string()),
    };

    let error = &parsed["odata.error"];
    let code = error["code"].as_str().map(str::to_string);
    let message = error["message"]["value"]
        .as_str()
        .or_else(|| error["message"].as_str())
        .unwrap_or_default()
        .to_string();
    (code, message)
}
