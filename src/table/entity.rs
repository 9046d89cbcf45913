// ABOUTME: Entity model for table storage rows - keys, typed properties and timestamp
// ABOUTME: Typed values are a closed enum so rows round-trip without reflection

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Earliest timestamp the table service can represent.
///
/// Used as the watermark of a table that has never been synced: every row's
/// timestamp is strictly greater than it.
pub fn min_timestamp() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1601, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A typed property value.
///
/// Mirrors the EDM types supported by the table service. `Int32` and `Int64`
/// are kept apart so a value read from one account is written back with the
/// same wire type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum EntityProperty {
    String(String),
    Int32(i32),
    Int64(i64),
    Double(#[serde(with = "double_repr")] f64),
    Boolean(bool),
    Binary(#[serde(with = "base64_repr")] Vec<u8>),
    Guid(Uuid),
    DateTime(DateTime<Utc>),
}

impl EntityProperty {
    /// EDM type name used on the wire, e.g. `Edm.Int64`.
    pub fn edm_type(&self) -> &'static str {
        match self {
            EntityProperty::String(_) => "Edm.String",
            EntityProperty::Int32(_) => "Edm.Int32",
            EntityProperty::Int64(_) => "Edm.Int64",
            EntityProperty::Double(_) => "Edm.Double",
            EntityProperty::Boolean(_) => "Edm.Boolean",
            EntityProperty::Binary(_) => "Edm.Binary",
            EntityProperty::Guid(_) => "Edm.Guid",
            EntityProperty::DateTime(_) => "Edm.DateTime",
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            EntityProperty::DateTime(value) => Some(*value),
            _ => None,
        }
    }
}

/// A single row of a table.
///
/// `timestamp` is assigned by the service on every write. It is populated on
/// rows read from a service and ignored by services on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Entity {
    pub partition_key: String,
    pub row_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub properties: BTreeMap<String, EntityProperty>,
}

impl Entity {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            timestamp: None,
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, name: impl Into<String>, value: EntityProperty) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn property(&self, name: &str) -> Option<&EntityProperty> {
        self.properties.get(name)
    }

    /// Primary key of the row within its table.
    pub fn key(&self) -> (&str, &str) {
        (&self.partition_key, &self.row_key)
    }
}

/// Doubles are written as JSON numbers; NaN and infinities have no JSON
/// number form and are written as the strings the table service uses.
mod double_repr {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() && value.is_sign_positive() {
            serializer.serialize_str("INF")
        } else if value.is_infinite() {
            serializer.serialize_str("-INF")
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        struct DoubleVisitor;

        impl<'de> Visitor<'de> for DoubleVisitor {
            type Value = f64;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a number or one of \"NaN\", \"INF\", \"-INF\"")
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
                Ok(v)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
                Ok(v as f64)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
                Ok(v as f64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
                super::parse_special_double(v)
                    .ok_or_else(|| E::custom(format!("invalid double '{}'", v)))
            }
        }

        deserializer.deserialize_any(DoubleVisitor)
    }
}

mod base64_repr {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Parse a double from its string form, accepting the service's spellings of
/// the non-finite values.
pub(crate) fn parse_special_double(value: &str) -> Option<f64> {
    match value {
        "NaN" => Some(f64::NAN),
        "INF" | "Infinity" => Some(f64::INFINITY),
        "-INF" | "-Infinity" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}
