// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::codec;
use crate::errors::{EncodingError, IngestError};
use reqwest::Url;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// Field holding the destination table, stamped on records when the caller names one.
pub const TABLE_FIELD: &str = "@table";

/// One ingestion record: an ordered mapping of field names to JSON values.
///
/// A record is validated against the codec on construction and never changes after it is
/// submitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new(fields: Map<String, Value>) -> Result<Self, EncodingError> {
        codec::validate(&fields)?;
        Ok(Self(fields))
    }

    pub fn from_value(value: Value) -> Result<Self, EncodingError> {
        match value {
            Value::Object(fields) => Self::new(fields),
            other => Err(EncodingError::NotAnObject(value_kind(&other))),
        }
    }

    /// Builds a record from anything serde can turn into a JSON object.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, EncodingError> {
        let value =
            serde_json::to_value(value).map_err(|e| EncodingError::Serialize(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    /// Returns the record with `@table` set, unless it already names a table.
    pub fn with_table(mut self, table: &str) -> Self {
        if !self.0.contains_key(TABLE_FIELD) {
            self.0
                .insert(TABLE_FIELD.to_string(), Value::String(table.to_string()));
        }
        self
    }
}

impl TryFrom<Value> for Record {
    type Error = EncodingError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Identifies one submitted record for the lifetime of an ingester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub(crate) u64);

impl RecordId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Destination of a record: an http(s) endpoint plus an optional collection id.
///
/// Records are only batched together when both parts are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    url: Url,
    collection_id: Option<String>,
}

impl Target {
    pub fn new(url: &str, collection_id: Option<&str>) -> Result<Self, IngestError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(IngestError::Configuration(
                "target has not been provided. Most likely it has been mis-configured".to_string(),
            ));
        }
        let url = Url::parse(trimmed).map_err(|e| {
            IngestError::Configuration(format!("target '{trimmed}' is not a valid URL: {e}"))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(IngestError::Configuration(format!(
                "target '{trimmed}' must use http or https, got '{}'",
                url.scheme()
            )));
        }
        let collection_id = collection_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        Ok(Self { url, collection_id })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn collection_id(&self) -> Option<&str> {
        self.collection_id.as_deref()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.collection_id {
            Some(id) => write!(f, "{} [{}]", self.url, id),
            None => write!(f, "{}", self.url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_record_from_object_keeps_field_order() {
        let record = Record::from_value(json!({"@table": "t", "@id": "1", "a": 1})).unwrap();
        let keys: Vec<&String> = record.fields().keys().collect();
        assert_eq!(keys, vec!["@table", "@id", "a"]);
    }

    #[test]
    fn test_record_rejects_non_objects() {
        assert_eq!(
            Record::from_value(json!([1, 2])),
            Err(EncodingError::NotAnObject("array"))
        );
        assert_eq!(
            Record::from_value(json!("text")),
            Err(EncodingError::NotAnObject("string"))
        );
        assert!(Record::try_from(Value::Null).is_err());
    }

    #[test]
    fn test_record_from_serialize_rejects_non_string_keys() {
        let mut map = HashMap::new();
        map.insert((1, 2), "value");
        let err = Record::from_serialize(&map).unwrap_err();
        assert!(matches!(err, EncodingError::Serialize(_)));
    }

    #[test]
    fn test_record_from_serialize_struct() {
        #[derive(Serialize)]
        struct Row {
            first: &'static str,
            second: u32,
        }
        let record = Record::from_serialize(&Row {
            first: "two",
            second: 2,
        })
        .unwrap();
        assert_eq!(record.get("first"), Some(&json!("two")));
        assert_eq!(record.len(), 2);
    }

    #[test]
    fn test_with_table_does_not_override() {
        let record = Record::from_value(json!({"a": 1})).unwrap().with_table("t1");
        assert_eq!(record.get(TABLE_FIELD), Some(&json!("t1")));

        let record = record.with_table("t2");
        assert_eq!(record.get(TABLE_FIELD), Some(&json!("t1")));
    }

    #[test]
    fn test_target_requires_url() {
        assert!(matches!(
            Target::new("", None),
            Err(IngestError::Configuration(_))
        ));
        assert!(matches!(
            Target::new("   ", None),
            Err(IngestError::Configuration(_))
        ));
        assert!(matches!(
            Target::new("not a url", None),
            Err(IngestError::Configuration(_))
        ));
        assert!(matches!(
            Target::new("ftp://example.com/data", None),
            Err(IngestError::Configuration(_))
        ));
    }

    #[test]
    fn test_target_collection_id_is_part_of_identity() {
        let a = Target::new("http://example.com/data-source", Some("c1")).unwrap();
        let b = Target::new("http://example.com/data-source", Some(" c1 ")).unwrap();
        let c = Target::new("http://example.com/data-source", None).unwrap();
        let d = Target::new("http://example.com/data-source", Some("")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(c, d);
        assert_eq!(a.collection_id(), Some("c1"));
        assert_eq!(a.to_string(), "http://example.com/data-source [c1]");
    }
}
