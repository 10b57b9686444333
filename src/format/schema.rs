//! Schema definition and index-column typing

use crate::{MindRecordError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Declared type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bytes,
}

impl FieldType {
    /// Whether the type belongs to the numeric set. Numeric criteria
    /// values are interpolated into SQL unquoted; everything else is
    /// bound as a parameter.
    pub fn is_number(&self) -> bool {
        matches!(
            self,
            FieldType::Int32 | FieldType::Int64 | FieldType::Float32 | FieldType::Float64
        )
    }

    /// Cast an index-column cell (always text at the query layer) to a
    /// typed JSON value. NULL cells arrive as empty strings and map to
    /// JSON null; any other parse failure is fatal to the task.
    pub fn cast(&self, raw: &str) -> Result<Value> {
        if raw.is_empty() && self.is_number() {
            return Ok(Value::Null);
        }
        let parse_err = |kind: &str| {
            MindRecordError::Decode(format!("invalid {} literal in index column: {:?}", kind, raw))
        };
        match self {
            FieldType::Int32 => raw
                .parse::<i32>()
                .map(Value::from)
                .map_err(|_| parse_err("int32")),
            FieldType::Int64 => raw
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| parse_err("int64")),
            FieldType::Float32 => raw
                .parse::<f32>()
                .map(Value::from)
                .map_err(|_| parse_err("float32")),
            FieldType::Float64 => raw
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| parse_err("float64")),
            FieldType::String | FieldType::Bytes => Ok(Value::from(raw)),
        }
    }
}

/// One dataset schema: a field map plus the names of blob fields whose
/// payloads live in BLOB pages rather than label records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub id: u64,
    pub fields: BTreeMap<String, FieldType>,
    #[serde(default)]
    pub blob_fields: Vec<String>,
}

impl Schema {
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        self.fields.get(field).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_set() {
        assert!(FieldType::Int32.is_number());
        assert!(FieldType::Float64.is_number());
        assert!(!FieldType::String.is_number());
        assert!(!FieldType::Bytes.is_number());
    }

    #[test]
    fn test_cast() {
        assert_eq!(FieldType::Int32.cast("12").unwrap(), json!(12));
        assert_eq!(FieldType::Int64.cast("-7").unwrap(), json!(-7));
        assert_eq!(FieldType::Float64.cast("1.5").unwrap(), json!(1.5));
        assert_eq!(FieldType::String.cast("cat").unwrap(), json!("cat"));
    }

    #[test]
    fn test_cast_null_cell() {
        assert_eq!(FieldType::Int64.cast("").unwrap(), Value::Null);
        assert_eq!(FieldType::String.cast("").unwrap(), json!(""));
    }

    #[test]
    fn test_cast_failure_is_fatal() {
        assert!(FieldType::Int32.cast("not-a-number").is_err());
        assert!(FieldType::Float32.cast("1.2.3").is_err());
    }

    #[test]
    fn test_field_type_names() {
        let schema: Schema = serde_json::from_value(json!({
            "id": 0,
            "fields": {"label": "int64", "text": "string", "data": "bytes"},
            "blob_fields": ["data"]
        }))
        .unwrap();
        assert_eq!(schema.field_type("label"), Some(FieldType::Int64));
        assert_eq!(schema.field_type("text"), Some(FieldType::String));
        assert!(schema.contains("data"));
        assert!(!schema.contains("missing"));
    }
}
