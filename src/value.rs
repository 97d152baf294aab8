//! Untyped column values and the coercion rules a shard applies to them
//! before a batch is submitted (spec §4.2 step 2, §6 "Batch record format").
//!
//! Real parameter-type coercion is an external collaborator (spec §1); this
//! module implements just enough of it — a small, declared set of column
//! types and a `coerce` function — to exercise the shard's per-row failure
//! path without pulling in a full SQL type system.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Raw, untyped value as supplied by the caller through `BulkLoader::insert`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
}

/// Declared type of a column, used both for partition-key coercion (§4.1)
/// and per-row coercion during drain (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    Decimal,
    Text,
    Timestamp,
    Bytes,
}

#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    pub name: &'static str,
    pub ty: ColumnType,
}

impl ColumnDescriptor {
    pub const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self { name, ty }
    }
}

/// Coerce `value` to `ty`, following the same rules regardless of whether
/// it's being used as a partition key (§4.1) or a batch column (§4.2).
///
/// `Value::Null` always coerces successfully to `Value::Null` — the
/// database client, not this crate, is responsible for rejecting NULLs in
/// non-nullable columns.
pub fn coerce(value: &Value, ty: ColumnType) -> Result<Value, String> {
    if matches!(value, Value::Null) {
        return Ok(Value::Null);
    }

    match (ty, value) {
        (ColumnType::Bool, Value::Bool(b)) => Ok(Value::Bool(*b)),
        (ColumnType::Bool, Value::Int(i)) => Ok(Value::Bool(*i != 0)),

        (ColumnType::Int, Value::Int(i)) => Ok(Value::Int(*i)),
        (ColumnType::Int, Value::Float(f)) if f.fract() == 0.0 => Ok(Value::Int(*f as i64)),
        (ColumnType::Int, Value::Text(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("'{s}' is not an integer")),

        (ColumnType::Float, Value::Float(f)) => Ok(Value::Float(*f)),
        (ColumnType::Float, Value::Int(i)) => Ok(Value::Float(*i as f64)),
        (ColumnType::Float, Value::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| format!("'{s}' is not a float")),

        (ColumnType::Decimal, Value::Decimal(d)) => Ok(Value::Decimal(*d)),
        (ColumnType::Decimal, Value::Int(i)) => Ok(Value::Decimal(Decimal::from(*i))),
        (ColumnType::Decimal, Value::Text(s)) => Decimal::from_str(s.trim())
            .map(Value::Decimal)
            .map_err(|e| e.to_string()),

        (ColumnType::Text, Value::Text(s)) => Ok(Value::Text(s.clone())),
        (ColumnType::Text, Value::Int(i)) => Ok(Value::Text(i.to_string())),
        (ColumnType::Text, Value::Float(f)) => Ok(Value::Text(f.to_string())),
        (ColumnType::Text, Value::Bool(b)) => Ok(Value::Text(b.to_string())),

        (ColumnType::Timestamp, Value::Timestamp(t)) => Ok(Value::Timestamp(*t)),
        (ColumnType::Timestamp, Value::Text(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| Value::Timestamp(t.with_timezone(&Utc)))
            .map_err(|e| e.to_string()),

        (ColumnType::Bytes, Value::Bytes(b)) => Ok(Value::Bytes(b.clone())),
        (ColumnType::Bytes, Value::Text(s)) => Ok(Value::Bytes(s.clone().into_bytes())),

        (want, got) => Err(format!("cannot coerce {got:?} to {want:?}")),
    }
}

/// Serialize a coerced partition-key value to bytes using the cluster's
/// standard value-to-bytes rule for that type (spec §6 "routing parameter").
pub fn value_to_routing_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Null => Vec::new(),
        Value::Bool(b) => vec![*b as u8],
        Value::Int(i) => i.to_be_bytes().to_vec(),
        Value::Float(f) => f.to_be_bytes().to_vec(),
        Value::Decimal(d) => d.to_string().into_bytes(),
        Value::Text(s) => s.clone().into_bytes(),
        Value::Timestamp(t) => t.timestamp_micros().to_be_bytes().to_vec(),
        Value::Bytes(b) => b.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_text_to_int() {
        let v = coerce(&Value::Text("42".into()), ColumnType::Int).unwrap();
        assert_eq!(v, Value::Int(42));
    }

    #[test]
    fn rejects_non_numeric_text_as_int() {
        let err = coerce(&Value::Text("not-an-int".into()), ColumnType::Int).unwrap_err();
        assert!(err.contains("not an integer"));
    }

    #[test]
    fn null_always_coerces() {
        assert_eq!(coerce(&Value::Null, ColumnType::Int).unwrap(), Value::Null);
    }

    #[test]
    fn routing_bytes_for_int_is_big_endian() {
        assert_eq!(value_to_routing_bytes(&Value::Int(1)), vec![0, 0, 0, 0, 0, 0, 0, 1]);
    }
}
