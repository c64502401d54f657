//! Knowledge values and update records
//!
//! Defines the typed values carried in update records and their
//! deterministic ordering.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Value type tags as they appear on the wire
pub mod value_tags {
    pub const INTEGER: u32 = 1;
    pub const DOUBLE: u32 = 2;
    pub const STRING: u32 = 3;
    pub const INTEGER_ARRAY: u32 = 4;
    pub const DOUBLE_ARRAY: u32 = 5;
    pub const BINARY: u32 = 6;
}

/// A typed knowledge value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Integer(i64),
    Double(f64),
    String(String),
    IntegerArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    Binary(Vec<u8>),
}

impl Value {
    /// Get the wire type tag
    pub fn type_tag(&self) -> u32 {
        match self {
            Value::Integer(_) => value_tags::INTEGER,
            Value::Double(_) => value_tags::DOUBLE,
            Value::String(_) => value_tags::STRING,
            Value::IntegerArray(_) => value_tags::INTEGER_ARRAY,
            Value::DoubleArray(_) => value_tags::DOUBLE_ARRAY,
            Value::Binary(_) => value_tags::BINARY,
        }
    }

    /// Number written in the record's size field
    pub fn wire_size(&self) -> u32 {
        match self {
            Value::Integer(_) | Value::Double(_) => 1,
            Value::String(s) => s.len() as u32,
            Value::IntegerArray(v) => v.len() as u32,
            Value::DoubleArray(v) => v.len() as u32,
            Value::Binary(b) => b.len() as u32,
        }
    }

    /// Bytes occupied by the payload (excluding tag and size)
    pub fn payload_len(&self) -> usize {
        match self {
            Value::Integer(_) | Value::Double(_) => 8,
            Value::String(s) => s.len(),
            Value::IntegerArray(v) => v.len() * 8,
            Value::DoubleArray(v) => v.len() * 8,
            Value::Binary(b) => b.len(),
        }
    }

    /// Parse a command-line literal: integer, then double, else string
    pub fn parse_literal(text: &str) -> Self {
        if let Ok(i) = text.parse::<i64>() {
            Value::Integer(i)
        } else if let Ok(d) = text.parse::<f64>() {
            Value::Double(d)
        } else {
            Value::String(text.to_string())
        }
    }

    /// Total order used to break ties between updates stamped with the same
    /// clock and quality. Orders by type tag first, then by content.
    pub fn tie_break(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::IntegerArray(a), Value::IntegerArray(b)) => a.cmp(b),
            (Value::DoubleArray(a), Value::DoubleArray(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.total_cmp(y) {
                        Ordering::Equal => continue,
                        unequal => return unequal,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            _ => self.type_tag().cmp(&other.type_tag()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{}", s),
            Value::IntegerArray(v) => {
                let parts: Vec<String> = v.iter().map(|i| i.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::DoubleArray(v) => {
                let parts: Vec<String> = v.iter().map(|d| d.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// A single key/value pair carried in a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub key: String,
    pub value: Value,
}

impl Update {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    /// Encoded length: key length(4) + key + tag(4) + size(4) + payload
    pub fn encoded_len(&self) -> usize {
        4 + self.key.len() + 4 + 4 + self.value.payload_len()
    }
}
