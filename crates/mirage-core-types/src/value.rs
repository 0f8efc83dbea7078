//! Scalar field values and row maps
//!
//! Every record the engine mirrors is a flat mapping of field names to
//! scalar values. `Value` covers the value domain of the remote store:
//! strings, double-precision numbers, booleans, UTC timestamps and null.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered field-name → value mapping: the shape of raw rows, change-record
/// payloads and query parameter sets. `BTreeMap` keeps serialization order
/// deterministic.
pub type FieldMap = BTreeMap<String, Value>;

/// A single scalar field value.
///
/// Serializes untagged: null, booleans, numbers and strings take their plain
/// JSON forms; dates serialize as RFC 3339 strings. On the wire a date is
/// therefore indistinguishable from its string form, same as in JSON itself,
/// so deserialization yields `Value::String` for date-shaped input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
}

impl Value {
    /// True for the "no value" family: null or the empty string.
    pub fn is_blank(&self) -> bool {
        matches!(self, Value::Null) || matches!(self, Value::String(s) if s.is_empty())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Loose equality used for change suppression: blanks compare equal to
    /// each other, numbers compare to their string spellings and booleans to
    /// 0/1, mirroring the coercive comparison of the mirrored store's client.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        if self.is_blank() && other.is_blank() {
            return true;
        }
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
                s.parse::<f64>().map(|p| p == *n).unwrap_or(false)
            }
            (Value::Bool(b), Value::Number(n)) | (Value::Number(n), Value::Bool(b)) => {
                f64::from(u8::from(*b)) == *n
            }
            _ => false,
        }
    }

    /// Canonical serialized form used for composite-key components.
    ///
    /// Strings are JSON-encoded (quoted and escaped) and dates are quoted
    /// RFC 3339 with millisecond precision, which makes a joined key uniquely
    /// decodable: no delimiter sequence can occur inside a component.
    pub fn key_component(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => serde_json::Value::String(s.clone()).to_string(),
            Value::Date(d) => format!("\"{}\"", d.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Date(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Build a `FieldMap` from `(name, value)` pairs.
pub fn field_map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> FieldMap
where
    K: Into<String>,
    V: Into<Value>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_blank_family_loosely_equal() {
        assert!(Value::Null.loosely_equals(&Value::String(String::new())));
        assert!(Value::String(String::new()).loosely_equals(&Value::Null));
        assert!(Value::Null.loosely_equals(&Value::Null));
        assert!(!Value::Null.loosely_equals(&Value::from("x")));
    }

    #[test]
    fn test_number_string_coercion() {
        assert!(Value::from(5i64).loosely_equals(&Value::from("5")));
        assert!(Value::from("5").loosely_equals(&Value::from(5i64)));
        assert!(!Value::from("5a").loosely_equals(&Value::from(5i64)));
    }

    #[test]
    fn test_bool_number_coercion() {
        assert!(Value::from(true).loosely_equals(&Value::from(1i64)));
        assert!(Value::from(false).loosely_equals(&Value::from(0i64)));
        assert!(!Value::from(true).loosely_equals(&Value::from(2i64)));
    }

    #[test]
    fn test_integral_numbers_display_without_fraction() {
        assert_eq!(Value::from(142_841_834_950_629i64).to_string(), "142841834950629");
        assert_eq!(Value::from(1.5).to_string(), "1.5");
    }

    #[test]
    fn test_key_component_is_unambiguous() {
        // A raw delimiter inside a string stays inside its quotes.
        let tricky = Value::from("a | b");
        assert_eq!(tricky.key_component(), "\"a | b\"");
        // A string of digits is distinct from the number it spells.
        assert_ne!(Value::from("5").key_component(), Value::from(5i64).key_component());
    }

    #[test]
    fn test_date_key_component_canonical() {
        let d = Utc.with_ymd_and_hms(2015, 4, 29, 0, 0, 0).unwrap();
        assert_eq!(
            Value::Date(d).key_component(),
            "\"2015-04-29T00:00:00.000Z\""
        );
    }

    #[test]
    fn test_serde_untagged_shapes() {
        assert_eq!(serde_json::to_string(&Value::Null).unwrap(), "null");
        assert_eq!(serde_json::to_string(&Value::from(true)).unwrap(), "true");
        assert_eq!(serde_json::to_string(&Value::from("x")).unwrap(), "\"x\"");
        let back: Value = serde_json::from_str("\"x\"").unwrap();
        assert_eq!(back, Value::from("x"));
        let back: Value = serde_json::from_str("null").unwrap();
        assert_eq!(back, Value::Null);
    }

    #[test]
    fn test_field_map_builder() {
        let m = field_map([("b", Value::from(2i64)), ("a", Value::from("x"))]);
        assert_eq!(m.get("a"), Some(&Value::from("x")));
        assert_eq!(m.get("b"), Some(&Value::from(2i64)));
        // BTreeMap iterates in field-name order.
        let names: Vec<&str> = m.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
