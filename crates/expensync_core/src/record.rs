//! Untyped records and record keys.
//!
//! A [`Record`] is a JSON object. It is the only shape the journal and the
//! sync queue deal in; domain code works with [`crate::Document`] types and
//! converts at the boundary.

use crate::error::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Default identifier field of domain collections.
pub const ID_FIELD: &str = "id";

/// A JSON object stored in a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON value, which must be an object.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRecord`] for any other JSON type.
    pub fn from_value(value: Value) -> StoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(StoreError::invalid_record(format!(
                "expected a JSON object, got {}",
                json_type(&other)
            ))),
        }
    }

    /// Serializes any value into a record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or does not yield an object.
    pub fn from_serializable<T: Serialize + ?Sized>(value: &T) -> StoreResult<Self> {
        Self::from_value(serde_json::to_value(value)?)
    }

    /// Deserializes the record into `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not match `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
    }

    /// Returns the value of `field`.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Returns `field` if it holds a string.
    #[must_use]
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Returns the `id` field if it holds a string.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.get_str(ID_FIELD)
    }

    /// Sets `field`, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Builder-style [`Record::insert`].
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    /// Removes `field`.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Returns true if `field` is present.
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Shallow merge: every top-level field of `patch` overwrites the field
    /// of the same name here. Nested objects are replaced, not merged.
    pub fn merge(&mut self, patch: &Record) {
        for (field, value) in &patch.0 {
            self.0.insert(field.clone(), value.clone());
        }
    }

    /// Number of top-level fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the record has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the fields.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Borrows the underlying map.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Converts into a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}

impl TryFrom<Value> for Record {
    type Error = StoreError;

    fn try_from(value: Value) -> StoreResult<Self> {
        Self::from_value(value)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A primary key.
///
/// The storage form carries a type tag, so `"1"` and `1` never collide.
/// Integer keys are zero-padded so that lexicographic order equals numeric
/// order, which keeps auto-increment collections in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    /// A string identifier such as a UUID.
    Str(String),
    /// An integer identifier such as a queue sequence number.
    Int(u64),
}

impl Key {
    /// Extracts a key from a JSON value.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self::Str(s.clone())),
            Value::Number(n) => n.as_u64().map(Self::Int),
            _ => None,
        }
    }

    /// Returns the storage form of the key.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Str(s) => format!("s:{s}"),
            Self::Int(n) => format!("i:{n:020}"),
        }
    }

    /// Returns the JSON form of the key.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Str(s) => Value::String(s.clone()),
            Self::Int(n) => Value::from(*n),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<&String> for Key {
    fn from(s: &String) -> Self {
        Self::Str(s.clone())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<u64> for Key {
    fn from(n: u64) -> Self {
        Self::Int(n)
    }
}

/// Canonical string used to index a field value. `None` for values that are
/// not indexed (null, arrays, objects).
pub(crate) fn index_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Generates a fresh client-side record identifier.
#[must_use]
pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_requires_object() {
        assert!(Record::from_value(json!({"id": "a"})).is_ok());
        let err = Record::from_value(json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn merge_is_shallow() {
        let mut base = Record::from_value(json!({
            "id": "e1",
            "amount": 10,
            "meta": {"a": 1, "b": 2}
        }))
        .unwrap();
        let patch = Record::from_value(json!({"amount": 25, "meta": {"c": 3}})).unwrap();

        base.merge(&patch);

        assert_eq!(
            base.into_value(),
            json!({"id": "e1", "amount": 25, "meta": {"c": 3}})
        );
    }

    #[test]
    fn integer_keys_sort_numerically() {
        let mut keys: Vec<String> = [10u64, 9, 100].iter().map(|n| Key::Int(*n).encode()).collect();
        keys.sort();
        assert_eq!(keys, vec![Key::Int(9).encode(), Key::Int(10).encode(), Key::Int(100).encode()]);
    }

    #[test]
    fn numeric_looking_string_key_differs_from_integer_key() {
        assert_ne!(Key::from("00000000000000000001").encode(), Key::Int(1).encode());
        assert_ne!(Key::from("7").encode(), Key::Int(7).encode());
    }

    #[test]
    fn key_from_value() {
        assert_eq!(Key::from_value(&json!("abc")), Some(Key::Str("abc".into())));
        assert_eq!(Key::from_value(&json!(7)), Some(Key::Int(7)));
        assert_eq!(Key::from_value(&json!("")), None);
        assert_eq!(Key::from_value(&json!(-1)), None);
        assert_eq!(Key::from_value(&json!(null)), None);
    }

    #[test]
    fn record_ids_are_unique() {
        assert_ne!(new_record_id(), new_record_id());
    }
}
