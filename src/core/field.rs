//! Field values and the per-entity field registry
//!
//! Filtering and sorting never inspect a model by name at runtime. Instead,
//! every entity type carries a [`FieldRegistry`] built once (by
//! [`impl_model!`](crate::impl_model)) that maps a field name to its declared
//! [`FieldKind`] and a typed accessor returning a [`FieldValue`].

use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use uuid::Uuid;

/// A polymorphic field value that can hold different types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Uuid(Uuid),
    DateTime(DateTime<Utc>),
    Null,
}

impl FieldValue {
    /// Get the value as a string if possible
    pub fn as_string(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as an integer if possible
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Textual form used by pattern matching
    pub fn as_text(&self) -> Option<String> {
        match self {
            FieldValue::String(s) => Some(s.clone()),
            FieldValue::Integer(i) => Some(i.to_string()),
            FieldValue::Float(f) => Some(f.to_string()),
            FieldValue::Boolean(b) => Some(b.to_string()),
            FieldValue::Uuid(u) => Some(u.to_string()),
            FieldValue::DateTime(dt) => Some(dt.to_rfc3339()),
            FieldValue::Null => None,
        }
    }

    /// Compare two values the way a SQL comparison would.
    ///
    /// Integers and floats compare numerically. Values of unrelated kinds,
    /// or a null against a non-null, are incomparable.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        use FieldValue::*;
        match (self, other) {
            (String(a), String(b)) => Some(a.cmp(b)),
            (Integer(a), Integer(b)) => Some(a.cmp(b)),
            (Integer(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
            (Uuid(a), Uuid(b)) => Some(a.cmp(b)),
            (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
            (Null, Null) => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// Total order for sorting: nulls first, incomparable values tie
    pub fn sort_cmp(&self, other: &FieldValue) -> Ordering {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => Ordering::Equal,
            (FieldValue::Null, _) => Ordering::Less,
            (_, FieldValue::Null) => Ordering::Greater,
            _ => self.compare(other).unwrap_or(Ordering::Equal),
        }
    }
}

/// Declared kind of a registered field, used to coerce filter values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Boolean,
    Uuid,
    DateTime,
}

impl FieldKind {
    /// Coerce a query-string value into this kind
    pub fn coerce(&self, raw: &str) -> Option<FieldValue> {
        let raw = raw.trim();
        match self {
            FieldKind::String => Some(FieldValue::String(raw.to_string())),
            FieldKind::Integer => raw
                .parse::<i64>()
                .map(FieldValue::Integer)
                .ok()
                .or_else(|| raw.parse::<f64>().ok().map(FieldValue::Float)),
            FieldKind::Float => raw.parse::<f64>().ok().map(FieldValue::Float),
            FieldKind::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(FieldValue::Boolean(true)),
                "false" | "0" | "no" => Some(FieldValue::Boolean(false)),
                _ => None,
            },
            FieldKind::Uuid => Uuid::parse_str(raw).ok().map(FieldValue::Uuid),
            FieldKind::DateTime => parse_datetime(raw).map(FieldValue::DateTime),
        }
    }

    /// Coerce a JSON value into this kind
    pub fn coerce_json(&self, value: &Value) -> Option<FieldValue> {
        match value {
            Value::Null => Some(FieldValue::Null),
            Value::String(s) => self.coerce(s),
            Value::Bool(b) => match self {
                FieldKind::Boolean => Some(FieldValue::Boolean(*b)),
                _ => self.coerce(&b.to_string()),
            },
            Value::Number(n) => match self {
                FieldKind::Integer if n.is_i64() => n.as_i64().map(FieldValue::Integer),
                FieldKind::Integer | FieldKind::Float => n.as_f64().map(FieldValue::Float),
                _ => self.coerce(&n.to_string()),
            },
            Value::Array(_) | Value::Object(_) => None,
        }
    }
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Rust types that can back a registered field
pub trait FieldType {
    const KIND: FieldKind;

    fn to_field_value(&self) -> FieldValue;
}

impl FieldType for String {
    const KIND: FieldKind = FieldKind::String;

    fn to_field_value(&self) -> FieldValue {
        FieldValue::String(self.clone())
    }
}

impl FieldType for i64 {
    const KIND: FieldKind = FieldKind::Integer;

    fn to_field_value(&self) -> FieldValue {
        FieldValue::Integer(*self)
    }
}

impl FieldType for i32 {
    const KIND: FieldKind = FieldKind::Integer;

    fn to_field_value(&self) -> FieldValue {
        FieldValue::Integer(i64::from(*self))
    }
}

impl FieldType for f64 {
    const KIND: FieldKind = FieldKind::Float;

    fn to_field_value(&self) -> FieldValue {
        FieldValue::Float(*self)
    }
}

impl FieldType for bool {
    const KIND: FieldKind = FieldKind::Boolean;

    fn to_field_value(&self) -> FieldValue {
        FieldValue::Boolean(*self)
    }
}

impl FieldType for Uuid {
    const KIND: FieldKind = FieldKind::Uuid;

    fn to_field_value(&self) -> FieldValue {
        FieldValue::Uuid(*self)
    }
}

impl FieldType for DateTime<Utc> {
    const KIND: FieldKind = FieldKind::DateTime;

    fn to_field_value(&self) -> FieldValue {
        FieldValue::DateTime(*self)
    }
}

impl<T: FieldType> FieldType for Option<T> {
    const KIND: FieldKind = T::KIND;

    fn to_field_value(&self) -> FieldValue {
        self.as_ref()
            .map(FieldType::to_field_value)
            .unwrap_or(FieldValue::Null)
    }
}

/// One registered field of an entity type
pub struct FieldDef<M> {
    name: &'static str,
    kind: FieldKind,
    accessor: fn(&M) -> FieldValue,
}

impl<M> FieldDef<M> {
    pub fn new(name: &'static str, kind: FieldKind, accessor: fn(&M) -> FieldValue) -> Self {
        Self {
            name,
            kind,
            accessor,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Read this field from a model
    pub fn get(&self, model: &M) -> FieldValue {
        (self.accessor)(model)
    }
}

/// Name → field lookup table for one entity type
pub struct FieldRegistry<M> {
    fields: IndexMap<&'static str, FieldDef<M>>,
}

impl<M> FieldRegistry<M> {
    pub fn new() -> Self {
        Self {
            fields: IndexMap::new(),
        }
    }

    /// Add a field, replacing any earlier registration under the same name
    pub fn register(mut self, def: FieldDef<M>) -> Self {
        self.fields.insert(def.name, def);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldDef<M>> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Registered field names in declaration order
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.keys().copied()
    }
}

impl<M> Default for FieldRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_value_string() {
        let value = FieldValue::String("test".to_string());
        assert_eq!(value.as_string(), Some("test"));
        assert_eq!(value.as_integer(), None);
        assert!(!value.is_null());
    }

    #[test]
    fn test_numeric_comparison_crosses_kinds() {
        let int = FieldValue::Integer(20);
        let float = FieldValue::Float(2.5);
        assert_eq!(int.compare(&float), Some(Ordering::Greater));
        assert_eq!(
            FieldValue::Float(20.0).compare(&int),
            Some(Ordering::Equal)
        );
        assert_eq!(int.compare(&FieldValue::String("20".into())), None);
    }

    #[test]
    fn test_nulls_sort_first() {
        let mut values = vec![
            FieldValue::Integer(3),
            FieldValue::Null,
            FieldValue::Integer(1),
        ];
        values.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(values[0], FieldValue::Null);
        assert_eq!(values[1], FieldValue::Integer(1));
    }

    #[test]
    fn test_coerce_by_kind() {
        assert_eq!(FieldKind::Integer.coerce("20"), Some(FieldValue::Integer(20)));
        assert_eq!(FieldKind::Integer.coerce("2.5"), Some(FieldValue::Float(2.5)));
        assert_eq!(FieldKind::Float.coerce("2.0"), Some(FieldValue::Float(2.0)));
        assert_eq!(FieldKind::Boolean.coerce("TRUE"), Some(FieldValue::Boolean(true)));
        assert_eq!(FieldKind::Integer.coerce("abc"), None);
        assert!(matches!(
            FieldKind::DateTime.coerce("2024-03-01"),
            Some(FieldValue::DateTime(_))
        ));
    }

    #[test]
    fn test_coerce_json_numbers() {
        assert_eq!(
            FieldKind::Float.coerce_json(&serde_json::json!(3)),
            Some(FieldValue::Float(3.0))
        );
        assert_eq!(
            FieldKind::Integer.coerce_json(&serde_json::json!(3)),
            Some(FieldValue::Integer(3))
        );
        assert_eq!(FieldKind::String.coerce_json(&serde_json::json!([1])), None);
    }

    #[test]
    fn test_option_field_type() {
        let some: Option<i64> = Some(4);
        let none: Option<i64> = None;
        assert_eq!(some.to_field_value(), FieldValue::Integer(4));
        assert!(none.to_field_value().is_null());
        assert_eq!(<Option<i64> as FieldType>::KIND, FieldKind::Integer);
    }
}
