use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A scalar destined for a SQL statement, either as a bound parameter or as
/// an escaped literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(uuid::Uuid),
    DateTime(chrono::NaiveDateTime),
}

/// One row of column values, ordered by column name.
pub type Row = BTreeMap<String, Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Canonical text form used to compare defaults read from the catalog
    /// with defaults declared on a blueprint.
    pub fn canonical(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(v) => Some(if *v { "1".to_owned() } else { "0".to_owned() }),
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::Text(v) => Some(v.clone()),
            Self::Uuid(v) => Some(v.to_string()),
            Self::DateTime(v) => Some(v.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<uuid::Uuid> for Value {
    fn from(value: uuid::Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<chrono::NaiveDateTime> for Value {
    fn from(value: chrono::NaiveDateTime) -> Self {
        Self::DateTime(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_aligns_bool_with_catalog_integers() {
        assert_eq!(Value::from(true).canonical(), Value::Int(1).canonical());
        assert_eq!(Value::Null.canonical(), None);
    }

    #[test]
    fn deserializes_plain_scalars() {
        let row: Row = serde_json::from_str(r#"{"a": 1, "b": "x", "c": null, "d": 1.5}"#).unwrap();
        assert_eq!(row["a"], Value::Int(1));
        assert_eq!(row["b"], Value::Text("x".to_owned()));
        assert_eq!(row["c"], Value::Null);
        assert_eq!(row["d"], Value::Float(1.5));
    }
}
