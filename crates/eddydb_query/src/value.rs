//! Tagged values forming the query AST.

use crate::error::{QueryError, QueryResult};

/// A node of the query AST.
///
/// Arrays are operator applications; dictionaries are only legal as the
/// operand of `SELECT`. Binary values are never legal in a query but can
/// arrive from converters, so the type can represent them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// JSON null.
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A floating-point number.
    Float(f64),
    /// A string.
    String(String),
    /// Binary data (rejected by the translator).
    Bytes(Vec<u8>),
    /// An array (operator application).
    Array(Vec<Value>),
    /// A dictionary (`SELECT` operands), order-preserving.
    Dict(Vec<(String, Value)>),
}

impl Value {
    /// Parses a JSON string into a value tree.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuery` if the string is not valid JSON.
    pub fn from_json_str(json: &str) -> QueryResult<Self> {
        let parsed: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| QueryError::invalid(format!("bad JSON: {e}")))?;
        Ok(Self::from_json(parsed))
    }

    /// Converts a parsed JSON value.
    #[must_use]
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Dict(map.into_iter().map(|(k, v)| (k, Self::from_json(v))).collect())
            }
        }
    }

    /// Returns the string contents, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the array elements, if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the dictionary entries, if this is a dictionary.
    #[must_use]
    pub fn as_dict(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Returns the integer contents, if this is an integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Looks up a key in a dictionary value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_json_covers_all_shapes() {
        let v = Value::from_json_str(
            r#"{"WHERE": ["=", [".", "n"], 1.5], "flag": true, "none": null}"#,
        )
        .unwrap();
        let where_clause = v.get("WHERE").unwrap();
        let args = where_clause.as_array().unwrap();
        assert_eq!(args[0].as_str(), Some("="));
        assert_eq!(args[2], Value::Float(1.5));
        assert_eq!(v.get("flag"), Some(&Value::Bool(true)));
        assert_eq!(v.get("none"), Some(&Value::Null));
    }

    #[test]
    fn integers_stay_integers() {
        let v = Value::from_json_str("[42]").unwrap();
        assert_eq!(v.as_array().unwrap()[0].as_int(), Some(42));
    }

    #[test]
    fn bad_json_is_invalid_query() {
        assert!(matches!(
            Value::from_json_str("{nope"),
            Err(QueryError::InvalidQuery(_))
        ));
    }
}
