//! Scalar values held in an instance's flag set and on the VM stack.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A flag or stack value.
///
/// Serialized untagged, so JSON `true`, `42` and `"gold"` map directly to
/// [`Value::Bool`], [`Value::Int`] and [`Value::Text`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A string.
    Text(String),
}

impl Value {
    /// Truthiness used by branch instructions: `Bool(b)` is `b`, `Int(n)` is
    /// `n != 0`, `Text(s)` is non-empty.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Text(s) => !s.is_empty(),
        }
    }

    /// The integer value, if this is an [`Value::Int`].
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Short type name, used in fault messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Text(_) => "text",
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Bool(false)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Value::Bool(true), true)]
    #[case(Value::Bool(false), false)]
    #[case(Value::Int(0), false)]
    #[case(Value::Int(-3), true)]
    #[case(Value::Text(String::new()), false)]
    #[case(Value::Text("x".into()), true)]
    fn truthiness(#[case] value: Value, #[case] expected: bool) {
        assert_eq!(value.is_truthy(), expected);
    }

    #[test]
    fn untagged_json_mapping() {
        let values: Vec<Value> = serde_json::from_str(r#"[true, 42, "gold"]"#).unwrap();
        assert_eq!(
            values,
            vec![Value::Bool(true), Value::Int(42), Value::Text("gold".into())]
        );
    }

    #[test]
    fn display() {
        assert_eq!(Value::Int(7).to_string(), "7");
        assert_eq!(Value::from("eu").to_string(), "eu");
    }
}
