//! Declared value shapes for step inputs and outputs.
//!
//! A `ValueShape` is a lightweight structural type over JSON values. Steps
//! declare the shape they consume and produce; the builder checks adjacent
//! shapes at commit time and the scheduler validates the run input against
//! the definition's declared input shape. Shapes stay serializable, so a
//! committed definition can be persisted and reloaded without closures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structural type of a JSON value.
///
/// `Any` is the top shape: it accepts and is accepted by everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueShape {
    Any,
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueShape {
    /// Classify a concrete JSON value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueShape::Null,
            Value::Bool(_) => ValueShape::Bool,
            Value::Number(_) => ValueShape::Number,
            Value::String(_) => ValueShape::String,
            Value::Array(_) => ValueShape::Array,
            Value::Object(_) => ValueShape::Object,
        }
    }

    /// Whether a value of shape `other` can be fed where `self` is expected.
    pub fn accepts(&self, other: ValueShape) -> bool {
        *self == ValueShape::Any || other == ValueShape::Any || *self == other
    }
}

impl Default for ValueShape {
    fn default() -> Self {
        ValueShape::Any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_json_values() {
        assert_eq!(ValueShape::of(&json!(null)), ValueShape::Null);
        assert_eq!(ValueShape::of(&json!(true)), ValueShape::Bool);
        assert_eq!(ValueShape::of(&json!(42)), ValueShape::Number);
        assert_eq!(ValueShape::of(&json!("hi")), ValueShape::String);
        assert_eq!(ValueShape::of(&json!([1, 2])), ValueShape::Array);
        assert_eq!(ValueShape::of(&json!({"a": 1})), ValueShape::Object);
    }

    #[test]
    fn any_accepts_everything() {
        for shape in [
            ValueShape::Null,
            ValueShape::Bool,
            ValueShape::Number,
            ValueShape::String,
            ValueShape::Array,
            ValueShape::Object,
        ] {
            assert!(ValueShape::Any.accepts(shape));
            assert!(shape.accepts(ValueShape::Any));
        }
    }

    #[test]
    fn exact_shapes_must_match() {
        assert!(ValueShape::Object.accepts(ValueShape::Object));
        assert!(!ValueShape::Object.accepts(ValueShape::Array));
        assert!(!ValueShape::Number.accepts(ValueShape::String));
    }

    #[test]
    fn serde_snake_case() {
        let json = serde_json::to_string(&ValueShape::Object).unwrap();
        assert_eq!(json, "\"object\"");
        let parsed: ValueShape = serde_json::from_str("\"any\"").unwrap();
        assert_eq!(parsed, ValueShape::Any);
    }
}
