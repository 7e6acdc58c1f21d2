use itertools::Itertools;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Primary key assigned by the relational store.
pub type Handle = Uuid;

/// Field name to value, ordered so that iteration and serialization are
/// reproducible.
pub type AttrMap = BTreeMap<String, Value>;

/// Joins identifier values into a unique id, e.g. `edge-1__eth0`.
pub const UNIQUE_ID_SEPARATOR: &str = "__";

pub fn generate_handle() -> Handle {
    Uuid::new_v4()
}

/// Renders a value the way it takes part in unique ids and index keys.
/// Strings are used verbatim, everything else as its JSON text.
pub fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn unique_id<'a>(values: impl IntoIterator<Item = &'a Value>) -> String {
    values.into_iter().map(value_key).join(UNIQUE_ID_SEPARATOR)
}

/// `null`, `false`, `0`, `""`, `[]` and `{}`.
///
/// Relation fields holding such a value are skipped on create and update
/// instead of being resolved. This keeps compatibility with sources that
/// use empty strings for "no relation", but it also means a relation can
/// never be cleared through an update.
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unique_id_joins_rendered_values() {
        let values = [json!("ams1"), json!(100)];
        assert_eq!(unique_id(values.iter()), "ams1__100");
        assert_eq!(unique_id([json!("edge-1")].iter()), "edge-1");
    }

    #[test]
    fn test_falsy_values() {
        for value in [json!(null), json!(""), json!(0), json!(false), json!([]), json!({})] {
            assert!(is_falsy(&value), "{value} should be falsy");
        }
        for value in [json!("active"), json!(1), json!(true), json!([1]), json!({"a": 1})] {
            assert!(!is_falsy(&value), "{value} should not be falsy");
        }
    }
}
