//! Scope values.

pub use serde_json::Value;

/// Returns whether a value counts as "true" for predicates.
///
/// `null`, `false`, `0`, `""`, `[]` and `{}` are falsy; everything else is
/// truthy.
///
/// # Examples
///
/// ```
/// use kumihimo_core::{is_truthy, Value};
/// use serde_json::json;
///
/// assert!(is_truthy(&json!(true)));
/// assert!(is_truthy(&json!("no")));
/// assert!(!is_truthy(&json!(0)));
/// assert!(!is_truthy(&Value::Null));
/// ```
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
