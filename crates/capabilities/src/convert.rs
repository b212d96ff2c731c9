//! JSON <-> script value bridging for state, params and host functions.

use rhai::{Array, Dynamic, Map};
use serde_json::{Number, Value};

/// Integers stay `INT`; other numbers become `FLOAT`.
pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(flag) => Dynamic::from(*flag),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(int), _) => Dynamic::from(int),
            (None, Some(float)) => Dynamic::from(float),
            _ => Dynamic::from(n.to_string()),
        },
        Value::String(text) => Dynamic::from(text.clone()),
        Value::Array(items) => Dynamic::from(items.iter().map(json_to_dynamic).collect::<Array>()),
        Value::Object(fields) => Dynamic::from(
            fields
                .iter()
                .map(|(key, v)| (key.as_str().into(), json_to_dynamic(v)))
                .collect::<Map>(),
        ),
    }
}

/// Script value back to JSON. Anything without a JSON shape (function
/// pointers, timestamps, chars) is rendered as text.
pub fn dynamic_to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(flag) = value.as_bool() {
        return Value::Bool(flag);
    }
    if let Ok(int) = value.as_int() {
        return Value::from(int);
    }
    if let Ok(float) = value.as_float() {
        // NaN and infinities have no JSON form.
        return Number::from_f64(float).map_or(Value::Null, Value::Number);
    }
    if let Ok(text) = value.clone().into_immutable_string() {
        return Value::String(text.to_string());
    }
    if let Ok(items) = value.clone().into_array() {
        return items.iter().map(dynamic_to_json).collect();
    }
    if let Some(fields) = value.clone().try_cast::<Map>() {
        return Value::Object(
            fields
                .iter()
                .map(|(key, v)| (key.to_string(), dynamic_to_json(v)))
                .collect(),
        );
    }
    Value::String(value.to_string())
}
