//! Layer merging
//!
//! - Objects merge by key, recursively
//! - Arrays are replaced wholesale
//! - Scalars are replaced
//! - A `null` in the upper layer leaves the lower value alone, so an unset
//!   CLI flag never clears a configured value

use serde_json::Value;

/// Lay `upper` over `lower`.
pub fn overlay(lower: Value, upper: Value) -> Value {
    match (lower, upper) {
        (lower, Value::Null) => lower,
        (Value::Object(mut lower_map), Value::Object(upper_map)) => {
            for (key, upper_value) in upper_map {
                let merged = match lower_map.remove(&key) {
                    Some(lower_value) => overlay(lower_value, upper_value),
                    None => upper_value,
                };
                lower_map.insert(key, merged);
            }
            Value::Object(lower_map)
        }
        (_, upper) => upper,
    }
}

/// Merge layers in order (first is lowest precedence)
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, overlay)
}
