//! Self-describing config values.
//!
//! Every remotely editable setting may be stored either raw (`50`) or
//! wrapped (`{"value": 50, "name": "pageSize", "description": "...",
//! "type": "number"}`). All unwrapping and coercion lives here so call
//! sites never poke at JSON shapes themselves.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys a field wrapper may carry.
const WRAPPER_KEYS: &[&str] = &["value", "name", "description", "type"];

/// Prefix marking a key as local-only (never hashed or submitted).
pub const LOCAL_ONLY_PREFIX: char = '_';

/// Declared type of a config field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Number,
    Boolean,
    String,
    Object,
    Array,
}

impl FieldType {
    /// Infer the declared type from a raw value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Number(_) => FieldType::Number,
            Value::Bool(_) => FieldType::Boolean,
            Value::Array(_) => FieldType::Array,
            Value::Object(_) => FieldType::Object,
            Value::String(_) | Value::Null => FieldType::String,
        }
    }
}

/// A wrapped, self-describing setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    pub value: Value,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl ConfigField {
    /// Build a field, inferring its type from `value`.
    pub fn new(name: impl Into<String>, description: impl Into<String>, value: Value) -> Self {
        Self {
            field_type: FieldType::of(&value),
            value,
            name: name.into(),
            description: description.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "value": self.value,
            "name": self.name,
            "description": self.description,
            "type": self.field_type,
        })
    }
}

/// True when `value` is a `{value, name, description, type}` wrapper.
pub fn is_field_wrapper(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.contains_key("value") && map.keys().all(|k| WRAPPER_KEYS.contains(&k.as_str()))
        }
        _ => false,
    }
}

/// Resolve wrappers recursively down to effective values.
pub fn unwrap_value(value: &Value) -> Value {
    match value {
        Value::Object(map) if is_field_wrapper(value) => {
            unwrap_value(map.get("value").unwrap_or(&Value::Null))
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), unwrap_value(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(unwrap_value).collect()),
        other => other.clone(),
    }
}

/// Coerce an (unwrapped) value to an integer.
pub fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Coerce an (unwrapped) value to a boolean.
pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Coerce an (unwrapped) value to a string.
pub fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Deep-merge `incoming` into `base`.
///
/// Maps merge key by key; anything else replaces outright. A raw value
/// (scalar, array or plain object) landing on a stored field wrapper is
/// merged into the wrapper's `value` so its metadata survives. An incoming
/// wrapper merges onto the stored one key by key.
pub fn deep_merge(base: &mut Value, incoming: &Value) {
    if is_field_wrapper(base) && !is_field_wrapper(incoming) {
        if let Some(inner) = base.get_mut("value") {
            deep_merge(inner, incoming);
        }
        return;
    }
    match (base, incoming) {
        (Value::Object(base_map), Value::Object(incoming_map)) => {
            merge_maps(base_map, incoming_map);
        }
        (base, incoming) => *base = incoming.clone(),
    }
}

/// Deep-merge two maps in place.
pub fn merge_maps(base: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        match base.get_mut(key) {
            Some(existing) => deep_merge(existing, value),
            None => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Drop local-only keys at any depth.
pub fn strip_local_only(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !k.starts_with(LOCAL_ONLY_PREFIX))
                .map(|(k, v)| (k.clone(), strip_local_only(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_local_only).collect()),
        other => other.clone(),
    }
}
