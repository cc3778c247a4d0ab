//! Cross-instance references inside declared attributes.
//!
//! A reference is a JSON object `{"$ref": "<instance>"}`, optionally with a
//! `"field"` holding a dotted path into the target's observed payload. A
//! bare reference resolves to the target's identity. References stay in
//! place until the target has committed a snapshot entry.

use crate::snapshot::Entry;
use serde_json::Value;

/// Key marking a reference object.
pub const REF_KEY: &str = "$ref";
/// Optional key selecting a field of the observed payload.
pub const FIELD_KEY: &str = "field";

/// A parsed reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference<'a> {
    pub target: &'a str,
    pub field: Option<&'a str>,
}

/// Parse `value` as a reference object.
pub fn parse(value: &Value) -> Option<Reference<'_>> {
    let object = value.as_object()?;
    let target = object.get(REF_KEY)?.as_str()?;
    let field = object.get(FIELD_KEY).and_then(Value::as_str);
    let extra = object.keys().any(|k| k != REF_KEY && k != FIELD_KEY);
    (!extra).then_some(Reference { target, field })
}

/// Build a reference value.
pub fn make(target: &str, field: Option<&str>) -> Value {
    let mut object = serde_json::Map::new();
    object.insert(REF_KEY.to_string(), Value::String(target.to_string()));
    if let Some(field) = field {
        object.insert(FIELD_KEY.to_string(), Value::String(field.to_string()));
    }
    Value::Object(object)
}

/// Names of every instance referenced anywhere in `value`.
pub fn targets(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect(value, &mut out);
    out.sort();
    out.dedup();
    out
}

fn collect(value: &Value, out: &mut Vec<String>) {
    if let Some(reference) = parse(value) {
        out.push(reference.target.to_string());
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect(v, out)),
        _ => {}
    }
}

/// Check if any reference remains in `value`.
pub fn is_unresolved(value: &Value) -> bool {
    if parse(value).is_some() {
        return true;
    }
    match value {
        Value::Array(items) => items.iter().any(is_unresolved),
        Value::Object(map) => map.values().any(is_unresolved),
        _ => false,
    }
}

/// Substitute every reference whose target `lookup` knows.
///
/// Unknown targets and missing fields leave the reference in place.
pub fn resolve(value: &Value, lookup: &dyn Fn(&str) -> Option<Entry>) -> Value {
    if let Some(reference) = parse(value) {
        let Some(entry) = lookup(reference.target) else {
            return value.clone();
        };
        return match reference.field {
            None => Value::String(entry.identity),
            Some(path) => field(&entry, path).unwrap_or_else(|| value.clone()),
        };
    }
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, lookup)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, lookup)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn field(entry: &Entry, path: &str) -> Option<Value> {
    if path == "id" && !entry.observed.contains_key("id") {
        return Some(Value::String(entry.identity.clone()));
    }
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = entry.observed.get(first)?;
    for segment in segments {
        current = match current {
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            other => other.get(segment)?,
        };
    }
    (!current.is_null()).then(|| current.clone())
}
