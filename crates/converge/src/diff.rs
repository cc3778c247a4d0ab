//! Diff computation for instances
//!
//! Declared attributes are compared against the last-applied attributes
//! (what this engine asked for) and then against the observed payload
//! (what the platform reports). The second comparison catches remote drift
//! and goes through the registered drift comparators.

use crate::controller::{AttrMode, Schema};
use crate::drift::json_eq;
use crate::reference;
use crate::types::Attributes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Classification of one attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    Unchanged,
    Updatable,
    ForcesReplacement,
    /// Depends on a reference that has no value yet
    Unresolvable,
}

impl From<AttrMode> for Change {
    fn from(mode: AttrMode) -> Self {
        match mode {
            AttrMode::Updatable => Self::Updatable,
            AttrMode::ForcesReplacement => Self::ForcesReplacement,
        }
    }
}

/// Where a detected difference came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    /// The declaration changed since the last apply
    Declared,
    /// The remote object no longer matches the declaration
    Drift,
}

/// A changed attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDiff {
    pub name: String,
    pub change: Change,
    pub source: Source,
    /// Previous value: last applied, or observed for drift
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl fmt::Display for AttributeDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<Value>| v.as_ref().map_or_else(|| "(none)".to_string(), Value::to_string);
        let after = match self.change {
            Change::Unresolvable => "(known after apply)".to_string(),
            _ => show(&self.after),
        };
        write!(f, "{}: {} => {}", self.name, show(&self.before), after)?;
        match (self.change, self.source) {
            (Change::ForcesReplacement, _) => write!(f, " (forces replacement)"),
            (_, Source::Drift) => write!(f, " (drift)"),
            _ => Ok(()),
        }
    }
}

/// Changed attributes of one instance. Unchanged attributes are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub attributes: Vec<AttributeDiff>,
}

impl Diff {
    /// Check if nothing changed
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Check if any attribute forces replacement
    pub fn requires_replacement(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| a.change == Change::ForcesReplacement)
    }

    /// Check if any attribute depends on an unresolved reference
    pub fn has_unresolvable(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| a.change == Change::Unresolvable)
    }

    /// Names of attributes applied in place
    pub fn updatable(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|a| a.change == Change::Updatable)
            .map(|a| a.name.as_str())
    }

    /// Check if an attribute changed
    pub fn changed(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }

    /// Look up an attribute's diff
    pub fn get(&self, name: &str) -> Option<&AttributeDiff> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Content hash of declared attributes, independent of key order.
pub fn content_hash(attributes: &Attributes) -> String {
    let mut hasher = blake3::Hasher::new();
    hash_object(&mut hasher, attributes);
    hasher.finalize().to_hex().to_string()
}

fn hash_object(hasher: &mut blake3::Hasher, map: &Attributes) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    hasher.update(b"{");
    for key in keys {
        hasher.update(Value::String(key.clone()).to_string().as_bytes());
        hasher.update(b":");
        hash_value(hasher, &map[key.as_str()]);
        hasher.update(b",");
    }
    hasher.update(b"}");
}

fn hash_value(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Object(map) => hash_object(hasher, map),
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(hasher, item);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        scalar => {
            hasher.update(scalar.to_string().as_bytes());
        }
    }
}

/// Treat a declared `null` like an absent attribute
fn present<'a>(attrs: &'a Attributes, name: &str) -> Option<&'a Value> {
    attrs.get(name).filter(|v| !v.is_null())
}

/// Last-applied side of a diff
#[derive(Debug, Clone, Copy)]
pub struct Applied<'a> {
    pub attributes: &'a Attributes,
    pub hash: &'a str,
}

/// Compute the diff of one instance.
///
/// * `declared` - resolved declared attributes (may still hold references in a dry run)
/// * `applied` - last-applied attributes and their hash
/// * `observed` - payload from the read-before-plan
/// * `suppressed` - attributes never reported as changed
pub fn compute(
    schema: &Schema,
    declared: &Attributes,
    applied: Applied<'_>,
    observed: &Attributes,
    suppressed: &[String],
) -> Diff {
    let mut diff = Diff::default();
    let is_suppressed = |name: &str| suppressed.iter().any(|s| s == name);

    // Declared vs last applied. Identical hashes mean identical declarations.
    if content_hash(declared) != applied.hash {
        let mut names: Vec<&String> = declared.keys().chain(applied.attributes.keys()).collect();
        names.sort();
        names.dedup();

        for name in names {
            if is_suppressed(name) {
                continue;
            }
            let after = present(declared, name);
            let before = present(applied.attributes, name);

            let change = match (before, after) {
                (_, Some(value)) if reference::is_unresolved(value) => Change::Unresolvable,
                (Some(b), Some(a)) if json_eq(b, a) => continue,
                (None, None) => continue,
                _ => schema.mode(name).into(),
            };
            diff.attributes.push(AttributeDiff {
                name: name.clone(),
                change,
                source: Source::Declared,
                before: before.cloned(),
                after: after.cloned(),
            });
        }
    }

    // Declared vs observed, through the drift comparators
    for (name, value) in declared {
        if value.is_null() || is_suppressed(name) || diff.changed(name) {
            continue;
        }
        if reference::is_unresolved(value) {
            continue;
        }
        let Some(remote) = present(observed, name) else {
            continue;
        };
        if schema.comparator(name).matches(value, remote) {
            continue;
        }
        diff.attributes.push(AttributeDiff {
            name: name.clone(),
            change: schema.mode(name).into(),
            source: Source::Drift,
            before: Some(remote.clone()),
            after: Some(value.clone()),
        });
    }

    diff
}
