//! Drift suppression rules
//!
//! The platform normalizes some values on write: a `*-latest` model alias
//! comes back as a pinned version, tool blocks come back with server-side
//! defaults filled in. Comparing those strictly would report a change on
//! every pass. A [`Comparator`] registered for a (kind, attribute) pair
//! decides when an observed value still satisfies the declared one.
//! Unregistered attributes use [`json_eq`].

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// A pinned model version suffix: `007`, `0613` or `2024-08-06`.
static VERSION_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{3,4}|\d{4}-\d{2}-\d{2})$").expect("version suffix pattern is valid")
});

/// Suffix marking a floating model alias.
const LATEST: &str = "-latest";

/// Equality used when comparing a declared attribute with its observed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Comparator {
    /// Structural equality, numbers compared by value
    #[default]
    Strict,
    /// Declared model alias (`x-latest` or bare family `x`) matches a pinned `x-<version>`
    ModelAlias,
    /// Declared object/array is contained in the observed one
    Subset,
    /// The remote representation differs from the input (message content
    /// blocks, initial file lists); never compared
    WriteOnly,
}

impl Comparator {
    /// Check if `observed` satisfies `declared`.
    pub fn matches(self, declared: &Value, observed: &Value) -> bool {
        match self {
            Self::Strict => json_eq(declared, observed),
            Self::ModelAlias => match (declared.as_str(), observed.as_str()) {
                (Some(d), Some(o)) => model_alias_matches(d, o),
                _ => json_eq(declared, observed),
            },
            Self::Subset => is_subset(declared, observed),
            Self::WriteOnly => true,
        }
    }
}

/// Structural equality with numeric comparison (`10` equals `10.0`).
pub fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| json_eq(v, w)))
        }
        _ => a == b,
    }
}

/// Check if `observed` is a valid resolution of the model name `declared`.
///
/// Only the alias case is relaxed: `text-moderation-latest` matches
/// `text-moderation-007`, `gpt-4o` matches `gpt-4o-2024-08-06`, but two
/// different pinned versions never match.
pub fn model_alias_matches(declared: &str, observed: &str) -> bool {
    if declared == observed {
        return true;
    }
    let family = match declared.strip_suffix(LATEST) {
        Some(family) => family,
        // Already pinned
        None if VERSION_SUFFIX.is_match(declared.rsplit('-').next().unwrap_or_default()) => {
            return false;
        }
        None => declared,
    };
    observed
        .strip_prefix(family)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|version| VERSION_SUFFIX.is_match(version))
}

/// Check if `declared` is structurally contained in `observed`.
///
/// Objects: every declared key is present and contained. Arrays: same
/// length, element-wise containment. Scalars: [`json_eq`]. A declared
/// `null` is satisfied by anything.
pub fn is_subset(declared: &Value, observed: &Value) -> bool {
    match (declared, observed) {
        (Value::Null, _) => true,
        (Value::Object(d), Value::Object(o)) => d
            .iter()
            .all(|(k, v)| o.get(k).is_some_and(|w| is_subset(v, w)) || v.is_null()),
        (Value::Array(d), Value::Array(o)) => {
            d.len() == o.len() && d.iter().zip(o).all(|(a, b)| is_subset(a, b))
        }
        _ => json_eq(declared, observed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_latest_alias_matches_pinned_version() {
        assert!(model_alias_matches("text-moderation-latest", "text-moderation-007"));
        assert!(model_alias_matches("omni-moderation-latest", "omni-moderation-2024-09-26"));
        assert!(model_alias_matches("gpt-4o", "gpt-4o-2024-08-06"));
        assert!(model_alias_matches("gpt-4", "gpt-4-0613"));
    }

    #[test]
    fn test_pinned_versions_do_not_match() {
        assert!(!model_alias_matches("text-moderation-007", "text-moderation-003"));
        assert!(!model_alias_matches("gpt-4", "gpt-4o-2024-08-06"));
        assert!(!model_alias_matches("text-moderation-latest", "omni-moderation-latest"));
        assert!(!model_alias_matches("gpt-4o", "gpt-4o-mini"));
    }

    #[test]
    fn test_numbers_compare_by_value() {
        assert!(json_eq(&json!(10), &json!(10.0)));
        assert!(json_eq(&json!({"a": [1, 2]}), &json!({"a": [1.0, 2]})));
        assert!(!json_eq(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_subset_tolerates_server_defaults() {
        let declared = json!([{"type": "file_search"}]);
        let observed = json!([{
            "type": "file_search",
            "file_search": {"max_num_results": 20, "ranking_options": {"ranker": "auto"}}
        }]);
        assert!(is_subset(&declared, &observed));
        assert!(!is_subset(&json!([{"type": "code_interpreter"}]), &observed));
        assert!(!is_subset(&json!([]), &observed));
    }

    #[test]
    fn test_comparator_dispatch() {
        assert!(Comparator::ModelAlias.matches(&json!("gpt-4o"), &json!("gpt-4o-2024-05-13")));
        assert!(!Comparator::Strict.matches(&json!("gpt-4o"), &json!("gpt-4o-2024-05-13")));
        assert!(Comparator::Subset.matches(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(Comparator::WriteOnly.matches(
            &json!("hello"),
            &json!([{"type": "text", "text": {"value": "hello", "annotations": []}}])
        ));
    }
}
