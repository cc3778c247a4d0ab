//! Execution planner - dependency levels, targets and the plan model

use crate::diff::Diff;
use crate::reference;
use crate::snapshot::Entry;
use crate::types::{Action, Attributes};
use apikit::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A declared resource instance
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    /// Unique name within the manifest
    pub name: String,
    pub kind: String,
    /// Declared attributes, possibly holding references
    pub declared: Attributes,
    /// Explicit ordering edges
    pub depends_on: Vec<String>,
    /// Remote identity to bind instead of creating
    pub import: Option<String>,
}

impl Instance {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, declared: Attributes) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            declared,
            depends_on: Vec::new(),
            import: None,
        }
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on.extend(names.iter().map(|n| (*n).to_string()));
        self
    }

    pub fn import(mut self, identity: impl Into<String>) -> Self {
        self.import = Some(identity.into());
        self
    }

    /// Explicit dependencies plus every referenced instance
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps: BTreeSet<String> = self.depends_on.iter().cloned().collect();
        deps.extend(reference::targets(&Value::Object(self.declared.clone())));
        deps.into_iter().collect()
    }

    /// Check if the instance matches a target filter
    pub fn matches_target(&self, target: Option<&str>) -> bool {
        matches_filter(&self.kind, &self.name, target)
    }
}

/// Group instances into dependency levels.
///
/// Every instance in level `n` depends only on instances in earlier levels,
/// so a level can run in parallel. Duplicate names, unknown dependencies and
/// cycles are validation errors.
pub fn levels(instances: &[Instance]) -> Result<Vec<Vec<usize>>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, instance) in instances.iter().enumerate() {
        if index.insert(instance.name.as_str(), i).is_some() {
            return Err(Error::validation(format!(
                "duplicate resource name '{}'",
                instance.name
            )));
        }
    }

    let mut indegree = vec![0usize; instances.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); instances.len()];
    for (i, instance) in instances.iter().enumerate() {
        for dep in instance.dependencies() {
            let Some(&j) = index.get(dep.as_str()) else {
                return Err(Error::validation(format!(
                    "'{}' depends on unknown resource '{dep}'",
                    instance.name
                )));
            };
            if i == j {
                return Err(Error::validation(format!(
                    "'{}' depends on itself",
                    instance.name
                )));
            }
            indegree[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut levels = Vec::new();
    let mut ready: Vec<usize> = (0..instances.len()).filter(|&i| indegree[i] == 0).collect();
    let mut placed = 0;
    while !ready.is_empty() {
        placed += ready.len();
        let mut next = Vec::new();
        for &i in &ready {
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    next.push(d);
                }
            }
        }
        next.sort_unstable();
        levels.push(ready);
        ready = next;
    }

    if placed != instances.len() {
        let mut cycle: Vec<&str> = (0..instances.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| instances[i].name.as_str())
            .collect();
        cycle.sort_unstable();
        return Err(Error::validation(format!(
            "dependency cycle between: {}",
            cycle.join(", ")
        )));
    }

    Ok(levels)
}

/// Order orphaned snapshot entries for deletion: dependents before their
/// dependencies. Each inner vector can be deleted in parallel.
pub fn orphan_levels(entries: &BTreeMap<String, Entry>, orphans: &[String]) -> Vec<Vec<String>> {
    let set: BTreeSet<&str> = orphans.iter().map(String::as_str).collect();
    // Number of orphans still depending on each orphan
    let mut dependents: BTreeMap<&str, usize> = set.iter().map(|n| (*n, 0)).collect();
    for name in &set {
        if let Some(entry) = entries.get(*name) {
            for dep in &entry.depends_on {
                if let Some(count) = dependents.get_mut(dep.as_str()) {
                    *count += 1;
                }
            }
        }
    }

    let mut remaining = set;
    let mut levels = Vec::new();
    while !remaining.is_empty() {
        let level: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|n| dependents.get(n).copied().unwrap_or(0) == 0)
            .collect();
        // A cycle in recorded state: delete the rest together
        let level = if level.is_empty() {
            remaining.iter().copied().collect()
        } else {
            level
        };
        for name in &level {
            remaining.remove(name);
            if let Some(entry) = entries.get(*name) {
                for dep in &entry.depends_on {
                    if let Some(count) = dependents.get_mut(dep.as_str()) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
        }
        levels.push(level.into_iter().map(String::from).collect());
    }
    levels
}

/// Parse a target string like "kind.name" into (kind, name)
fn parse_target(target: &str) -> (Option<String>, Option<String>) {
    let parts: Vec<&str> = target.split('.').collect();
    match parts.len() {
        1 => (Some(parts[0].to_string()), None),
        2 => (Some(parts[0].to_string()), Some(parts[1].to_string())),
        _ => (None, Some(target.to_string())),
    }
}

/// Check if a (kind, name) pair matches the target filter.
///
/// A single word matches either the kind or the instance name.
pub fn matches_filter(kind: &str, name: &str, target: Option<&str>) -> bool {
    let Some(target) = target else {
        return true;
    };
    match parse_target(target) {
        (Some(k), None) => kind == k || name == k,
        (Some(k), Some(n)) => kind == k && name == n,
        (None, Some(n)) => name == n,
        (None, None) => true,
    }
}

/// Planned operation for one instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub name: String,
    pub kind: String,
    pub action: Action,
    pub identity: Option<String>,
    pub diff: Diff,
    /// Extra context, e.g. self-healing or delete policy
    pub note: Option<String>,
    /// Why the instance could not be planned
    pub error: Option<String>,
}

impl Step {
    pub fn new(name: &str, kind: &str, action: Action) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            action,
            identity: None,
            diff: Diff::default(),
            note: None,
            error: None,
        }
    }

    pub fn with_identity(mut self, identity: Option<String>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_diff(mut self, diff: Diff) -> Self {
        self.diff = diff;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// The planned operations of a pass, in execution order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    /// Steps that change remote or recorded state
    pub fn changes(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.action.is_change())
    }

    /// Check if the plan changes anything
    pub fn has_changes(&self) -> bool {
        self.changes().next().is_some()
    }

    /// Number of steps with an action
    pub fn count(&self, action: Action) -> usize {
        self.steps.iter().filter(|s| s.action == action).count()
    }

    /// Steps that could not be planned
    pub fn errors(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.error.is_some())
    }

    /// Look up the step of an instance
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(name: &str, declared: Value) -> Instance {
        Instance::new(name, "test", declared.as_object().cloned().unwrap())
    }

    fn names(instances: &[Instance], levels: &[Vec<usize>]) -> Vec<Vec<String>> {
        levels
            .iter()
            .map(|l| l.iter().map(|&i| instances[i].name.clone()).collect())
            .collect()
    }

    #[test]
    fn test_levels_follow_references() {
        let instances = vec![
            instance("limit", json!({"project_id": {"$ref": "proj"}})),
            instance("proj", json!({"name": "demo"})),
            instance("other", json!({"name": "x"})),
        ];
        let levels = levels(&instances).unwrap();
        assert_eq!(
            names(&instances, &levels),
            vec![vec!["proj", "other"], vec!["limit"]]
        );
    }

    #[test]
    fn test_explicit_depends_on() {
        let instances = vec![
            instance("b", json!({})).depends_on(&["a"]),
            instance("a", json!({})),
        ];
        let levels = levels(&instances).unwrap();
        assert_eq!(names(&instances, &levels), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn test_cycle_is_validation_error() {
        let instances = vec![
            instance("a", json!({"x": {"$ref": "b"}})),
            instance("b", json!({"x": {"$ref": "a"}})),
        ];
        let err = levels(&instances).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn test_unknown_dependency_and_duplicates() {
        let err = levels(&[instance("a", json!({"x": {"$ref": "ghost"}}))]).unwrap_err();
        assert!(err.to_string().contains("ghost"));

        let err = levels(&[instance("a", json!({})), instance("a", json!({}))]).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_orphans_delete_dependents_first() {
        let mut entries = BTreeMap::new();
        entries.insert("proj".to_string(), Entry::default());
        entries.insert(
            "limit".to_string(),
            Entry {
                depends_on: vec!["proj".into()],
                ..Entry::default()
            },
        );
        entries.insert("kept".to_string(), Entry::default());

        let levels = orphan_levels(&entries, &["proj".into(), "limit".into()]);
        assert_eq!(levels, vec![vec!["limit".to_string()], vec!["proj".to_string()]]);
    }

    #[test]
    fn test_target_matching() {
        assert!(matches_filter("project", "demo", None));
        assert!(matches_filter("project", "demo", Some("project")));
        assert!(matches_filter("project", "demo", Some("demo")));
        assert!(matches_filter("project", "demo", Some("project.demo")));
        assert!(!matches_filter("project", "demo", Some("project.other")));
        assert!(!matches_filter("invite", "demo", Some("project.demo")));
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("file"), (Some("file".to_string()), None));
        assert_eq!(
            parse_target("file.train"),
            (Some("file".to_string()), Some("train".to_string()))
        );
        assert_eq!(parse_target("a.b.c"), (None, Some("a.b.c".to_string())));
    }
}
