//! Controller contract for remote resource kinds
//!
//! A Controller knows how to create, read, update and delete one kind of
//! remote object. The driver decides *which* operation runs; the controller
//! only performs it.

use crate::diff::Diff;
use crate::drift::Comparator;
use crate::policy::DeleteRule;
use crate::types::{Attributes, Lifecycle};
use apikit::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// How a changed attribute is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrMode {
    /// Applied in place by `update`
    Updatable,
    /// Requires delete then create
    ForcesReplacement,
}

/// Per-kind attribute rules
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    /// Attributes with an explicit mode. Unlisted attributes force replacement.
    pub attributes: &'static [(&'static str, AttrMode)],
    /// Drift comparators. Unlisted attributes compare strictly.
    pub drift: &'static [(&'static str, Comparator)],
}

impl Schema {
    /// Schema where every attribute forces replacement
    pub const EMPTY: Self = Self::new(&[]);

    pub const fn new(attributes: &'static [(&'static str, AttrMode)]) -> Self {
        Self {
            attributes,
            drift: &[],
        }
    }

    pub const fn with_drift(mut self, drift: &'static [(&'static str, Comparator)]) -> Self {
        self.drift = drift;
        self
    }

    /// Mode of an attribute
    pub fn mode(&self, name: &str) -> AttrMode {
        self.attributes
            .iter()
            .find(|(n, _)| *n == name)
            .map_or(AttrMode::ForcesReplacement, |(_, m)| *m)
    }

    /// Comparator of an attribute
    pub fn comparator(&self, name: &str) -> Comparator {
        self.drift
            .iter()
            .find(|(n, _)| *n == name)
            .map_or(Comparator::Strict, |(_, c)| *c)
    }

    /// Names listed in the schema
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.attributes.iter().map(|(n, _)| *n)
    }
}

/// Result of a successful create
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub identity: String,
    pub observed: Attributes,
}

/// Result of importing a pre-existing remote object
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Imported {
    /// Declared attributes reconstructed from the remote object
    pub declared: Attributes,
    pub observed: Attributes,
    /// Attributes filled with a placeholder; their diff is suppressed
    pub suppressed: Vec<String>,
}

/// Core trait for resource kinds
///
/// `declared` is always fully resolved when a controller sees it: every
/// cross-instance reference has been substituted by the driver.
pub trait Controller: Send + Sync + fmt::Debug {
    /// Resource kind, as written in the manifest
    fn kind(&self) -> &'static str;

    /// Attribute modes and drift comparators
    fn schema(&self) -> &Schema;

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::Mutable
    }

    /// How a delete of this kind is carried out
    fn delete_rule(&self) -> DeleteRule {
        DeleteRule::Remote
    }

    /// Reject illegal attribute combinations before any remote call
    fn validate(&self, _declared: &Attributes) -> Result<()> {
        Ok(())
    }

    /// Create the remote object.
    ///
    /// For data sources this performs the lookup and runs on every pass.
    fn create(&self, declared: &Attributes) -> Result<Created>;

    /// Read the remote object. A vanished object is `Error::NotFound`.
    fn read(&self, identity: &str, prior: &Attributes) -> Result<Attributes>;

    /// Apply the updatable attributes of `diff` in place.
    ///
    /// `observed` is the payload from the read-before-plan.
    fn update(
        &self,
        identity: &str,
        declared: &Attributes,
        diff: &Diff,
        observed: &Attributes,
    ) -> Result<Attributes> {
        let _ = (declared, diff, observed);
        Err(Error::state(format!(
            "{} {identity} cannot be updated in place",
            self.kind()
        )))
    }

    /// Delete the remote object
    fn delete(&self, identity: &str, observed: &Attributes) -> Result<()>;

    /// Restore the remote object to platform defaults (for kinds that can't be deleted)
    fn reset(&self, identity: &str, observed: &Attributes) -> Result<()> {
        let _ = observed;
        Err(Error::state(format!(
            "{} {identity} has no reset operation",
            self.kind()
        )))
    }

    /// Bind a pre-existing remote object
    ///
    /// The default reads the object and declares every schema attribute it
    /// carries.
    fn import(&self, identity: &str) -> Result<Imported> {
        let observed = self.read(identity, &Attributes::new())?;
        let declared = self
            .schema()
            .names()
            .filter_map(|name| {
                observed
                    .get(name)
                    .filter(|v| !v.is_null())
                    .map(|v| (name.to_string(), v.clone()))
            })
            .collect();
        Ok(Imported {
            declared,
            observed,
            suppressed: Vec::new(),
        })
    }
}

/// A shared controller
pub type SharedController = Arc<dyn Controller>;

/// Controllers keyed by kind
#[derive(Debug, Default, Clone)]
pub struct Registry {
    controllers: HashMap<&'static str, SharedController>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller, replacing any previous one of the same kind
    pub fn register(&mut self, controller: impl Controller + 'static) -> &mut Self {
        self.controllers
            .insert(controller.kind(), Arc::new(controller));
        self
    }

    /// Look up a controller
    pub fn get(&self, kind: &str) -> Result<&SharedController> {
        self.controllers
            .get(kind)
            .ok_or_else(|| Error::validation(format!("unknown resource type '{kind}'")))
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.controllers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCHEMA: Schema = Schema::new(&[("name", AttrMode::Updatable)])
        .with_drift(&[("model", Comparator::ModelAlias)]);

    #[derive(Debug)]
    struct Named;

    impl Controller for Named {
        fn kind(&self) -> &'static str {
            "named"
        }

        fn schema(&self) -> &Schema {
            &SCHEMA
        }

        fn create(&self, _declared: &Attributes) -> Result<Created> {
            Err(Error::state("not used"))
        }

        fn read(&self, identity: &str, _prior: &Attributes) -> Result<Attributes> {
            Ok(json!({"id": identity, "name": "demo", "status": "active"})
                .as_object()
                .cloned()
                .unwrap())
        }

        fn delete(&self, _identity: &str, _observed: &Attributes) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_schema_defaults() {
        assert_eq!(SCHEMA.mode("name"), AttrMode::Updatable);
        assert_eq!(SCHEMA.mode("other"), AttrMode::ForcesReplacement);
        assert_eq!(SCHEMA.comparator("model"), Comparator::ModelAlias);
        assert_eq!(SCHEMA.comparator("name"), Comparator::Strict);
    }

    #[test]
    fn test_default_import_declares_schema_attributes() {
        let imported = Named.import("x_1").unwrap();
        assert_eq!(imported.declared.len(), 1);
        assert_eq!(imported.declared["name"], "demo");
        assert_eq!(imported.observed["status"], "active");
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = Registry::new();
        registry.register(Named);
        assert!(registry.get("named").is_ok());
        assert!(matches!(
            registry.get("nope").unwrap_err(),
            Error::Validation { .. }
        ));
        assert_eq!(registry.kinds(), vec!["named"]);
    }

    #[test]
    fn test_default_update_and_reset_are_state_errors() {
        let diff = Diff::default();
        assert!(matches!(
            Named.update("x_1", &Attributes::new(), &diff, &Attributes::new()).unwrap_err(),
            Error::State { .. }
        ));
        assert!(matches!(
            Named.reset("x_1", &Attributes::new()).unwrap_err(),
            Error::State { .. }
        ));
    }
}
