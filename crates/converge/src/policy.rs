//! Idempotent delete policy
//!
//! The platform's lifecycle is narrower than the declarative one: some
//! objects cannot be deleted at all, some only until they reach a terminal
//! status. Each kind declares a [`DeleteRule`] that reinterprets "delete"
//! for that kind. A remote `NotFound` always satisfies the intent.

use crate::controller::Controller;
use crate::types::{Attributes, Lifecycle};
use apikit::Result;
use serde_json::Value;
use std::fmt;

/// How a kind is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteRule {
    /// Call the controller's `delete`
    Remote,
    /// The object always exists; call `reset` to restore platform defaults
    ResetToDefault,
    /// Nothing to delete remotely; forget the local entry
    LocalOnly,
    /// Local-only once `field` holds one of `terminal`; otherwise `delete`
    /// (which cancels, archives, etc.)
    LocalOnlyWhenTerminal {
        field: &'static str,
        terminal: &'static [&'static str],
    },
}

/// Concrete step chosen for one delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStep {
    Remote,
    Reset,
    Local,
}

impl fmt::Display for DeleteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => write!(f, "remote delete"),
            Self::Reset => write!(f, "reset to platform defaults"),
            Self::Local => write!(f, "local only"),
        }
    }
}

/// What a successful delete actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Reset,
    /// No remote call was needed
    LocalOnly,
    /// The remote object was already gone
    AlreadyGone,
}

impl DeleteRule {
    /// Check if `observed` is in a terminal status for this rule
    pub fn is_terminal(&self, observed: &Attributes) -> bool {
        match self {
            Self::LocalOnlyWhenTerminal { field, terminal } => observed
                .get(*field)
                .and_then(Value::as_str)
                .is_some_and(|status| terminal.contains(&status)),
            _ => false,
        }
    }

    /// Choose the step for an object in state `observed`
    pub fn step(&self, observed: &Attributes) -> DeleteStep {
        match self {
            Self::Remote => DeleteStep::Remote,
            Self::ResetToDefault => DeleteStep::Reset,
            Self::LocalOnly => DeleteStep::Local,
            Self::LocalOnlyWhenTerminal { .. } if self.is_terminal(observed) => DeleteStep::Local,
            Self::LocalOnlyWhenTerminal { .. } => DeleteStep::Remote,
        }
    }
}

/// The rule in force for a controller.
///
/// Write-once results and data sources never have a remote delete.
pub fn effective_rule(controller: &dyn Controller) -> DeleteRule {
    match controller.lifecycle() {
        Lifecycle::WriteOnce | Lifecycle::DataSource => DeleteRule::LocalOnly,
        Lifecycle::Mutable => controller.delete_rule(),
    }
}

/// Delete `identity` according to the controller's rule.
///
/// If a remote delete under a terminal-aware rule fails, the object is
/// re-read: reaching a terminal status in the meantime (an invitation
/// accepted after the plan was made) satisfies the delete.
pub fn delete(
    controller: &dyn Controller,
    identity: &str,
    observed: &Attributes,
) -> Result<DeleteOutcome> {
    let rule = effective_rule(controller);
    let step = rule.step(observed);
    log::debug!("Deleting {} {identity}: {step}", controller.kind());

    let result = match step {
        DeleteStep::Local => return Ok(DeleteOutcome::LocalOnly),
        DeleteStep::Remote => controller
            .delete(identity, observed)
            .map(|()| DeleteOutcome::Deleted),
        DeleteStep::Reset => controller
            .reset(identity, observed)
            .map(|()| DeleteOutcome::Reset),
    };

    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) if e.is_not_found() => {
            log::info!("{} {identity} was already gone", controller.kind());
            Ok(DeleteOutcome::AlreadyGone)
        }
        Err(e) if matches!(rule, DeleteRule::LocalOnlyWhenTerminal { .. }) => {
            match controller.read(identity, observed) {
                Ok(fresh) if rule.is_terminal(&fresh) => {
                    log::info!(
                        "{} {identity} reached a terminal status; treating delete as satisfied",
                        controller.kind()
                    );
                    Ok(DeleteOutcome::LocalOnly)
                }
                Err(read) if read.is_not_found() => Ok(DeleteOutcome::AlreadyGone),
                _ => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{Created, Schema};
    use apikit::Error;
    use serde_json::json;
    use std::sync::Mutex;

    const TERMINAL: DeleteRule = DeleteRule::LocalOnlyWhenTerminal {
        field: "status",
        terminal: &["accepted"],
    };

    #[derive(Debug)]
    struct Scripted {
        rule: DeleteRule,
        delete_result: fn() -> Result<()>,
        read_status: &'static str,
        calls: Mutex<Vec<&'static str>>,
    }

    impl Scripted {
        fn new(rule: DeleteRule, delete_result: fn() -> Result<()>) -> Self {
            Self {
                rule,
                delete_result,
                read_status: "pending",
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Controller for Scripted {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        fn schema(&self) -> &Schema {
            &Schema::EMPTY
        }

        fn delete_rule(&self) -> DeleteRule {
            self.rule
        }

        fn create(&self, _declared: &Attributes) -> Result<Created> {
            Err(Error::state("not used"))
        }

        fn read(&self, _identity: &str, _prior: &Attributes) -> Result<Attributes> {
            self.calls.lock().unwrap().push("read");
            Ok(status(self.read_status))
        }

        fn delete(&self, _identity: &str, _observed: &Attributes) -> Result<()> {
            self.calls.lock().unwrap().push("delete");
            (self.delete_result)()
        }

        fn reset(&self, _identity: &str, _observed: &Attributes) -> Result<()> {
            self.calls.lock().unwrap().push("reset");
            Ok(())
        }
    }

    fn status(value: &str) -> Attributes {
        json!({"status": value}).as_object().cloned().unwrap()
    }

    fn ok() -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_terminal_object_is_local_only() {
        let controller = Scripted::new(TERMINAL, ok);
        let outcome = delete(&controller, "inv_1", &status("accepted")).unwrap();
        assert_eq!(outcome, DeleteOutcome::LocalOnly);
        assert!(controller.calls().is_empty());
    }

    #[test]
    fn test_non_terminal_object_is_deleted_remotely() {
        let controller = Scripted::new(TERMINAL, ok);
        let outcome = delete(&controller, "inv_1", &status("pending")).unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert_eq!(controller.calls(), vec!["delete"]);
    }

    #[test]
    fn test_reset_rule_never_deletes() {
        let controller = Scripted::new(DeleteRule::ResetToDefault, ok);
        let outcome = delete(&controller, "rl", &Attributes::new()).unwrap();
        assert_eq!(outcome, DeleteOutcome::Reset);
        assert_eq!(controller.calls(), vec!["reset"]);
    }

    #[test]
    fn test_not_found_is_success() {
        let controller = Scripted::new(DeleteRule::Remote, || Err(Error::not_found("gone")));
        let outcome = delete(&controller, "x", &Attributes::new()).unwrap();
        assert_eq!(outcome, DeleteOutcome::AlreadyGone);
    }

    #[test]
    fn test_failure_forgiven_when_object_became_terminal() {
        let mut controller = Scripted::new(TERMINAL, || {
            Err(Error::validation("Cannot delete an accepted invite"))
        });
        controller.read_status = "accepted";

        let outcome = delete(&controller, "inv_1", &status("pending")).unwrap();
        assert_eq!(outcome, DeleteOutcome::LocalOnly);
        assert_eq!(controller.calls(), vec!["delete", "read"]);
    }

    #[test]
    fn test_failure_surfaces_when_still_pending() {
        let controller = Scripted::new(TERMINAL, || Err(Error::validation("nope")));
        let err = delete(&controller, "inv_1", &status("pending")).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_remote_rule_surfaces_errors() {
        let controller = Scripted::new(DeleteRule::Remote, || Err(Error::validation("in use")));
        assert!(delete(&controller, "x", &Attributes::new()).is_err());
    }
}
