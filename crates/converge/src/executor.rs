//! Reconciliation driver - plans and executes a pass
//!
//! Per declared instance, in dependency order:
//! read-before-plan → diff → select action → execute → commit.
//! Instances in the same dependency level run in parallel on a bounded
//! pool. Orphaned snapshot entries are deleted afterwards, dependents
//! first.
//!
//! Every controller operation is attempted once. Transient failures are
//! retried by the client, one HTTP call at a time, so an operation made of
//! several calls never repeats a call that already succeeded.

use crate::context::{CancelToken, ConfirmCallback, ProgressCallback};
use crate::controller::{Controller, Created, Registry};
use crate::diff::{self, Applied, Diff};
use crate::planner::{self, Instance, Plan, Step};
use crate::policy::{self, DeleteOutcome};
use crate::reference;
use crate::snapshot::{Entry, SnapshotStore};
use crate::types::{Action, ApplyResult, Attributes, ExecuteOptions, ExecuteSummary, Lifecycle};
use apikit::Error;
use rayon::prelude::*;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error as ThisError;

/// A failed operation on one instance, with the raw remote message
#[derive(Debug, ThisError)]
#[error("{instance} ({kind}) {operation} failed: {source}")]
pub struct OperationError {
    pub instance: String,
    pub kind: String,
    pub operation: &'static str,
    pub source: Error,
}

/// Result of one instance in a pass
#[derive(Debug, Clone)]
pub struct Outcome {
    pub step: Step,
    pub result: ApplyResult,
}

/// Everything a pass did
#[derive(Debug, Clone, Default)]
pub struct Report {
    /// The plan shown before execution
    pub plan: Plan,
    pub outcomes: Vec<Outcome>,
    pub summary: ExecuteSummary,
}

impl Report {
    fn push(&mut self, outcome: Outcome) {
        self.summary.add_result(&outcome.result);
        self.outcomes.push(outcome);
    }

    /// Outcomes that failed
    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| !o.result.is_success())
    }

    /// Result of an instance
    pub fn result(&self, name: &str) -> Option<&ApplyResult> {
        self.outcomes
            .iter()
            .find(|o| o.step.name == name)
            .map(|o| &o.result)
    }
}

/// Drives controllers against an injected snapshot store
pub struct Driver<'a> {
    registry: &'a Registry,
    store: &'a SnapshotStore,
    options: ExecuteOptions,
    cancel: CancelToken,
}

impl<'a> Driver<'a> {
    pub fn new(registry: &'a Registry, store: &'a SnapshotStore, options: ExecuteOptions) -> Self {
        Self {
            registry,
            store,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Use a cancellation token shared with the caller
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn pool(&self) -> anyhow::Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.jobs.max(1))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create thread pool: {}", e))
    }

    fn target(&self) -> Option<&str> {
        self.options.target.as_deref()
    }

    /// Names recorded in the snapshot but no longer declared
    fn orphans(&self, instances: &[Instance]) -> Vec<String> {
        let declared: HashSet<&str> = instances.iter().map(|i| i.name.as_str()).collect();
        let snapshot = self.store.snapshot();
        snapshot
            .entries
            .iter()
            .filter(|(name, entry)| {
                !declared.contains(name.as_str())
                    && planner::matches_filter(&entry.kind, name, self.target())
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Compute the plan of a pass without changing anything.
    ///
    /// Existing objects are read so remote drift shows up in the plan. An
    /// instance that cannot be planned gets a step carrying the error; the
    /// rest of the plan is unaffected.
    pub fn plan(&self, instances: &[Instance]) -> anyhow::Result<Plan> {
        let levels = planner::levels(instances)?;
        let order: Vec<&Instance> = levels
            .iter()
            .flatten()
            .map(|&i| &instances[i])
            .filter(|i| i.matches_target(self.target()))
            .collect();

        let pool = self.pool()?;
        let steps: Vec<Result<Step, OperationError>> =
            pool.install(|| order.par_iter().map(|i| self.plan_instance(i)).collect());

        let mut plan = Plan::default();
        for (instance, step) in order.iter().zip(steps) {
            plan.steps.push(step.unwrap_or_else(|e| {
                Step::new(&instance.name, &instance.kind, Action::NoOp).with_error(e.to_string())
            }));
        }

        let snapshot = self.store.snapshot();
        for level in planner::orphan_levels(&snapshot.entries, &self.orphans(instances)) {
            for name in level {
                let Some(entry) = snapshot.entries.get(&name) else {
                    continue;
                };
                let note = match self.registry.get(&entry.kind) {
                    Ok(controller) => policy::effective_rule(controller.as_ref())
                        .step(&entry.observed)
                        .to_string(),
                    Err(e) => e.to_string(),
                };
                plan.steps.push(
                    Step::new(&name, &entry.kind, Action::Delete)
                        .with_identity(Some(entry.identity.clone()))
                        .with_note(note),
                );
            }
        }

        Ok(plan)
    }

    /// Plan, confirm, then run a pass.
    ///
    /// Honors `dry_run` by returning after planning.
    pub fn execute<P, C>(
        &self,
        instances: &[Instance],
        progress: &mut P,
        confirm: &mut C,
    ) -> anyhow::Result<Report>
    where
        P: ProgressCallback,
        C: ConfirmCallback,
    {
        let plan = self.plan(instances)?;

        if self.options.dry_run {
            return Ok(Report {
                plan,
                ..Report::default()
            });
        }

        if plan.has_changes() && !confirm.confirm("Apply these changes?")? {
            let mut report = Report {
                plan: plan.clone(),
                ..Report::default()
            };
            for step in plan.changes() {
                report.push(Outcome {
                    step: step.clone(),
                    result: ApplyResult::Skipped {
                        reason: "Declined".into(),
                    },
                });
            }
            return Ok(report);
        }

        let mut report = self.run(instances, progress)?;
        report.plan = plan;
        Ok(report)
    }

    /// Run a pass without planning or confirmation
    pub fn run<P: ProgressCallback>(
        &self,
        instances: &[Instance],
        progress: &mut P,
    ) -> anyhow::Result<Report> {
        let levels = planner::levels(instances)?;
        let pool = self.pool()?;
        let failed: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
        let mut report = Report::default();

        for (n, level) in levels.iter().enumerate() {
            let selected: Vec<&Instance> = level
                .iter()
                .map(|&i| &instances[i])
                .filter(|i| i.matches_target(self.target()))
                .collect();
            if selected.is_empty() {
                continue;
            }

            progress.on_level_start(n, selected.len());
            let outcomes: Vec<Outcome> = pool.install(|| {
                selected
                    .par_iter()
                    .map(|instance| self.reconcile_guarded(instance, &failed))
                    .collect()
            });
            for outcome in outcomes {
                progress.on_instance_complete(&outcome.step.name, outcome.step.action, &outcome.result);
                report.push(outcome);
            }
            progress.on_level_complete();
        }

        // Orphans: each one is blocked by the orphans that depended on it
        let snapshot = self.store.snapshot();
        let orphans = self.orphans(instances);
        let mut blockers: HashMap<&str, Vec<&str>> = HashMap::new();
        for name in &orphans {
            if let Some(entry) = snapshot.entries.get(name) {
                for dep in &entry.depends_on {
                    blockers.entry(dep.as_str()).or_default().push(name.as_str());
                }
            }
        }

        let base = levels.len();
        for (n, level) in planner::orphan_levels(&snapshot.entries, &orphans)
            .into_iter()
            .enumerate()
        {
            progress.on_level_start(base + n, level.len());
            let outcomes: Vec<Outcome> = pool.install(|| {
                level
                    .par_iter()
                    .filter_map(|name| snapshot.entries.get(name).map(|e| (name, e)))
                    .map(|(name, entry)| {
                        let blocked = blockers.get(name.as_str()).map_or(&[][..], Vec::as_slice);
                        self.destroy_guarded(name, entry, blocked, &failed)
                    })
                    .collect()
            });
            for outcome in outcomes {
                progress.on_instance_complete(&outcome.step.name, outcome.step.action, &outcome.result);
                report.push(outcome);
            }
            progress.on_level_complete();
        }

        Ok(report)
    }

    fn reconcile_guarded(&self, instance: &Instance, failed: &Mutex<HashSet<String>>) -> Outcome {
        let mut step = Step::new(&instance.name, &instance.kind, Action::NoOp);

        if self.cancel.is_cancelled() {
            return Outcome {
                step,
                result: ApplyResult::Skipped {
                    reason: "Cancelled".into(),
                },
            };
        }

        let blocked = {
            let failed = lock(failed);
            instance
                .dependencies()
                .into_iter()
                .find(|dep| failed.contains(dep))
        };
        if let Some(dep) = blocked {
            lock(failed).insert(instance.name.clone());
            return Outcome {
                step,
                result: ApplyResult::Skipped {
                    reason: format!("Dependency '{dep}' failed"),
                },
            };
        }

        let result = match self.reconcile(instance, &mut step) {
            Ok(result) => result,
            Err(e) => {
                log::error!("{e}");
                lock(failed).insert(instance.name.clone());
                ApplyResult::Failed {
                    error: e.to_string(),
                }
            }
        };
        Outcome { step, result }
    }

    fn destroy_guarded(
        &self,
        name: &str,
        entry: &Entry,
        blocked_by: &[&str],
        failed: &Mutex<HashSet<String>>,
    ) -> Outcome {
        let step = Step::new(name, &entry.kind, Action::Delete).with_identity(Some(entry.identity.clone()));

        if self.cancel.is_cancelled() {
            return Outcome {
                step,
                result: ApplyResult::Skipped {
                    reason: "Cancelled".into(),
                },
            };
        }

        let blocker = {
            let failed = lock(failed);
            blocked_by.iter().find(|d| failed.contains(**d)).copied()
        };
        if let Some(dependent) = blocker {
            lock(failed).insert(name.to_string());
            return Outcome {
                step,
                result: ApplyResult::Skipped {
                    reason: format!("Dependent '{dependent}' was not deleted"),
                },
            };
        }

        let result = match self.destroy(name, entry) {
            Ok(result) => result,
            Err(e) => {
                log::error!("{e}");
                lock(failed).insert(name.to_string());
                ApplyResult::Failed {
                    error: e.to_string(),
                }
            }
        };
        Outcome { step, result }
    }

    /// Run a controller operation once, labelling its failure
    fn attempt<T>(
        &self,
        instance: &str,
        kind: &str,
        operation: &'static str,
        op: impl FnOnce() -> apikit::Result<T>,
    ) -> Result<T, OperationError> {
        op().map_err(|source| OperationError {
            instance: instance.to_string(),
            kind: kind.to_string(),
            operation,
            source,
        })
    }

    fn fail(instance: &Instance, operation: &'static str, source: Error) -> OperationError {
        OperationError {
            instance: instance.name.clone(),
            kind: instance.kind.clone(),
            operation,
            source,
        }
    }

    /// Declared attributes with every committed reference substituted
    fn resolve(&self, instance: &Instance) -> Attributes {
        let lookup = |name: &str| self.store.get(name);
        match reference::resolve(&Value::Object(instance.declared.clone()), &lookup) {
            Value::Object(map) => map,
            _ => instance.declared.clone(),
        }
    }

    /// Record an applied declaration. Its values are real, so import
    /// placeholders no longer need suppressing.
    fn commit(
        &self,
        instance: &Instance,
        identity: String,
        observed: Attributes,
        last_applied: Attributes,
        prior: Option<&Entry>,
    ) {
        let entry = Entry {
            kind: instance.kind.clone(),
            identity,
            observed,
            last_applied_hash: diff::content_hash(&last_applied),
            last_applied,
            depends_on: instance.dependencies(),
            suppressed: Vec::new(),
            import_hash: None,
            imported: prior.is_some_and(|e| e.imported),
        };
        self.store.commit(&instance.name, entry);
    }

    fn plan_instance(&self, instance: &Instance) -> Result<Step, OperationError> {
        let controller = self
            .registry
            .get(&instance.kind)
            .map_err(|e| Self::fail(instance, "plan", e))?;
        let declared = self.resolve(instance);
        let resolved = !reference::is_unresolved(&Value::Object(declared.clone()));
        if resolved {
            controller
                .validate(&declared)
                .map_err(|e| Self::fail(instance, "validate", e))?;
        }

        let step = Step::new(&instance.name, &instance.kind, Action::NoOp);
        let entry = self.store.get(&instance.name);

        if controller.lifecycle() == Lifecycle::DataSource {
            let step = Step { action: Action::Read, ..step }.with_identity(entry.map(|e| e.identity));
            return Ok(if resolved { step } else { step.with_note("known after apply") });
        }

        let Some(entry) = entry else {
            return Ok(match &instance.import {
                Some(identity) => Step {
                    action: Action::Import,
                    ..step
                }
                .with_identity(Some(identity.clone())),
                None => Step {
                    action: Action::Create,
                    ..step
                },
            });
        };

        let observed = match self.attempt(&instance.name, &instance.kind, "read", || {
            controller.read(&entry.identity, &entry.observed)
        }) {
            Ok(observed) => observed,
            Err(e) if e.source.is_not_found() => {
                return Ok(Step {
                    action: Action::Create,
                    ..step
                }
                .with_identity(Some(entry.identity))
                .with_note("vanished remotely; will be recreated"));
            }
            Err(e) => return Err(e),
        };

        let diff = self.diff(controller.as_ref(), &declared, &entry, &observed);
        let step = step.with_identity(Some(entry.identity.clone()));
        Ok(if diff.is_empty() {
            step
        } else if diff.requires_replacement() {
            let note = format!(
                "old object: {}",
                policy::effective_rule(controller.as_ref()).step(&observed)
            );
            Step {
                action: Action::Replace,
                ..step
            }
            .with_diff(diff)
            .with_note(note)
        } else {
            Step {
                action: Action::Update,
                ..step
            }
            .with_diff(diff)
        })
    }

    fn diff(&self, controller: &dyn Controller, declared: &Attributes, entry: &Entry, observed: &Attributes) -> Diff {
        // Placeholders stand in for the declaration seen at import only
        let suppressed: &[String] = match &entry.import_hash {
            Some(hash) if *hash == diff::content_hash(declared) => &entry.suppressed,
            _ => &[],
        };
        diff::compute(
            controller.schema(),
            declared,
            Applied {
                attributes: &entry.last_applied,
                hash: &entry.last_applied_hash,
            },
            observed,
            suppressed,
        )
    }

    fn reconcile(&self, instance: &Instance, step: &mut Step) -> Result<ApplyResult, OperationError> {
        let name = instance.name.as_str();
        let kind = instance.kind.as_str();
        let controller = self
            .registry
            .get(kind)
            .map_err(|e| Self::fail(instance, "plan", e))?;
        let controller = controller.as_ref();

        let declared = self.resolve(instance);
        let unresolved = reference::targets(&Value::Object(declared.clone()));
        if !unresolved.is_empty() {
            return Err(Self::fail(
                instance,
                "plan",
                Error::validation(format!(
                    "unresolved reference to {}",
                    unresolved.join(", ")
                )),
            ));
        }
        controller
            .validate(&declared)
            .map_err(|e| Self::fail(instance, "validate", e))?;

        let mut entry = self.store.get(name);

        if controller.lifecycle() == Lifecycle::DataSource {
            step.action = Action::Read;
            let Created { identity, observed } =
                self.attempt(name, kind, "read", || controller.create(&declared))?;
            step.identity = Some(identity.clone());
            self.commit(instance, identity, observed, declared, entry.as_ref());
            return Ok(ApplyResult::Refreshed);
        }

        let mut imported = false;
        if entry.is_none()
            && let Some(identity) = &instance.import
        {
            step.action = Action::Import;
            step.identity = Some(identity.clone());
            let result = self.attempt(name, kind, "import", || controller.import(identity))?;
            let new = Entry {
                kind: kind.to_string(),
                identity: identity.clone(),
                last_applied_hash: diff::content_hash(&result.declared),
                observed: result.observed,
                last_applied: result.declared,
                depends_on: instance.dependencies(),
                suppressed: result.suppressed,
                import_hash: Some(diff::content_hash(&declared)),
                imported: true,
            };
            self.store.commit(name, new.clone());
            log::info!("Imported {name} ({kind}) as {identity}");
            entry = Some(new);
            imported = true;
        }

        // Read-before-plan
        let mut observed = Attributes::new();
        let mut vanished = false;
        if let Some(current) = &entry {
            step.identity = Some(current.identity.clone());
            match self.attempt(name, kind, "read", || {
                controller.read(&current.identity, &current.observed)
            }) {
                Ok(fresh) => observed = fresh,
                Err(e) if e.source.is_not_found() => {
                    log::warn!(
                        "{name} ({kind}) {} disappeared remotely; recreating",
                        current.identity
                    );
                    vanished = true;
                }
                Err(e) => return Err(e),
            }
        }
        if vanished {
            self.store.remove(name);
            step.note = Some("vanished remotely; recreated".into());
            entry = None;
        }

        let Some(entry) = entry else {
            step.action = Action::Create;
            let Created { identity, observed } =
                self.attempt(name, kind, "create", || controller.create(&declared))?;
            log::info!("Created {name} ({kind}) as {identity}");
            step.identity = Some(identity.clone());
            self.commit(instance, identity, observed, declared, None);
            return Ok(ApplyResult::Created);
        };

        let diff = self.diff(controller, &declared, &entry, &observed);
        step.diff = diff.clone();

        if diff.is_empty() {
            if observed != entry.observed {
                let mut refreshed = entry.clone();
                refreshed.observed = observed;
                self.store.commit(name, refreshed);
            }
            return Ok(if imported {
                ApplyResult::Imported
            } else {
                ApplyResult::NoChange
            });
        }

        if diff.requires_replacement() {
            step.action = Action::Replace;
            policy::delete(controller, &entry.identity, &observed)
                .map_err(|e| Self::fail(instance, "delete", e))?;
            self.store.remove(name);
            let Created { identity, observed } =
                self.attempt(name, kind, "create", || controller.create(&declared))?;
            log::info!("Replaced {name} ({kind}): {} -> {identity}", entry.identity);
            step.identity = Some(identity.clone());
            self.commit(instance, identity, observed, declared, None);
            return Ok(ApplyResult::Replaced);
        }

        step.action = Action::Update;
        let observed = match controller.lifecycle() {
            Lifecycle::Mutable => self.attempt(name, kind, "update", || {
                controller.update(&entry.identity, &declared, &diff, &observed)
            })?,
            _ => observed,
        };
        log::info!("Updated {name} ({kind})");
        self.commit(instance, entry.identity.clone(), observed, declared, Some(&entry));
        Ok(ApplyResult::Updated)
    }

    fn destroy(&self, name: &str, entry: &Entry) -> Result<ApplyResult, OperationError> {
        let fail = |operation: &'static str, source: Error| OperationError {
            instance: name.to_string(),
            kind: entry.kind.clone(),
            operation,
            source,
        };
        let controller = self.registry.get(&entry.kind).map_err(|e| fail("delete", e))?;
        let controller = controller.as_ref();

        // Fresh status decides terminal-aware rules
        let observed = match controller.lifecycle() {
            Lifecycle::Mutable => match self.attempt(name, &entry.kind, "read", || {
                controller.read(&entry.identity, &entry.observed)
            }) {
                Ok(observed) => Some(observed),
                Err(e) if e.source.is_not_found() => None,
                Err(e) => return Err(e),
            },
            _ => Some(entry.observed.clone()),
        };

        let outcome = match observed {
            None => DeleteOutcome::AlreadyGone,
            Some(observed) => {
                policy::delete(controller, &entry.identity, &observed).map_err(|e| fail("delete", e))?
            }
        };
        self.store.remove(name);
        log::info!("Deleted {name} ({}): {outcome:?}", entry.kind);
        Ok(ApplyResult::Deleted)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
