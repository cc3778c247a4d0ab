//! Execution of a pass with terminal UI integration

use anyhow::Result;
use colored::Colorize;
use converge::{ConfirmCallback, Driver, ExecuteSummary, Instance, Report};

use crate::progress::PassProgress;

use super::differ::display_plan;

/// Confirmation through an interactive prompt
pub struct Prompt;

impl ConfirmCallback for Prompt {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        use dialoguer::Confirm;

        let confirmed = Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()?;

        Ok(confirmed)
    }
}

/// Options for one pass as seen from the terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct PassOptions {
    /// Show the plan and stop
    pub dry_run: bool,
    /// No progress bar
    pub quiet: bool,
}

/// Plan, display, confirm, then run a pass
pub fn execute(
    driver: &Driver<'_>,
    instances: &[Instance],
    confirm: &mut dyn ConfirmCallback,
    opts: PassOptions,
) -> Result<Report> {
    let plan = driver.plan(instances)?;
    display_plan(&plan);

    if opts.dry_run {
        println!();
        println!("  {} Dry run - no changes made", "ℹ".blue());
        return Ok(Report {
            plan,
            ..Report::default()
        });
    }

    // Unchanged instances still run so data sources refresh
    if plan.steps.is_empty() {
        return Ok(Report {
            plan,
            ..Report::default()
        });
    }

    if plan.has_changes() && !confirm.confirm("Apply these changes?")? {
        println!();
        println!("  {} Aborted", "✗".red());
        let skipped = plan.changes().count();
        return Ok(Report {
            plan,
            summary: ExecuteSummary {
                skipped,
                ..ExecuteSummary::default()
            },
            ..Report::default()
        });
    }

    let total = plan.steps.len();
    let mut progress = if opts.quiet {
        PassProgress::hidden()
    } else {
        PassProgress::new(total)
    };
    let result = driver.run(instances, &mut progress);
    progress.finish();

    let mut report = result?;
    report.plan = plan;
    print_summary(&report.summary);
    Ok(report)
}

/// Print final summary
pub fn print_summary(summary: &ExecuteSummary) {
    println!();
    if summary.is_success() {
        println!("  {} Apply complete!", "✓".green().bold());
    } else {
        println!("  {} Apply finished with errors", "⚠".yellow().bold());
    }

    let lines = [
        (summary.created, "created"),
        (summary.updated, "updated"),
        (summary.replaced, "replaced"),
        (summary.deleted, "deleted"),
        (summary.imported, "imported"),
        (summary.refreshed, "data sources refreshed"),
        (summary.skipped, "skipped"),
    ];
    for (count, label) in lines {
        if count > 0 {
            println!("    • {count} {label}");
        }
    }
    if summary.failed > 0 {
        println!("    • {} {}", summary.failed, "failed".red());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{self, tests::platform};
    use apikit::{Method, MockTransport};
    use converge::{ApplyResult, AutoConfirm, AutoDecline, ExecuteOptions, SnapshotStore};
    use serde_json::json;

    /// Fails the test if asked
    struct NeverAsked;

    impl ConfirmCallback for NeverAsked {
        fn confirm(&mut self, prompt: &str) -> Result<bool> {
            panic!("unexpected prompt: {prompt}");
        }
    }

    fn options() -> ExecuteOptions {
        ExecuteOptions::default()
    }

    fn project() -> Instance {
        Instance::new(
            "demo",
            "project",
            json!({"name": "Demo"}).as_object().cloned().unwrap(),
        )
    }

    fn quiet() -> PassOptions {
        PassOptions {
            quiet: true,
            ..PassOptions::default()
        }
    }

    #[test]
    fn test_declined_pass_changes_nothing() {
        let mock = MockTransport::new();
        let registry = resource::registry(&platform(&mock));
        let store = SnapshotStore::new();
        let driver = Driver::new(&registry, &store, options());

        let report = execute(&driver, &[project()], &mut AutoDecline, quiet()).unwrap();
        assert_eq!(report.summary.skipped, 1);
        assert!(mock.calls().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_confirmed_pass_creates_and_records() {
        let mock = MockTransport::new();
        mock.respond(
            Method::Post,
            "/organization/projects",
            200,
            json!({"id": "proj_1", "name": "Demo", "status": "active"}),
        );
        let registry = resource::registry(&platform(&mock));
        let store = SnapshotStore::new();
        let driver = Driver::new(&registry, &store, options());

        let report = execute(&driver, &[project()], &mut AutoConfirm, quiet()).unwrap();
        assert_eq!(report.result("demo"), Some(&ApplyResult::Created));
        assert_eq!(report.summary.created, 1);
        assert_eq!(store.identity("demo").as_deref(), Some("proj_1"));
    }

    #[test]
    fn test_dry_run_never_prompts() {
        let mock = MockTransport::new();
        let registry = resource::registry(&platform(&mock));
        let store = SnapshotStore::new();
        let driver = Driver::new(&registry, &store, options());

        let opts = PassOptions {
            dry_run: true,
            quiet: true,
        };
        let report = execute(&driver, &[project()], &mut NeverAsked, opts).unwrap();
        assert_eq!(report.plan.count(converge::Action::Create), 1);
        assert!(report.outcomes.is_empty());
    }

    #[test]
    fn test_empty_manifest_does_nothing() {
        let mock = MockTransport::new();
        let registry = resource::registry(&platform(&mock));
        let store = SnapshotStore::new();
        let driver = Driver::new(&registry, &store, options());

        let report = execute(&driver, &[], &mut NeverAsked, quiet()).unwrap();
        assert!(report.outcomes.is_empty());
        assert!(mock.calls().is_empty());
    }
}
