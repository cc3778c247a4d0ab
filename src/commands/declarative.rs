//! Declarative commands
//!
//! - `plan` - Show what apply would change
//! - `apply` - Make the platform match the manifest
//! - `destroy` - Remove every managed resource

use anyhow::{Result, bail};
use converge::{
    ApplyResult, AutoConfirm, CancelToken, ConfirmCallback, Driver, ExecuteOptions, Instance, Report,
};

use super::{Session, load_settings};
use crate::Context;
use crate::config::Manifest;
use crate::engine::{self, PassOptions, Prompt};
use crate::ui;

/// Options of `apply` and `destroy`
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub target: Option<String>,
    pub yes: bool,
    pub jobs: Option<usize>,
    pub dry_run: bool,
}

fn execute_options(session: &Session, opts: &ApplyOptions) -> ExecuteOptions {
    ExecuteOptions {
        dry_run: opts.dry_run,
        jobs: opts.jobs.unwrap_or(session.settings.jobs).max(1),
        target: opts.target.clone(),
    }
}

/// Show what apply would change
pub fn plan(ctx: &Context, target: Option<&str>) -> Result<()> {
    let manifest = Manifest::load(&ctx.manifest)?;
    let instances = manifest.instances()?;
    let session = Session::open(ctx, manifest.settings)?;

    ui::header("Plan");
    if let Some(t) = target {
        ui::dim(&format!("Target: {t}"));
    }

    let opts = ApplyOptions {
        target: target.map(String::from),
        dry_run: true,
        ..ApplyOptions::default()
    };
    let driver = Driver::new(&session.registry, &session.store, execute_options(&session, &opts));
    let plan = driver.plan(&instances)?;
    engine::display_plan(&plan);

    if ctx.verbose > 0 {
        for step in plan.steps.iter().filter(|s| !s.action.is_change()) {
            ui::dim(&format!("= {}.{} ({})", step.kind, step.name, step.action));
        }
    }
    Ok(())
}

/// Make the platform match the manifest
pub fn apply(ctx: &Context, opts: &ApplyOptions) -> Result<()> {
    let manifest = Manifest::load(&ctx.manifest)?;
    let instances = manifest.instances()?;
    let session = Session::open(ctx, manifest.settings)?;

    ui::header("Apply");
    if let Some(t) = &opts.target {
        ui::dim(&format!("Target: {t}"));
    }
    if opts.dry_run {
        ui::dim("Mode: dry-run (no changes will be made)");
    }

    let report = run(ctx, &session, &instances, opts)?;
    finish(&report)
}

/// Remove every managed resource, dependents first
pub fn destroy(ctx: &Context, target: Option<&str>, yes: bool) -> Result<()> {
    let settings = load_settings(&ctx.manifest)?;
    let session = Session::open(ctx, settings)?;

    ui::header("Destroy");
    if session.store.is_empty() {
        ui::info("Nothing is recorded in the state; nothing to destroy");
        return Ok(());
    }
    if let Some(t) = target {
        ui::dim(&format!("Target: {t}"));
    }

    // With nothing declared, every recorded instance is an orphan
    let opts = ApplyOptions {
        target: target.map(String::from),
        yes,
        ..ApplyOptions::default()
    };
    let report = run(ctx, &session, &[], &opts)?;
    finish(&report)
}

/// Cancel the pass between instances on Ctrl+C; a second Ctrl+C exits
fn cancel_on_interrupt() -> CancelToken {
    let token = CancelToken::new();
    let handler = token.clone();
    let installed = ctrlc::set_handler(move || {
        if handler.is_cancelled() {
            std::process::exit(130);
        }
        eprintln!("Interrupted; finishing instances already in progress");
        handler.cancel();
    });
    if let Err(e) = installed {
        log::debug!("Ctrl+C handler not installed: {e}");
    }
    token
}

fn run(ctx: &Context, session: &Session, instances: &[Instance], opts: &ApplyOptions) -> Result<Report> {
    let cancel = cancel_on_interrupt();
    let driver = Driver::new(&session.registry, &session.store, execute_options(session, opts))
        .with_cancel(cancel.clone());
    let mut confirm: Box<dyn ConfirmCallback> = if opts.yes {
        Box::new(AutoConfirm)
    } else {
        Box::new(Prompt)
    };
    let pass = PassOptions {
        dry_run: opts.dry_run,
        quiet: ctx.quiet,
    };

    let report = engine::execute(&driver, instances, confirm.as_mut(), pass)?;

    // Commits are written as they happen; a final save surfaces any write error
    if !opts.dry_run && !report.outcomes.is_empty() {
        session.save()?;
        log::info!("State saved to {}", session.state_path.display());
    }
    if cancel.is_cancelled() {
        bail!(
            "Interrupted; {} holds every operation that completed",
            session.state_path.display()
        );
    }
    Ok(report)
}

fn finish(report: &Report) -> Result<()> {
    for outcome in &report.outcomes {
        if let ApplyResult::Skipped { .. } = outcome.result {
            ui::dim(&format!("{}: {}", outcome.step.name, ui::result_label(&outcome.result)));
        }
    }

    let failed = report.summary.failed;
    if failed > 0 {
        for outcome in report.failures() {
            ui::error(&ui::result_label(&outcome.result));
        }
        bail!("{failed} resource(s) failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn test_execute_options_prefer_flags() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = Settings {
            jobs: 8,
            state_path: Some(dir.path().join("state.json").display().to_string()),
            ..Settings::default()
        };
        let ctx = Context {
            verbose: 0,
            quiet: true,
            manifest: dir.path().join("orgform.toml"),
            api_key: None,
            admin_key: None,
        };
        let session = Session::open(&ctx, settings).unwrap();

        let defaults = execute_options(&session, &ApplyOptions::default());
        assert_eq!(defaults.jobs, 8);
        assert!(defaults.target.is_none());

        let flags = ApplyOptions {
            jobs: Some(0),
            target: Some("project".into()),
            ..ApplyOptions::default()
        };
        let opts = execute_options(&session, &flags);
        assert_eq!(opts.jobs, 1);
        assert_eq!(opts.target.as_deref(), Some("project"));
    }

    #[test]
    fn test_destroy_with_empty_state_is_noop() {
        let dir = tempfile::TempDir::new().unwrap();
        let manifest = dir.path().join("orgform.toml");
        std::fs::write(
            &manifest,
            format!(
                "[settings]\nstate_path = \"{}\"\n",
                dir.path().join("state.json").display()
            ),
        )
        .unwrap();
        let ctx = Context {
            verbose: 0,
            quiet: true,
            manifest,
            api_key: None,
            admin_key: None,
        };
        destroy(&ctx, None, true).unwrap();
        assert!(!dir.path().join("state.json").exists());
    }
}
