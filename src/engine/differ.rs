//! Plan display

use colored::Colorize;
use converge::{Action, AttributeDiff, Change, Plan, Source, Step};
use serde_json::Value;
use similar::{ChangeTag, TextDiff};

use crate::ui;

/// Longest single-line value shown inline
const MAX_INLINE: usize = 60;

/// Display a plan in a user-friendly format
pub fn display_plan(plan: &Plan) {
    let changes: Vec<&Step> = plan.changes().collect();
    let refreshed = plan.count(Action::Read);

    // Unplannable instances fail on their own; the rest still runs
    for step in plan.errors() {
        if let Some(error) = &step.error {
            println!("  {} {}.{}: {}", "✗".red(), step.kind, step.name.bold(), error);
        }
    }

    if changes.is_empty() {
        println!();
        println!("  {} No changes needed", "✓".green());
        if refreshed > 0 {
            ui::dim(&format!("{refreshed} data source(s) will be refreshed"));
        }
        return;
    }

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        "Execution Plan".bold()
    );
    println!("│");

    for step in &changes {
        let identity = step
            .identity
            .as_deref()
            .map(|id| format!(" ({})", ui::truncate(id, 40)))
            .unwrap_or_default();
        println!(
            "│ {:>3} {}.{}{}",
            ui::action_symbol(step.action),
            step.kind,
            step.name.bold(),
            identity.dimmed()
        );
        if let Some(note) = &step.note {
            println!("│       {}", note.dimmed());
        }
        for attribute in &step.diff.attributes {
            display_attribute(attribute);
        }
    }
    println!("│");

    println!("├─────────────────────────────────────────────────────┤");
    println!("│ Summary: {}", summary_line(plan).bold());
    println!("└─────────────────────────────────────────────────────┘");
}

fn display_attribute(attribute: &AttributeDiff) {
    let marker = match (attribute.change, attribute.source) {
        (Change::ForcesReplacement, _) => " (forces replacement)".magenta().to_string(),
        (Change::Unresolvable, _) => String::new(),
        (_, Source::Drift) => " (drift)".yellow().to_string(),
        _ => String::new(),
    };

    let before = attribute.before.as_ref().and_then(Value::as_str);
    let after = attribute.after.as_ref().and_then(Value::as_str);
    if let (Some(before), Some(after)) = (before, after)
        && (before.contains('\n') || after.contains('\n'))
    {
        println!("│       {}:{}", attribute.name, marker);
        for line in text_diff(before, after) {
            let colored = if line.starts_with('-') {
                line.red()
            } else {
                line.green()
            };
            println!("│         {colored}");
        }
        return;
    }

    let after = match attribute.change {
        Change::Unresolvable => "(known after apply)".dimmed().to_string(),
        _ => render(attribute.after.as_ref()),
    };
    println!(
        "│       {}: {} → {}{}",
        attribute.name,
        render(attribute.before.as_ref()).dimmed(),
        after,
        marker
    );
}

/// One-line form of an attribute value
fn render(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "(none)".to_string(),
        Some(value) => ui::truncate(&value.to_string(), MAX_INLINE),
    }
}

/// Changed lines of a multi-line text value, prefixed with `-` or `+`
fn text_diff(before: &str, after: &str) -> Vec<String> {
    TextDiff::from_lines(before, after)
        .iter_all_changes()
        .filter_map(|change| {
            let line = change.value().trim_end_matches('\n');
            match change.tag() {
                ChangeTag::Delete => Some(format!("- {line}")),
                ChangeTag::Insert => Some(format!("+ {line}")),
                ChangeTag::Equal => None,
            }
        })
        .collect()
}

/// Counts of the plan, e.g. "1 to create, 2 to delete"
pub fn summary_line(plan: &Plan) -> String {
    let parts: Vec<String> = [
        (Action::Create, "create"),
        (Action::Update, "update"),
        (Action::Replace, "replace"),
        (Action::Delete, "delete"),
        (Action::Import, "import"),
    ]
    .into_iter()
    .map(|(action, verb)| (plan.count(action), verb))
    .filter(|(n, _)| *n > 0)
    .map(|(n, verb)| format!("{n} to {verb}"))
    .chain(match plan.errors().count() {
        0 => None,
        n => Some(format!("{n} with errors")),
    })
    .collect();

    if parts.is_empty() {
        "no changes".to_string()
    } else {
        parts.join(", ")
    }
}
