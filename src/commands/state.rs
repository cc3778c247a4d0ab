//! State inspection commands

use anyhow::{Context as AnyhowContext, Result, bail};
use chrono::DateTime;
use colored::Colorize;
use converge::{Entry, Snapshot, SnapshotStore};
use serde_json::Value;
use std::path::Path;

use super::load_settings;
use crate::Context;
use crate::ui;

fn state_path(ctx: &Context) -> Result<std::path::PathBuf> {
    load_settings(&ctx.manifest)?.state_path()
}

/// List recorded resources
pub fn list(ctx: &Context) -> Result<()> {
    let path = state_path(ctx)?;
    let snapshot = SnapshotStore::load(&path)?.snapshot();

    ui::header(&format!("State ({} resources)", snapshot.entries.len()));
    ui::dim(&format!("{} (serial {})", path.display(), snapshot.serial));
    if snapshot.entries.is_empty() {
        println!();
        ui::info("No resources recorded");
        return Ok(());
    }

    println!();
    for (name, entry) in &snapshot.entries {
        let imported = if entry.imported {
            " [imported]".cyan().to_string()
        } else {
            String::new()
        };
        println!(
            "  {:<24} {:<24} {}{}",
            name.bold(),
            entry.kind,
            ui::truncate(&entry.identity, 48).dimmed(),
            imported
        );
    }
    Ok(())
}

/// Show one recorded resource
pub fn show(ctx: &Context, name: &str) -> Result<()> {
    let path = state_path(ctx)?;
    let store = SnapshotStore::load(&path)?;
    let Some(entry) = store.get(name) else {
        bail!("No resource named '{name}' in {}", path.display());
    };

    ui::header(name);
    ui::kv("Kind", &entry.kind);
    ui::kv("Identity", &entry.identity);
    if let Some(created) = entry.observed.get("created_at").and_then(format_timestamp) {
        ui::kv("Created", &created);
    }
    if entry.imported {
        ui::kv("Imported", "yes");
    }
    if !entry.depends_on.is_empty() {
        ui::kv("Depends on", &entry.depends_on.join(", "));
    }
    if !entry.suppressed.is_empty() {
        ui::kv("Drift ignored", &entry.suppressed.join(", "));
    }
    ui::kv("Applied hash", short_hash(&entry.last_applied_hash));

    ui::section("Last applied");
    print_json(&Value::Object(entry.last_applied.clone()))?;
    ui::section("Observed");
    print_json(&Value::Object(entry.observed.clone()))?;
    Ok(())
}

/// Forget a resource without touching the platform
pub fn rm(ctx: &Context, name: &str) -> Result<()> {
    let path = state_path(ctx)?;
    let (entry, dependents) = remove_entry(&path, name)?;

    ui::success(&format!(
        "Removed {name} ({} {}) from the state",
        entry.kind, entry.identity
    ));
    ui::dim("The remote object was not touched");
    if !dependents.is_empty() {
        ui::warn(&format!(
            "Still recorded and depending on it: {}",
            dependents.join(", ")
        ));
    }
    Ok(())
}

/// Remove an entry from the snapshot file, returning it and the names
/// of recorded entries that depend on it
fn remove_entry(path: &Path, name: &str) -> Result<(Entry, Vec<String>)> {
    let store = SnapshotStore::load(path)?;
    let Some(entry) = store.remove(name) else {
        bail!("No resource named '{name}' in {}", path.display());
    };
    store
        .save(path)
        .with_context(|| format!("Could not save state to {}", path.display()))?;
    Ok((entry, dependents(&store.snapshot(), name)))
}

fn dependents(snapshot: &Snapshot, name: &str) -> Vec<String> {
    snapshot
        .entries
        .iter()
        .filter(|(_, e)| e.depends_on.iter().any(|d| d == name))
        .map(|(n, _)| n.clone())
        .collect()
}

/// Unix seconds as a UTC date
fn format_timestamp(value: &Value) -> Option<String> {
    let secs = value.as_i64()?;
    DateTime::from_timestamp(secs, 0).map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

fn print_json(value: &Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    for line in text.lines() {
        println!("  {line}");
    }
    Ok(())
}
