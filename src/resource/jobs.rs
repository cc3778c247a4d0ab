//! Batches and fine-tuning jobs
//!
//! Neither can be deleted. A running job is cancelled; a finished one is
//! only forgotten locally.

use apikit::{Error, Result, Scope};
use converge::{AttrMode, Attributes, Comparator, DeleteRule, Registry, Schema};
use serde_json::Value;
use std::sync::Arc;

use super::{Platform, Removal, Rest, required};

const BATCH: Schema = Schema::new(&[
    ("input_file_id", AttrMode::ForcesReplacement),
    ("endpoint", AttrMode::ForcesReplacement),
    ("completion_window", AttrMode::ForcesReplacement),
    ("metadata", AttrMode::ForcesReplacement),
]);

const FINE_TUNING_JOB: Schema = Schema::new(&[
    ("model", AttrMode::ForcesReplacement),
    ("training_file", AttrMode::ForcesReplacement),
    ("validation_file", AttrMode::ForcesReplacement),
    ("hyperparameters", AttrMode::ForcesReplacement),
    ("method", AttrMode::ForcesReplacement),
    ("suffix", AttrMode::ForcesReplacement),
    ("seed", AttrMode::ForcesReplacement),
    ("metadata", AttrMode::ForcesReplacement),
])
.with_drift(&[
    ("model", Comparator::ModelAlias),
    ("hyperparameters", Comparator::Subset),
    ("method", Comparator::Subset),
]);

const BATCH_ENDPOINTS: [&str; 4] = [
    "/v1/responses",
    "/v1/chat/completions",
    "/v1/embeddings",
    "/v1/completions",
];

const BATCH_TERMINAL: &[&str] = &["completed", "failed", "expired", "cancelled"];

const JOB_TERMINAL: &[&str] = &["succeeded", "failed", "cancelled"];

pub fn register(registry: &mut Registry, platform: &Arc<Platform>) {
    registry
        .register(
            Rest::new(platform, "batch", Scope::Project, "/batches", BATCH)
                .removal(
                    Removal::Post("/cancel"),
                    DeleteRule::LocalOnlyWhenTerminal {
                        field: "status",
                        terminal: BATCH_TERMINAL,
                    },
                )
                .check(check_batch),
        )
        .register(
            Rest::new(
                platform,
                "fine_tuning_job",
                Scope::Project,
                "/fine_tuning/jobs",
                FINE_TUNING_JOB,
            )
            .settle("status", JOB_TERMINAL)
            .removal(
                Removal::Post("/cancel"),
                DeleteRule::LocalOnlyWhenTerminal {
                    field: "status",
                    terminal: JOB_TERMINAL,
                },
            )
            .check(check_fine_tuning_job),
        );
}

fn check_batch(declared: &Attributes) -> Result<()> {
    required(declared, "input_file_id")?;
    let endpoint = required(declared, "endpoint")?;
    if !BATCH_ENDPOINTS.contains(&endpoint) {
        return Err(Error::validation(format!(
            "endpoint must be one of {}, got '{endpoint}'",
            BATCH_ENDPOINTS.join(", ")
        )));
    }
    match required(declared, "completion_window")? {
        "24h" => Ok(()),
        other => Err(Error::validation(format!(
            "completion_window must be '24h', got '{other}'"
        ))),
    }
}

fn check_fine_tuning_job(declared: &Attributes) -> Result<()> {
    required(declared, "model")?;
    required(declared, "training_file")?;

    if let Some(suffix) = declared.get("suffix").and_then(Value::as_str)
        && suffix.len() > 64
    {
        return Err(Error::validation("suffix must be at most 64 characters"));
    }

    if let Some(method) = declared.get("method") {
        let kind = method.get("type").and_then(Value::as_str).unwrap_or_default();
        if !matches!(kind, "supervised" | "dpo" | "reinforcement") {
            return Err(Error::validation(format!(
                "method.type must be supervised, dpo or reinforcement, got '{kind}'"
            )));
        }
        // Only the block matching the type may be present
        let stray = method
            .as_object()
            .into_iter()
            .flat_map(|m| m.keys())
            .find(|k| k.as_str() != "type" && k.as_str() != kind);
        if let Some(stray) = stray {
            return Err(Error::validation(format!(
                "method.{stray} is not valid for a {kind} job"
            )));
        }
        if declared.contains_key("hyperparameters") {
            return Err(Error::validation(
                "set hyperparameters inside method, not next to it",
            ));
        }
    }
    Ok(())
}
