use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::MANIFEST_FILE;

#[derive(Parser)]
#[command(name = "orgform")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Declarative management of LLM platform organizations and projects", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Manifest file
    #[arg(short, long, global = true, default_value = MANIFEST_FILE)]
    pub manifest: PathBuf,

    /// Project-scoped API key
    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Organization admin API key
    #[arg(long, global = true, env = "OPENAI_ADMIN_KEY", hide_env_values = true)]
    pub admin_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change
    Plan(PlanArgs),

    /// Make the platform match the manifest
    Apply(ApplyArgs),

    /// Remove every managed resource
    Destroy(DestroyArgs),

    /// Inspect or edit the recorded state
    #[command(subcommand)]
    State(StateCommand),
}

#[derive(Args)]
pub struct PlanArgs {
    /// Limit to a kind or a kind.name (e.g. project, project.demo)
    #[arg(short, long)]
    pub target: Option<String>,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Limit to a kind or a kind.name (e.g. project, project.demo)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Number of resources reconciled in parallel
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Show the plan without applying it
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Limit to a kind or a kind.name (e.g. project, project.demo)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Subcommand)]
pub enum StateCommand {
    /// List recorded resources
    List,

    /// Show one recorded resource
    Show {
        /// Resource name
        name: String,
    },

    /// Forget a resource without touching the platform
    Rm {
        /// Resource name
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_flags() {
        let cli = Cli::try_parse_from([
            "orgform", "apply", "--yes", "--jobs", "2", "--target", "project.demo",
        ])
        .unwrap();
        match cli.command {
            Command::Apply(args) => {
                assert!(args.yes);
                assert_eq!(args.jobs, Some(2));
                assert_eq!(args.target.as_deref(), Some("project.demo"));
                assert!(!args.dry_run);
            }
            _ => panic!("expected apply"),
        }
        assert_eq!(cli.manifest, PathBuf::from(MANIFEST_FILE));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["orgform", "state", "show", "demo", "-vv", "--manifest", "org.toml"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.manifest, PathBuf::from("org.toml"));
        assert!(matches!(cli.command, Command::State(StateCommand::Show { name }) if name == "demo"));
    }
}
