mod cli;
mod commands;
mod config;
mod engine;
mod progress;
mod resource;
mod ui;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command, StateCommand};
use std::path::PathBuf;

use commands::declarative::ApplyOptions;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub manifest: PathBuf,
    pub api_key: Option<String>,
    pub admin_key: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        manifest: cli.manifest,
        api_key: cli.api_key,
        admin_key: cli.admin_key,
    };
    log::debug!("Manifest: {}", ctx.manifest.display());

    match cli.command {
        Command::Plan(args) => commands::declarative::plan(&ctx, args.target.as_deref()),
        Command::Apply(args) => commands::declarative::apply(
            &ctx,
            &ApplyOptions {
                target: args.target,
                yes: args.yes,
                jobs: args.jobs,
                dry_run: args.dry_run,
            },
        ),
        Command::Destroy(args) => {
            commands::declarative::destroy(&ctx, args.target.as_deref(), args.yes)
        }
        Command::State(cmd) => match cmd {
            StateCommand::List => commands::state::list(&ctx),
            StateCommand::Show { name } => commands::state::show(&ctx, &name),
            StateCommand::Rm { name } => commands::state::rm(&ctx, &name),
        },
    }
}
