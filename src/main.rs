//! CLI entry point for the transfer tool.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::debug;
use transfer_core::{ActionError, TransferAction};

mod cli;
mod commands;

use cli::{Args, Command};
use commands::AppContext;

/// Exit status for a command rejected in the transfer's current state.
const EXIT_CONFLICT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    match dispatch(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            if let Some(action_error) = error.downcast_ref::<ActionError>() {
                if action_error.is_conflict() {
                    eprintln!("conflict ({}): {action_error}", action_error.status_code());
                    return ExitCode::from(EXIT_CONFLICT);
                }
            }
            eprintln!("Error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(args: &Args) -> Result<()> {
    let run_args = match &args.command {
        Command::Run(run) => Some(run),
        _ => None,
    };
    let ctx = AppContext::open(args, run_args).await?;

    let result = match &args.command {
        Command::Add { urls } => commands::run_add_command(&ctx, urls).await,
        Command::Run(run) => {
            commands::run_download_command(&ctx, !(run.no_progress || args.quiet)).await
        }
        Command::List { json } => commands::run_list_command(&ctx, *json).await,
        Command::Show { id } => commands::run_show_command(&ctx, *id).await,
        Command::Pause { id } => commands::run_action_command(&ctx, TransferAction::Pause, *id).await,
        Command::Resume { id } => {
            commands::run_action_command(&ctx, TransferAction::Resume, *id).await
        }
        Command::Cancel { id } => {
            commands::run_action_command(&ctx, TransferAction::Cancel, *id).await
        }
        Command::Restart { id } => {
            commands::run_action_command(&ctx, TransferAction::Restart, *id).await
        }
        Command::Destroy { id, with_asset } => {
            commands::run_destroy_command(&ctx, *id, *with_asset).await
        }
        Command::Sweep => commands::run_sweep_command(&ctx).await,
    };

    // Lets deferred temp cleanup finish and stops any live batch.
    ctx.engine.shutdown().await;
    result
}
