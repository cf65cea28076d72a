//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Resumable, domain-aware chunked downloads.
///
/// Registers source URLs as assets, fetches them in byte-range chunks with
/// per-domain admission limits, and keeps enough state on disk to pause,
/// resume, restart or recover after a crash.
#[derive(Parser, Debug)]
#[command(name = "transfer")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (TOML). Defaults to the user config dir when present.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// SQLite database file, overriding the config value
    #[arg(long, global = true, value_name = "FILE")]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register URLs as assets and enqueue a transfer for each
    Add {
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,
    },

    /// Recover, then download until no transfer is active
    Run(RunArgs),

    /// List transfers
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one transfer and its chunks
    Show { id: i64 },

    /// Pause an active transfer
    Pause { id: i64 },

    /// Resume a paused transfer
    Resume { id: i64 },

    /// Cancel a transfer
    Cancel { id: i64 },

    /// Restart a failed or canceled transfer
    Restart { id: i64 },

    /// Delete a transfer record
    Destroy {
        id: i64,

        /// Also delete the downloaded file and clear the asset
        #[arg(long)]
        with_asset: bool,
    },

    /// Remove temp directories no transfer refers to
    Sweep,
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct RunArgs {
    /// Concurrent chunk workers across all transfers (1-256)
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u16).range(1..=256))]
    pub workers: Option<u16>,

    /// Default per-domain admission ceiling (1-64)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub domain_concurrency: Option<u8>,

    /// Retries after the first attempt for transient failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_add_requires_urls() {
        let args = Args::try_parse_from(["transfer", "add", "https://a.example/x.jpg"]).unwrap();
        match args.command {
            Command::Add { urls } => assert_eq!(urls, vec!["https://a.example/x.jpg"]),
            other => panic!("unexpected command: {other:?}"),
        }

        let err = Args::try_parse_from(["transfer", "add"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_verbose_flag_is_global() {
        let args = Args::try_parse_from(["transfer", "list", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);

        let args = Args::try_parse_from(["transfer", "-q", "sweep"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_database_override() {
        let args =
            Args::try_parse_from(["transfer", "--database", "/tmp/t.db", "list", "--json"]).unwrap();
        assert_eq!(args.database, Some(PathBuf::from("/tmp/t.db")));
        assert!(matches!(args.command, Command::List { json: true }));
    }

    #[test]
    fn test_cli_destroy_with_asset() {
        let args = Args::try_parse_from(["transfer", "destroy", "4", "--with-asset"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Destroy {
                id: 4,
                with_asset: true
            }
        ));
    }

    #[test]
    fn test_cli_run_overrides() {
        let args = Args::try_parse_from(["transfer", "run", "-w", "8", "-c", "3", "-r", "0"]).unwrap();
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.workers, Some(8));
        assert_eq!(run.domain_concurrency, Some(3));
        assert_eq!(run.max_retries, Some(0));
        assert!(!run.no_progress);
    }

    #[test]
    fn test_cli_run_rejects_out_of_range_values() {
        let err = Args::try_parse_from(["transfer", "run", "-c", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);

        let err = Args::try_parse_from(["transfer", "run", "-r", "11"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_id_must_be_numeric() {
        let err = Args::try_parse_from(["transfer", "pause", "abc"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_missing_subcommand_is_error() {
        let err = Args::try_parse_from(["transfer"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingSubcommand);
    }
}
