//! Command-line interface implementation
//!
//! This module provides the CLI entry point and dispatches to submodules
//! for specific command implementations.

mod build;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit codes
pub(crate) const EXIT_SUCCESS: u8 = 0;
pub(crate) const EXIT_ERROR: u8 = 1;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "ASSETPIPE_LOG";

/// assetpipe - incremental asset build pipeline
#[derive(Parser)]
#[command(name = "assetpipe")]
#[command(about = "Incremental asset build pipeline: tag-driven transforms with a content-hash cache")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by `build` and `watch`
#[derive(Args, Debug, Clone, Default)]
pub struct BuildArgs {
    /// Path to assetpipe.toml (default: search upwards from the current directory)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the entry (source) directory
    #[arg(long)]
    pub entry: Option<PathBuf>,

    /// Override the output directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Ignore and do not write the persistent cache
    #[arg(long)]
    pub no_cache: bool,

    /// Number of parallel transform jobs
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    pub jobs: Option<u16>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline once
    Build(BuildArgs),

    /// Build, then rebuild incrementally on every change
    Watch(BuildArgs),

    /// List the built-in pipes in default order
    Pipes,
}

/// Install the tracing subscriber. `ASSETPIPE_LOG` wins unless `--verbose`
/// asks for debug output.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("assetpipe=debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("assetpipe=info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Run the CLI application
pub fn run() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build(args) => {
            init_logging(args.verbose);
            build::run_build(&args)
        }
        Commands::Watch(args) => {
            init_logging(args.verbose);
            build::run_watch(&args)
        }
        Commands::Pipes => {
            for name in crate::pipes::PIPE_NAMES {
                println!("{}", name);
            }
            ExitCode::from(EXIT_SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_build_flags() {
        let cli = Cli::try_parse_from([
            "assetpipe", "build", "--entry", "src", "-o", "dist", "--no-cache", "-j", "4",
        ])
        .unwrap();
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.entry, Some(PathBuf::from("src")));
                assert_eq!(args.output, Some(PathBuf::from("dist")));
                assert!(args.no_cache);
                assert_eq!(args.jobs, Some(4));
                assert!(!args.verbose);
            }
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn test_zero_jobs_rejected() {
        assert!(Cli::try_parse_from(["assetpipe", "watch", "--jobs", "0"]).is_err());
    }
}
