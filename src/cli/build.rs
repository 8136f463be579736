//! Build and watch command implementations

use std::path::PathBuf;
use std::process::ExitCode;

use super::{BuildArgs, EXIT_ERROR, EXIT_SUCCESS};
use crate::build::{BuildContext, PipelineEngine};
use crate::config::loader::{default_config, find_config, load_config, merge_cli_overrides, CliOverrides};
use crate::config::AssetpipeConfig;

/// Load the configuration and apply command-line overrides.
///
/// Returns the configuration together with the project root that relative
/// paths resolve against.
fn load(args: &BuildArgs) -> Result<(AssetpipeConfig, PathBuf), String> {
    let cwd = std::env::current_dir().map_err(|e| format!("cannot read current directory: {}", e))?;
    let config_path = args.config.clone().or_else(find_config);

    let (mut config, project_root) = match config_path {
        Some(path) => {
            if args.verbose {
                println!("Using config: {}", path.display());
            }
            let config = load_config(Some(&path)).map_err(|e| format!("Error loading config: {}", e))?;
            let root = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => cwd.clone(),
            };
            (config, root)
        }
        None => {
            if args.verbose {
                println!("No assetpipe.toml found, using defaults");
            }
            (default_config(), cwd.clone())
        }
    };

    // CLI paths are relative to where the command runs, not to the config
    let absolute = |p: &PathBuf| if p.is_absolute() { p.clone() } else { cwd.join(p) };
    let overrides = CliOverrides {
        entry: args.entry.as_ref().map(absolute),
        output: args.output.as_ref().map(absolute),
        no_cache: args.no_cache,
        jobs: args.jobs.map(usize::from),
    };
    merge_cli_overrides(&mut config, &overrides);

    Ok((config, project_root))
}

/// Load configuration and set up the engine with the configured pipes.
fn engine(args: &BuildArgs) -> Result<(PipelineEngine, AssetpipeConfig), String> {
    let (config, project_root) = load(args)?;
    let context = BuildContext::from_config(&config, &project_root)?;

    if !context.source_root().is_dir() {
        return Err(format!(
            "Source directory not found: {}\nCreate the directory or specify a different path with --entry",
            context.source_root().display()
        ));
    }

    let pipes = crate::pipes::pipes_from_config(&config.pipes).map_err(|e| e.to_string())?;
    let engine = PipelineEngine::new(context, pipes).map_err(|e| e.to_string())?;
    if args.verbose {
        println!("Pipeline: {}", engine.pipe_names().join(" -> "));
    }
    Ok((engine, config))
}

/// Run the build command
pub fn run_build(args: &BuildArgs) -> ExitCode {
    let (mut engine, _) = match engine(args) {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(EXIT_ERROR);
        }
    };

    match engine.build() {
        Ok(result) => {
            if result.is_clean() {
                println!("{}", result.summary());
                ExitCode::from(EXIT_SUCCESS)
            } else {
                eprintln!("{}", result.summary());
                ExitCode::from(EXIT_ERROR)
            }
        }
        Err(e) => {
            eprintln!("Build error: {}", e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// Run the watch command
pub fn run_watch(args: &BuildArgs) -> ExitCode {
    let (engine, config) = match engine(args) {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(EXIT_ERROR);
        }
    };

    println!("Starting watch mode...");
    println!("Press Ctrl+C to stop");
    println!();

    match crate::watch::watch_and_rebuild(engine, &config.watch) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            eprintln!("Watch error: {}", e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}
