//! assetpipe - Command-line tool for building and watching asset trees

use std::process::ExitCode;

use assetpipe::cli;

fn main() -> ExitCode {
    cli::run()
}
