//! Command-line interface definitions for the `foreman` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `foreman` binary.
#[derive(Debug, Parser)]
#[command(
    name = "foreman",
    about = "Run shell commands on local and SSH workers",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run a shell command on a worker and exit with its status.
    #[command(name = "run", about = "Run a shell command on a worker")]
    Run(RunCommand),
    /// Run Python code with the worker's interpreter.
    #[command(name = "python", about = "Run Python code on a worker")]
    Python(PythonCommand),
}

/// Options selecting and preparing the worker.
#[derive(Debug, Args)]
pub(crate) struct WorkerArgs {
    /// Run on this SSH host instead of the local machine.
    ///
    /// Defaults to `FOREMAN_SSH_HOST` or the `host` key of `foreman.toml`.
    #[arg(long, value_name = "HOST")]
    pub(crate) host: Option<String>,
    /// Remote user; defaults to the local user name.
    #[arg(long, value_name = "USER")]
    pub(crate) user: Option<String>,
    /// Remote SSH port.
    #[arg(long, value_name = "PORT")]
    pub(crate) port: Option<u16>,
    /// Set an environment variable for the command. Repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub(crate) env: Vec<(String, String)>,
    /// Working directory on the worker, relative to its starting directory.
    #[arg(long, value_name = "DIR")]
    pub(crate) cwd: Option<String>,
    /// Cancel the command after this many milliseconds and exit with 124.
    #[arg(long, value_name = "MILLIS")]
    pub(crate) timeout_ms: Option<u64>,
    /// Print a JSON report instead of the raw output streams.
    #[arg(long)]
    pub(crate) json: bool,
}

/// Arguments for the `foreman run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    #[command(flatten)]
    pub(crate) worker: WorkerArgs,
    /// Command to execute on the worker (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for the `foreman python` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct PythonCommand {
    #[command(flatten)]
    pub(crate) worker: WorkerArgs,
    /// Python source; multi-line code is staged as a script on the worker.
    #[arg(value_name = "CODE")]
    pub(crate) code: String,
}

/// Parses `KEY=VALUE`, rejecting empty keys.
pub(crate) fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}
