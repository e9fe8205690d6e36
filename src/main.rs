//! Binary entry point for the Foreman CLI.

mod cli;

use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use cli::{Cli, WorkerArgs};
use foreman::{
    Command, CommandOutput, Job, JobSnapshot, LocalWorker, RemoteWorker, SshConfig, Worker,
    WorkerError, WorkerPool,
};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const TIMEOUT_EXIT_CODE: i32 = 124;
const SIGNAL_EXIT_BASE: i32 = 128;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("no worker became available within {0:?}")]
    NoWorker(Duration),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to render report: {0}")]
    Report(String),
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(args) => {
            validate_command_args(&args.command)?;
            let text = render_command(&args.command);
            run_on_worker(&args.worker, "run", |worker| worker.execute(&text))
        }
        Cli::Python(args) => run_on_worker(&args.worker, "python", |worker| {
            worker.execute_python(&args.code, None)
        }),
    }
}

fn run_on_worker<F>(args: &WorkerArgs, job_name: &str, start: F) -> Result<i32, CliError>
where
    F: Fn(&dyn Worker) -> Result<Arc<Command>, WorkerError>,
{
    let config = load_config(args)?;
    if let Some(host) = config.host.clone() {
        let pool = WorkerPool::new(1, move || RemoteWorker::connect(&config, &host));
        return lease_and_run(&pool, args, job_name, start);
    }
    let pool = WorkerPool::new(1, LocalWorker::new);
    lease_and_run(&pool, args, job_name, start)
}

fn load_config(args: &WorkerArgs) -> Result<SshConfig, CliError> {
    let mut config =
        SshConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    if let Some(host) = &args.host {
        config.host = Some(host.clone());
    }
    if let Some(user) = &args.user {
        config.user = Some(user.clone());
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(config)
}

fn lease_and_run<W, F>(
    pool: &WorkerPool<W>,
    args: &WorkerArgs,
    job_name: &str,
    start: F,
) -> Result<i32, CliError>
where
    W: Worker + 'static,
    F: Fn(&dyn Worker) -> Result<Arc<Command>, WorkerError>,
{
    let env = args.env.clone();
    let cwd = args.cwd.clone();
    pool.add_setup_step(move |worker| {
        for (key, value) in &env {
            worker.set_env(key, value);
        }
        if let Some(dir) = &cwd {
            worker.change_directory(dir)?;
        }
        Ok(())
    });

    let worker = pool
        .acquire(Some(ACQUIRE_TIMEOUT))?
        .ok_or(CliError::NoWorker(ACQUIRE_TIMEOUT))?;
    let outcome = run_job(&*worker, args, job_name, &start);
    pool.release(&worker)?;
    outcome
}

fn run_job<F>(worker: &dyn Worker, args: &WorkerArgs, job_name: &str, start: &F) -> Result<i32, CliError>
where
    F: Fn(&dyn Worker) -> Result<Arc<Command>, WorkerError>,
{
    let command = start(worker)?;
    let job = Arc::new(Job::new(job_name));
    job.follow(&command);

    let status = command.wait(args.timeout_ms.map(Duration::from_millis));
    let timed_out = status.is_none() && !command.cancelled();
    if timed_out {
        command.cancel()?;
    }
    let output = command.output();

    if args.json {
        let report = Report {
            job: job.snapshot(),
            worker: worker.core().to_string(),
            command: command.text(),
            timed_out,
            exit_status: output.exit_status,
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
        };
        let rendered =
            serde_json::to_string_pretty(&report).map_err(|err| CliError::Report(err.to_string()))?;
        writeln!(io::stdout(), "{rendered}").ok();
    } else {
        io::stdout().write_all(&output.stdout).ok();
        io::stderr().write_all(&output.stderr).ok();
    }
    Ok(exit_code(&output, timed_out))
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    job: JobSnapshot,
    worker: String,
    command: &'a str,
    timed_out: bool,
    exit_status: Option<i32>,
    stdout: String,
    stderr: String,
}

fn exit_code(output: &CommandOutput, timed_out: bool) -> i32 {
    if timed_out {
        return TIMEOUT_EXIT_CODE;
    }
    match output.exit_status {
        Some(code) if code < 0 => SIGNAL_EXIT_BASE.saturating_sub(code),
        Some(code) => code,
        None => 1,
    }
}

fn render_command(args: &[String]) -> String {
    let mut result = String::new();
    let mut first = true;

    for arg in args {
        if first {
            first = false;
        } else {
            result.push(' ');
        }

        let escaped = escape(arg.as_str().into());
        result.push_str(escaped.as_ref());
    }

    result
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\n' | '\r' | '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
