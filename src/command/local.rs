//! Command backend for processes spawned on the controlling machine.
//!
//! The command text is handed to the host shell as a single string, so
//! quoting follows that shell's rules and is the caller's responsibility.
//! Both output streams are drained by a [`StreamPump`]. The exit status is
//! reported once the process has terminated and both pipes reached end of
//! file, or a short grace period after the exit when a background
//! child still holds the pipes open.

use std::env;
use std::process::{self, Child, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;

use super::{CommandBackend, PollOutcome};
use crate::error::WorkerError;
use crate::pump::StreamPump;
use crate::worker::Environment;

const REAP_TICK: Duration = Duration::from_millis(10);

/// How long trailing output is awaited after the shell itself has exited.
const EOF_GRACE: Duration = Duration::from_millis(100);

#[cfg(windows)]
const SHELL: &str = "cmd";
#[cfg(not(windows))]
const SHELL: &str = "sh";

/// Variables copied from the controlling process when the worker
/// environment lacks them, so the shell can still resolve programs.
#[cfg(windows)]
const HOST_ESSENTIALS: &[&str] = &["PATH", "SYSTEMROOT"];
#[cfg(not(windows))]
const HOST_ESSENTIALS: &[&str] = &["PATH"];

/// A running local process and the readers draining it.
pub struct LocalBackend {
    child: Child,
    pump: StreamPump,
    exit: Option<i32>,
    exited_at: Option<Instant>,
    reaped: bool,
}

impl LocalBackend {
    /// Spawns `text` through the host shell in `cwd` with exactly
    /// `environment` plus the host essentials.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Spawn`] when the shell or its readers cannot be
    /// started.
    pub fn spawn(
        text: &str,
        environment: &Environment,
        cwd: &Utf8Path,
    ) -> Result<Self, WorkerError> {
        let mut command = shell_command(text);
        command
            .env_clear()
            .envs(with_host_essentials(environment))
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().map_err(|err| spawn_error(&err.to_string()))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            kill_and_reap(&mut child);
            return Err(spawn_error("output pipes were not captured"));
        };
        let pump = match StreamPump::start(stdout, stderr) {
            Ok(started) => started,
            Err(err) => {
                kill_and_reap(&mut child);
                return Err(spawn_error(&err.to_string()));
            }
        };

        tracing::debug!(pid = child.id(), %cwd, command = text, "spawned local command");
        Ok(Self {
            child,
            pump,
            exit: None,
            exited_at: None,
            reaped: false,
        })
    }

    fn try_reap(&mut self) {
        if self.exit.is_some() {
            return;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(exit_code(status));
                self.exited_at = Some(Instant::now());
                self.reaped = true;
            }
            Ok(None) => {}
            Err(err) => tracing::debug!(pid = self.child.id(), error = %err, "process status check failed"),
        }
    }

    fn settled(&self) -> bool {
        let Some(exited_at) = self.exited_at else {
            return false;
        };
        if self.pump.is_drained() {
            return true;
        }
        let lingering = exited_at.elapsed() >= EOF_GRACE;
        if lingering {
            tracing::debug!(
                pid = self.child.id(),
                "shell exited while its pipes stay open; reporting status"
            );
        }
        lingering
    }
}

impl CommandBackend for LocalBackend {
    fn poll(&mut self, timeout: Option<Duration>) -> PollOutcome {
        let deadline = timeout.and_then(|limit| Instant::now().checked_add(limit));
        let mut outcome = PollOutcome::default();
        loop {
            for event in self.pump.drain() {
                outcome.push(event);
            }
            self.try_reap();
            if self.settled() {
                outcome.exit_status = self.exit;
                return outcome;
            }
            if outcome.has_output() {
                return outcome;
            }

            let tick = match deadline {
                None => REAP_TICK,
                Some(at) => {
                    let remaining = at.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return outcome;
                    }
                    remaining.min(REAP_TICK)
                }
            };
            if self.pump.is_drained() {
                thread::sleep(tick);
            } else if let Some(event) = self.pump.next(Some(tick)) {
                outcome.push(event);
            }
        }
    }

    fn terminate(&mut self) {
        if !self.reaped {
            kill_and_reap(&mut self.child);
            self.reaped = true;
        }
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Returns `environment` with the host essentials filled in from the
/// controlling process when absent.
#[must_use]
pub fn with_host_essentials(environment: &Environment) -> Environment {
    let mut effective = environment.clone();
    for name in HOST_ESSENTIALS {
        if !effective.contains_key(*name)
            && let Ok(value) = env::var(name)
        {
            effective.insert((*name).to_owned(), value);
        }
    }
    effective
}

#[cfg(windows)]
fn shell_command(text: &str) -> process::Command {
    let mut command = process::Command::new(SHELL);
    command.arg("/C").arg(text);
    command
}

#[cfg(not(windows))]
fn shell_command(text: &str) -> process::Command {
    let mut command = process::Command::new(SHELL);
    command.arg("-c").arg(text);
    command
}

/// Exit code of a finished process, or the negated signal number when a
/// signal ended it.
#[cfg(unix)]
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn kill_and_reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        tracing::debug!(pid = child.id(), error = %err, "kill failed");
    }
    child.wait().ok();
}

fn spawn_error(message: &str) -> WorkerError {
    WorkerError::Spawn {
        program: SHELL.to_owned(),
        message: message.to_owned(),
    }
}
