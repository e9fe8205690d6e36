//! Asynchronous shell command handles.
//!
//! A [`Command`] is created by [`crate::Worker::execute`], which starts the
//! backend immediately and returns without waiting. Callers then poll the
//! handle incrementally: [`Command::wait`] drives the backend until the exit
//! status is known or the time budget runs out, and the accessors perform a
//! single non-blocking poll. Completion callbacks fire exactly once, after
//! the command exits or is cancelled.
//!
//! The backend is the only variant-specific part. [`local`] spawns a process
//! through the host shell; [`remote`] reads from a session channel.

pub mod local;
pub mod remote;

use std::fmt;
use std::mem;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::WorkerError;
use crate::session::ChannelEvent;
use crate::worker::{Environment, WorkerId};

/// Longest single backend poll issued by [`Command::wait`], so a concurrent
/// cancel or close never waits long for the command lock.
pub(crate) const POLL_SLICE: Duration = Duration::from_millis(50);

/// Output and status gathered by one backend poll.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PollOutcome {
    /// Newly read standard output bytes.
    pub stdout: Vec<u8>,
    /// Newly read standard error bytes.
    pub stderr: Vec<u8>,
    /// Exit status, once the backend has terminated and been drained.
    pub exit_status: Option<i32>,
}

impl PollOutcome {
    pub(crate) fn push(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Stdout(bytes) => self.stdout.extend(bytes),
            ChannelEvent::Stderr(bytes) => self.stderr.extend(bytes),
        }
    }

    pub(crate) fn has_output(&self) -> bool {
        !self.stdout.is_empty() || !self.stderr.is_empty()
    }
}

/// The running half of a command: a local process or a remote channel.
pub trait CommandBackend: Send {
    /// Collects newly available output, waiting at most `timeout` (`None`
    /// waits until something changes).
    fn poll(&mut self, timeout: Option<Duration>) -> PollOutcome;

    /// Forcibly stops the command and releases its resources.
    fn terminate(&mut self);
}

type Callback = Box<dyn FnOnce(&Command) + Send>;

struct CommandState {
    cancelled: bool,
    exit_status: Option<i32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    callbacks: Vec<Callback>,
    backend: Option<Box<dyn CommandBackend>>,
}

impl CommandState {
    const fn is_terminal(&self) -> bool {
        self.cancelled || self.exit_status.is_some()
    }

    fn take_ready_callbacks(&mut self) -> Vec<Callback> {
        if self.is_terminal() {
            mem::take(&mut self.callbacks)
        } else {
            Vec::new()
        }
    }
}

/// A shell command started on a worker.
pub struct Command {
    worker: WorkerId,
    text: String,
    environment: Option<Environment>,
    state: Mutex<CommandState>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Command")
            .field("worker", &self.worker)
            .field("text", &self.text)
            .field("cancelled", &state.cancelled)
            .field("exit_status", &state.exit_status)
            .finish_non_exhaustive()
    }
}

impl Command {
    pub(crate) fn new(
        worker: WorkerId,
        text: &str,
        environment: Option<Environment>,
        backend: Box<dyn CommandBackend>,
    ) -> Self {
        Self {
            worker,
            text: text.to_owned(),
            environment,
            state: Mutex::new(CommandState {
                cancelled: false,
                exit_status: None,
                stdout: Vec::new(),
                stderr: Vec::new(),
                callbacks: Vec::new(),
                backend: Some(backend),
            }),
        }
    }

    /// Identifier of the worker that started this command.
    #[must_use]
    pub const fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// The command text as passed to `execute`.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Environment override supplied when the command was started.
    #[must_use]
    pub const fn environment(&self) -> Option<&Environment> {
        self.environment.as_ref()
    }

    /// Returns the exit status, polling once without blocking if it is not
    /// yet known. Always `None` for a command cancelled before it exited.
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        self.refresh();
        self.state.lock().exit_status
    }

    /// Returns all standard output captured so far.
    #[must_use]
    pub fn stdout(&self) -> Vec<u8> {
        self.refresh();
        self.state.lock().stdout.clone()
    }

    /// Returns all standard error captured so far.
    #[must_use]
    pub fn stderr(&self) -> Vec<u8> {
        self.refresh();
        self.state.lock().stderr.clone()
    }

    /// Returns `true` once [`Command::cancel`] has succeeded.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Returns a snapshot of the status and both output buffers.
    #[must_use]
    pub fn output(&self) -> CommandOutput {
        self.refresh();
        let state = self.state.lock();
        CommandOutput {
            exit_status: state.exit_status,
            cancelled: state.cancelled,
            stdout: state.stdout.clone(),
            stderr: state.stderr.clone(),
        }
    }

    /// Polls until the command exits, is cancelled, or `timeout` elapses.
    ///
    /// Each backend poll receives the remaining budget (capped at a short
    /// slice), so the total time blocked never exceeds `timeout`. `None`
    /// waits indefinitely. Returns the exit status, or `None` on timeout or
    /// cancellation.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<i32> {
        let deadline = timeout.and_then(|limit| Instant::now().checked_add(limit));
        loop {
            let slice = deadline.map_or(POLL_SLICE, |at| {
                at.saturating_duration_since(Instant::now())
                    .min(POLL_SLICE)
            });
            self.poll(Some(slice));
            {
                let state = self.state.lock();
                if state.is_terminal() {
                    return state.exit_status;
                }
            }
            if deadline.is_some_and(|at| Instant::now() >= at) {
                return None;
            }
        }
    }

    /// Terminates the command and marks it cancelled.
    ///
    /// Output captured before the call is kept. Pending callbacks fire.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::AlreadyCancelled`] when called twice.
    pub fn cancel(&self) -> Result<(), WorkerError> {
        let ready = {
            let mut state = self.state.lock();
            if state.cancelled {
                return Err(WorkerError::AlreadyCancelled {
                    command: self.text.clone(),
                });
            }
            if let Some(mut backend) = state.backend.take() {
                backend.terminate();
            }
            state.cancelled = true;
            state.take_ready_callbacks()
        };
        tracing::info!(worker = %self.worker, command = %self.text, "command cancelled");
        self.fire(ready);
        Ok(())
    }

    /// Registers `callback` to run once the command is terminal. Runs it
    /// immediately when the command already is.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        let run_now = {
            let mut state = self.state.lock();
            if state.is_terminal() {
                Some(callback)
            } else {
                state.callbacks.push(Box::new(callback));
                None
            }
        };
        if let Some(immediate) = run_now {
            immediate(self);
        }
    }

    fn refresh(&self) {
        let terminal = self.state.lock().is_terminal();
        if !terminal {
            self.poll(Some(Duration::ZERO));
        }
    }

    fn poll(&self, timeout: Option<Duration>) {
        let ready = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(backend) = state.backend.as_mut() {
                let outcome = backend.poll(timeout);
                state.stdout.extend(outcome.stdout);
                state.stderr.extend(outcome.stderr);
                if let Some(code) = outcome.exit_status {
                    state.exit_status = Some(code);
                    state.backend = None;
                    tracing::debug!(worker = %self.worker, command = %self.text, code, "command exited");
                }
            }
            state.take_ready_callbacks()
        };
        self.fire(ready);
    }

    fn fire(&self, callbacks: Vec<Callback>) {
        for callback in callbacks {
            callback(self);
        }
    }
}

/// Snapshot of a command's status and raw output.
///
/// Output stays raw bytes; decoding is an explicit call.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CommandOutput {
    /// Exit status, when known.
    pub exit_status: Option<i32>,
    /// Whether the command was cancelled.
    pub cancelled: bool,
    /// Raw standard output.
    pub stdout: Vec<u8>,
    /// Raw standard error.
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Decodes standard output, replacing invalid UTF-8 sequences.
    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Decodes standard error, replacing invalid UTF-8 sequences.
    #[must_use]
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Returns `true` when the command exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_status, Some(0))
    }
}
