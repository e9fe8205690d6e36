//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedSession`] stands in for an SSH session: channel scripts and
//! `exec` responses are served in FIFO order and every request is recorded
//! for assertions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::session::{Channel, ChannelEvent, ExecOutput, Session, TransportError};

const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// One scripted action of a [`ScriptedChannel`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Step {
    /// Yields bytes on standard output.
    Stdout(Vec<u8>),
    /// Yields bytes on standard error.
    Stderr(Vec<u8>),
    /// Fails the next read with the given error.
    Fail(TransportError),
    /// Records the exit status; later steps are still delivered.
    Exit(i32),
}

/// Channel double replaying a fixed script.
#[derive(Debug)]
pub struct ScriptedChannel {
    steps: VecDeque<Step>,
    status: Option<i32>,
    closed: Arc<AtomicBool>,
}

impl ScriptedChannel {
    /// Creates a channel that replays `steps` on successive reads.
    #[must_use]
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into(),
            status: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a flag that flips once [`Channel::close`] is called.
    #[must_use]
    pub fn close_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

impl Channel for ScriptedChannel {
    fn read(&mut self, timeout: Option<Duration>) -> Result<Option<ChannelEvent>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        while let Some(step) = self.steps.pop_front() {
            match step {
                Step::Stdout(bytes) => return Ok(Some(ChannelEvent::Stdout(bytes))),
                Step::Stderr(bytes) => return Ok(Some(ChannelEvent::Stderr(bytes))),
                Step::Fail(err) => return Err(err),
                Step::Exit(code) => self.status = Some(code),
            }
        }
        thread::sleep(timeout.map_or(IDLE_SLEEP, |limit| limit.min(IDLE_SLEEP)));
        Ok(None)
    }

    fn exit_status(&mut self) -> Result<Option<i32>, TransportError> {
        Ok(self.status)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Records a single [`Session::exec`] call made through [`ScriptedSession`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecInvocation {
    /// Command text sent to the session.
    pub command: String,
    /// Bytes fed on standard input, if any.
    pub input: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct SessionState {
    channels: VecDeque<Vec<Step>>,
    exec_responses: VecDeque<ExecOutput>,
    opened: Vec<String>,
    channel_flags: Vec<Arc<AtomicBool>>,
    execs: Vec<ExecInvocation>,
    closed: bool,
}

/// Session double serving pre-seeded channel scripts and exec responses.
///
/// Channels with no queued script exit with status zero; execs with no
/// queued response succeed with empty output. Clones share state, so a test
/// can keep one handle while a worker owns the other.
#[derive(Clone, Debug, Default)]
pub struct ScriptedSession {
    state: Arc<Mutex<SessionState>>,
}

impl ScriptedSession {
    /// Creates a session with nothing queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the `pwd` and `env` responses a remote worker reads on start.
    #[must_use]
    pub fn with_bootstrap(cwd: &str, environment: &[(&str, &str)]) -> Self {
        let session = Self::new();
        session.push_exec(0, format!("{cwd}\n"), "");
        let rendered: String = environment
            .iter()
            .map(|(key, value)| format!("{key}={value}\n"))
            .collect();
        session.push_exec(0, rendered, "");
        session
    }

    /// Queues the script for the next opened channel.
    pub fn push_channel(&self, steps: Vec<Step>) {
        self.state.lock().channels.push_back(steps);
    }

    /// Queues the response for the next exec call.
    pub fn push_exec(&self, code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) {
        self.push_exec_output(ExecOutput {
            code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    /// Queues an explicit exec response.
    pub fn push_exec_output(&self, output: ExecOutput) {
        self.state.lock().exec_responses.push_back(output);
    }

    /// Returns the command text of every opened channel, in order.
    #[must_use]
    pub fn opened_commands(&self) -> Vec<String> {
        self.state.lock().opened.clone()
    }

    /// Returns whether the channel opened at `index` has been closed.
    #[must_use]
    pub fn channel_closed(&self, index: usize) -> bool {
        self.state
            .lock()
            .channel_flags
            .get(index)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Returns a snapshot of all exec calls recorded so far.
    #[must_use]
    pub fn exec_invocations(&self) -> Vec<ExecInvocation> {
        self.state.lock().execs.clone()
    }

    /// Returns whether [`Session::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Session for ScriptedSession {
    type Channel = ScriptedChannel;

    fn open_channel(&self, command: &str) -> Result<Self::Channel, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.opened.push(command.to_owned());
        let steps = state
            .channels
            .pop_front()
            .unwrap_or_else(|| vec![Step::Exit(0)]);
        let channel = ScriptedChannel::new(steps);
        state.channel_flags.push(channel.close_handle());
        Ok(channel)
    }

    fn exec(&self, command: &str, input: Option<&[u8]>) -> Result<ExecOutput, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.execs.push(ExecInvocation {
            command: command.to_owned(),
            input: input.map(<[u8]>::to_vec),
        });
        Ok(state.exec_responses.pop_front().unwrap_or_else(|| ExecOutput {
            code: Some(0),
            ..ExecOutput::default()
        }))
    }

    fn close(&self) -> Result<(), TransportError> {
        self.state.lock().closed = true;
        Ok(())
    }
}
