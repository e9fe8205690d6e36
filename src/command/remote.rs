//! Command backend reading from a session channel.
//!
//! Transport failures while draining are treated as transient: they are
//! logged and the command stays running, so a later poll retries.

use std::time::{Duration, Instant};

use super::{CommandBackend, PollOutcome};
use crate::session::{Channel, TransportError};

const READ_TICK: Duration = Duration::from_millis(10);

/// A remote command in flight on a channel.
pub struct RemoteBackend<C: Channel> {
    channel: C,
    closed: bool,
}

impl<C: Channel> RemoteBackend<C> {
    /// Wraps an opened channel.
    pub const fn new(channel: C) -> Self {
        Self {
            channel,
            closed: false,
        }
    }

    fn drain(&mut self, outcome: &mut PollOutcome) {
        loop {
            match self.channel.read(Some(Duration::ZERO)) {
                Ok(Some(event)) => outcome.push(event),
                Ok(None) => break,
                Err(err) => {
                    log_suppressed(&err);
                    break;
                }
            }
        }
    }
}

impl<C: Channel> CommandBackend for RemoteBackend<C> {
    fn poll(&mut self, timeout: Option<Duration>) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        if self.closed {
            return outcome;
        }
        let deadline = timeout.and_then(|limit| Instant::now().checked_add(limit));
        let bounded = timeout.is_some();
        loop {
            let read_timeout = match deadline {
                Some(at) => Some(at.saturating_duration_since(Instant::now()).min(READ_TICK)),
                None if bounded => Some(READ_TICK),
                None => None,
            };
            match self.channel.read(read_timeout) {
                Ok(Some(event)) => outcome.push(event),
                Ok(None) => {}
                Err(err) => {
                    log_suppressed(&err);
                    return outcome;
                }
            }
            match self.channel.exit_status() {
                Ok(Some(code)) => {
                    outcome.exit_status = Some(code);
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    log_suppressed(&err);
                    return outcome;
                }
            }
            if deadline.is_some_and(|at| Instant::now() >= at) {
                break;
            }
        }
        self.drain(&mut outcome);
        outcome
    }

    fn terminate(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.channel.close() {
            tracing::debug!(error = %err, "closing remote channel failed");
        }
    }
}

fn log_suppressed(err: &TransportError) {
    if err.is_transient() {
        tracing::debug!(error = %err, "transient channel failure; will retry on next poll");
    } else {
        tracing::warn!(error = %err, "channel failure while polling remote command");
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::test_support::{ScriptedChannel, Step};

    fn channel(steps: Vec<Step>) -> ScriptedChannel {
        ScriptedChannel::new(steps)
    }

    #[test]
    fn collects_output_and_status() {
        let mut backend = RemoteBackend::new(channel(vec![
            Step::Stdout(b"one ".to_vec()),
            Step::Stderr(b"oops".to_vec()),
            Step::Stdout(b"two".to_vec()),
            Step::Exit(0),
        ]));

        let outcome = backend.poll(Some(Duration::from_secs(1)));

        assert_eq!(outcome.stdout, b"one two");
        assert_eq!(outcome.stderr, b"oops");
        assert_eq!(outcome.exit_status, Some(0));
    }

    #[test]
    fn drains_output_arriving_after_status() {
        let mut backend = RemoteBackend::new(channel(vec![
            Step::Exit(2),
            Step::Stdout(b"late".to_vec()),
        ]));

        let outcome = backend.poll(Some(Duration::from_secs(1)));

        assert_eq!(outcome.exit_status, Some(2));
        assert_eq!(outcome.stdout, b"late");
    }

    #[rstest]
    #[case(TransportError::Channel { message: String::from("eagain") })]
    #[case(TransportError::Closed)]
    fn failures_leave_command_running(#[case] failure: TransportError) {
        let mut backend = RemoteBackend::new(channel(vec![
            Step::Stdout(b"partial".to_vec()),
            Step::Fail(failure),
            Step::Exit(0),
        ]));

        let first = backend.poll(Some(Duration::from_secs(1)));
        assert_eq!(first.stdout, b"partial");
        assert_eq!(first.exit_status, None);

        let second = backend.poll(Some(Duration::from_secs(1)));
        assert_eq!(second.exit_status, Some(0));
    }

    #[test]
    fn zero_timeout_returns_promptly() {
        let mut backend = RemoteBackend::new(channel(Vec::new()));
        let started = Instant::now();

        let outcome = backend.poll(Some(Duration::ZERO));

        assert_eq!(outcome, PollOutcome::default());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn terminate_closes_channel_once() {
        let scripted = channel(vec![Step::Stdout(b"never read".to_vec())]);
        let closed = scripted.close_handle();
        let mut backend = RemoteBackend::new(scripted);

        backend.terminate();
        backend.terminate();

        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(backend.poll(Some(Duration::ZERO)), PollOutcome::default());
    }
}
