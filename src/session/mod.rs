//! Remote transport abstraction.
//!
//! A [`Session`] is an already-authenticated connection to a remote host. It
//! opens one [`Channel`] per command and runs short synchronous commands via
//! [`Session::exec`] for file and bootstrap operations. The production
//! implementation lives in [`openssh`]; tests use the scripted doubles from
//! [`crate::test_support`].

pub mod openssh;

use std::time::Duration;

use thiserror::Error;

/// A chunk of output read from a channel or a local stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelEvent {
    /// Bytes written to standard output.
    Stdout(Vec<u8>),
    /// Bytes written to standard error.
    Stderr(Vec<u8>),
}

/// Captured result of a synchronous [`Session::exec`] call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecOutput {
    /// Remote exit status, when the remote side reported one.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Returns standard output decoded lossily, with surrounding whitespace
    /// trimmed.
    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_owned()
    }

    /// Returns standard error decoded lossily, with surrounding whitespace
    /// trimmed.
    #[must_use]
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_owned()
    }
}

/// Errors raised by the remote transport.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Raised when the session cannot be established or authenticated.
    #[error("failed to connect to {host}: {message}")]
    Connect {
        /// Host the connection targeted.
        host: String,
        /// Diagnostic reported by the transport.
        message: String,
    },
    /// Raised when a channel read or status check fails.
    #[error("channel failure: {message}")]
    Channel {
        /// Diagnostic reported by the transport.
        message: String,
    },
    /// Raised when local process plumbing for the transport fails.
    #[error("transport I/O failure: {message}")]
    Io {
        /// Operating system error string.
        message: String,
    },
    /// Raised when using a session after it was closed.
    #[error("session is closed")]
    Closed,
}

impl TransportError {
    /// Returns `true` for failures a later poll may recover from.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Channel { .. } | Self::Io { .. })
    }
}

/// An authenticated connection to a remote host.
pub trait Session: Send + Sync + 'static {
    /// Channel type produced by [`Session::open_channel`].
    type Channel: Channel;

    /// Starts `command` on a new channel and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the channel cannot be opened.
    fn open_channel(&self, command: &str) -> Result<Self::Channel, TransportError>;

    /// Runs `command` to completion, feeding `input` on its standard input.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the command cannot be run at all. A
    /// non-zero remote status is reported through [`ExecOutput::code`].
    fn exec(&self, command: &str, input: Option<&[u8]>) -> Result<ExecOutput, TransportError>;

    /// Tears the session down.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when releasing transport resources fails.
    fn close(&self) -> Result<(), TransportError>;
}

/// A single remote command in flight.
pub trait Channel: Send + 'static {
    /// Reads the next output chunk.
    ///
    /// `None` blocks until output arrives or the channel ends; `Some` waits
    /// at most the given duration. Returns `Ok(None)` when nothing arrived.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the read fails.
    fn read(&mut self, timeout: Option<Duration>) -> Result<Option<ChannelEvent>, TransportError>;

    /// Returns the remote exit status once the command has ended and all of
    /// its output has been read.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the status cannot be queried.
    fn exit_status(&mut self) -> Result<Option<i32>, TransportError>;

    /// Terminates the remote command and releases the channel.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the channel cannot be closed cleanly.
    fn close(&mut self) -> Result<(), TransportError>;
}
