//! Error types surfaced by workers, commands, pools and groups.
//!
//! Lifecycle misuse (double close, double cancel, foreign release, duplicate
//! or unknown primitive names) is reported immediately as a hard error.
//! Transport hiccups while draining remote output never reach this type; the
//! remote command backend logs and retries them instead.

use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::session::TransportError;

/// Kind of named coordination primitive registered in a worker group.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PrimitiveKind {
    /// A named mutual-exclusion lock.
    Lock,
    /// A named reusable barrier.
    Barrier,
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock => f.write_str("lock"),
            Self::Barrier => f.write_str("barrier"),
        }
    }
}

/// Errors raised by worker, command, pool and group operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WorkerError {
    /// Raised when closing a worker that is already closed.
    #[error("{worker} is already closed")]
    AlreadyClosed {
        /// Display form of the worker.
        worker: String,
    },
    /// Raised when executing a command on a closed worker.
    #[error("{worker} is closed and cannot execute commands")]
    WorkerClosed {
        /// Display form of the worker.
        worker: String,
    },
    /// Raised when cancelling a command twice.
    #[error("command `{command}` is already cancelled")]
    AlreadyCancelled {
        /// Text of the cancelled command.
        command: String,
    },
    /// Raised when releasing a worker that is not leased from the pool.
    #[error("{worker} is not from this pool")]
    ForeignWorker {
        /// Display form of the worker.
        worker: String,
    },
    /// Raised when a lock or barrier name is already registered.
    #[error("a {kind} named `{name}` already exists")]
    DuplicateName {
        /// Kind of primitive being created.
        kind: PrimitiveKind,
        /// Name that clashed.
        name: String,
    },
    /// Raised when a lock or barrier name is not registered.
    #[error("no {kind} named `{name}`")]
    NotFound {
        /// Kind of primitive being looked up.
        kind: PrimitiveKind,
        /// Name that was not found.
        name: String,
    },
    /// Raised when releasing a lock nobody holds.
    #[error("lock `{name}` is not held")]
    LockNotHeld {
        /// Lock name.
        name: String,
    },
    /// Raised when adding a worker that is already a member of the group.
    #[error("{worker} is already in this group")]
    AlreadyMember {
        /// Display form of the worker.
        worker: String,
    },
    /// Raised when removing a worker that is not a member of the group.
    #[error("{worker} is not in this group")]
    NotMember {
        /// Display form of the worker.
        worker: String,
    },
    /// Raised when adding a worker that belongs to another group.
    #[error("{worker} is already in another group")]
    AlreadyGrouped {
        /// Display form of the worker.
        worker: String,
    },
    /// Raised when a local process cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a local filesystem operation fails.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a file or path operation executed over a session fails.
    #[error("remote {operation} on {path} failed with status {status:?}: {stderr}")]
    Remote {
        /// Short name of the operation, for example `stat`.
        operation: String,
        /// Path the operation targeted.
        path: Utf8PathBuf,
        /// Remote exit status, when one was reported.
        status: Option<i32>,
        /// Standard error captured from the remote command.
        stderr: String,
    },
    /// Raised when changing into a path that is not a directory.
    #[error("{path} is not a directory")]
    NotADirectory {
        /// Path that was rejected.
        path: Utf8PathBuf,
    },
    /// Raised when no Python interpreter could be resolved on the worker.
    #[error("no python interpreter found on {worker}")]
    PythonUnavailable {
        /// Display form of the worker.
        worker: String,
    },
    /// Raised when the remote transport fails outside command polling.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl WorkerError {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
