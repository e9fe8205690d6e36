//! Core library for the Foreman build-farm execution layer.
//!
//! Callers obtain a [`Worker`] (the local machine or an authenticated SSH
//! session), issue shell commands against it and poll the resulting
//! [`Command`] handles. Commands run concurrently and never block `execute`.
//! Workers are leased from a bounded [`WorkerPool`] and coordinated through
//! the named locks and reusable barriers of a [`WorkerGroup`].

pub mod command;
pub mod config;
pub mod error;
pub mod group;
pub mod job;
pub mod pool;
pub(crate) mod pump;
pub mod session;
pub mod test_support;
pub mod worker;

pub use command::{Command, CommandOutput};
pub use config::{ConfigError, SshConfig};
pub use error::{PrimitiveKind, WorkerError};
pub use group::{GroupId, WorkerGroup};
pub use job::{Job, JobSnapshot, JobStatus};
pub use pool::{PoolId, WorkerPool};
pub use session::{Channel, ChannelEvent, ExecOutput, Session, TransportError};
pub use session::openssh::OpenSshSession;
pub use worker::local::LocalWorker;
pub use worker::python::PythonVersion;
pub use worker::remote::RemoteWorker;
pub use worker::{
    Environment, FileAttributes, FileStore, OpenMode, Worker, WorkerCore, WorkerFile, WorkerId,
};
