//! Opaque job records settled from command outcomes.
//!
//! A scheduling layer owns jobs; this crate only lets a job follow a command
//! so its status moves from active to success or failure when the command
//! finishes.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::command::Command;

/// Lifecycle of a [`Job`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a worker.
    #[default]
    Scheduled,
    /// A command is running.
    Active,
    /// The command exited with status 0.
    Success,
    /// Finished, but with warnings the scheduler cares about.
    Unstable,
    /// The command failed or was cancelled.
    Failure,
}

impl JobStatus {
    /// Returns `true` once the job can no longer change on its own.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Success | Self::Unstable | Self::Failure)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scheduled => "scheduled",
            Self::Active => "active",
            Self::Success => "success",
            Self::Unstable => "unstable",
            Self::Failure => "failure",
        })
    }
}

/// A named unit of scheduled work.
#[derive(Debug)]
pub struct Job {
    id: Uuid,
    name: String,
    status: Mutex<JobStatus>,
}

/// Serialisable view of a [`Job`] at one instant.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct JobSnapshot {
    /// Job identifier.
    pub id: Uuid,
    /// Job name.
    pub name: String,
    /// Status when the snapshot was taken.
    pub status: JobStatus,
}

impl Job {
    /// Creates a scheduled job with a fresh identifier.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: Mutex::new(JobStatus::Scheduled),
        }
    }

    /// Job identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Job name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        *self.status.lock()
    }

    /// Overwrites the status.
    pub fn set_status(&self, status: JobStatus) {
        let mut current = self.status.lock();
        tracing::debug!(job = %self.id, from = %*current, to = %status, "job status changed");
        *current = status;
    }

    /// Marks the job active and settles it when `command` finishes: success
    /// for exit status 0, failure otherwise.
    pub fn follow(self: &Arc<Self>, command: &Command) {
        self.set_status(JobStatus::Active);
        let job = Arc::clone(self);
        command.add_callback(move |finished| {
            let status = if finished.exit_status() == Some(0) && !finished.cancelled() {
                JobStatus::Success
            } else {
                JobStatus::Failure
            };
            job.set_status(status);
        });
    }

    /// Captures the job for reporting.
    #[must_use]
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            name: self.name.clone(),
            status: self.status(),
        }
    }
}
