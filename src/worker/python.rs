//! Python interpreter probes and execution.
//!
//! Each capability is probed at most once per worker by running a short
//! command with the worker's probe timeout. A failed probe leaves the value
//! unresolved, so a later call tries again.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use camino::Utf8PathBuf;
use parking_lot::Mutex;
use shell_escape::unix::escape;
use uuid::Uuid;

use super::{Environment, OpenMode, Worker};
use crate::command::Command;
use crate::error::WorkerError;

const EXECUTABLE_PROBE: &str = "command -v python3 || command -v python";
const VERSION_PROBE: &str = "import sys; print('%d.%d.%d' % sys.version_info[:3])";
const TMP_PROBE: &str = "import tempfile; print(tempfile.gettempdir())";

/// A `major.minor.micro` interpreter version.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct PythonVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Micro version.
    pub micro: u32,
}

impl PythonVersion {
    /// Parses `3.12.1` style output.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().split('.').map(str::parse::<u32>);
        let major = parts.next()?.ok()?;
        let minor = parts.next()?.ok()?;
        let micro = parts.next()?.ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            micro,
        })
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

pub(crate) fn resolve_executable<W: Worker + ?Sized>(worker: &W) -> Option<String> {
    cached(&worker.core().capabilities().python_executable, || {
        run_probe(worker, EXECUTABLE_PROBE)
    })
}

pub(crate) fn resolve_version<W: Worker + ?Sized>(worker: &W) -> Option<PythonVersion> {
    cached(&worker.core().capabilities().python_version, || {
        let executable = resolve_executable(worker)?;
        let output = run_probe(worker, &inline(&executable, VERSION_PROBE))?;
        PythonVersion::parse(&output)
    })
}

pub(crate) fn resolve_tmp_directory<W: Worker + ?Sized>(worker: &W) -> Option<Utf8PathBuf> {
    cached(&worker.core().capabilities().tmp_directory, || {
        let executable = resolve_executable(worker)?;
        run_probe(worker, &inline(&executable, TMP_PROBE)).map(Utf8PathBuf::from)
    })
}

pub(crate) fn execute_python<W: Worker + ?Sized>(
    worker: &W,
    code: &str,
    environment: Option<&Environment>,
) -> Result<Arc<Command>, WorkerError> {
    let unavailable = || WorkerError::PythonUnavailable {
        worker: worker.core().to_string(),
    };
    let executable = worker.python_executable().ok_or_else(unavailable)?;
    if !code.contains('\n') {
        return worker.execute_with(&inline(&executable, code), environment);
    }

    let tmp = worker.tmp_directory().ok_or_else(unavailable)?;
    let script = tmp.join(format!("foreman-{}.py", Uuid::new_v4().simple()));
    let files = worker.files();
    {
        let mut file = files.open(&script, OpenMode::Write)?;
        file.write_all(code.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|err| WorkerError::io(script.clone(), &err))?;
    }

    let text = format!(
        "{} {}",
        escape(executable.as_str().into()),
        escape(script.as_str().into())
    );
    let command = match worker.execute_with(&text, environment) {
        Ok(started) => started,
        Err(err) => {
            files.remove(&script).ok();
            return Err(err);
        }
    };
    command.add_callback(move |_| {
        if let Err(err) = files.remove(&script) {
            tracing::debug!(script = %script, error = %err, "removing staged python script failed");
        }
    });
    Ok(command)
}

fn inline(executable: &str, code: &str) -> String {
    format!("{} -c {}", escape(executable.into()), escape(code.into()))
}

fn cached<T: Clone>(slot: &Mutex<Option<T>>, resolve: impl FnOnce() -> Option<T>) -> Option<T> {
    let mut value = slot.lock();
    if value.is_none() {
        *value = resolve();
    }
    value.clone()
}

fn run_probe<W: Worker + ?Sized>(worker: &W, text: &str) -> Option<String> {
    let command = match worker.execute(text) {
        Ok(started) => started,
        Err(err) => {
            tracing::debug!(worker = %worker.core(), probe = text, error = %err, "probe could not start");
            return None;
        }
    };
    let status = command.wait(Some(worker.core().probe_timeout()));
    if status != Some(0) {
        if status.is_none() && !command.cancelled() {
            command.cancel().ok();
        }
        tracing::debug!(worker = %worker.core(), probe = text, ?status, "probe failed");
        return None;
    }
    let output = command.output().stdout_text();
    let trimmed = output.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}
