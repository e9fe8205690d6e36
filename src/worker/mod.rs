//! Execution targets that run commands and expose a file store.
//!
//! A worker owns an environment mapping and a working directory, and keeps
//! weak handles to the commands it started so close can cancel them. [`WorkerCore`] holds that shared bookkeeping; the
//! [`Worker`] trait layers every variant-independent operation on top of
//! three hooks: spawning a command backend, handing out a [`FileStore`], and
//! releasing transport resources on close.
//!
//! Paths given to worker operations resolve against the worker's own
//! working directory, never the controlling process's.

pub mod local;
pub mod path;
pub mod python;
pub mod remote;

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::mem;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;

use crate::command::{Command, CommandBackend};
use crate::error::WorkerError;
use crate::group::GroupId;
use crate::pool::PoolId;
use python::PythonVersion;

/// Environment variables applied to commands started on a worker.
pub type Environment = BTreeMap<String, String>;

/// Default time allowed for a capability probe to finish.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-unique worker identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Mode used by [`Worker::open_file`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Read an existing file.
    Read,
    /// Create or truncate, then write.
    Write,
    /// Create if missing, then append.
    Append,
}

/// File metadata reported by [`Worker::stat_file`], in `stat(2)` terms.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FileAttributes {
    /// File type and permission bits.
    pub mode: u32,
    /// Inode number.
    pub ino: u64,
    /// Device identifier.
    pub dev: u64,
    /// Number of hard links.
    pub nlink: u64,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// Last access time, seconds since the epoch.
    pub atime: i64,
    /// Last modification time, seconds since the epoch.
    pub mtime: i64,
    /// Last status change time, seconds since the epoch.
    pub ctime: i64,
}

impl FileAttributes {
    const TYPE_MASK: u32 = 0o170_000;
    const DIRECTORY: u32 = 0o040_000;
    const REGULAR: u32 = 0o100_000;
    const SYMLINK: u32 = 0o120_000;

    /// Returns `true` for directories.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.mode & Self::TYPE_MASK == Self::DIRECTORY
    }

    /// Returns `true` for regular files.
    #[must_use]
    pub const fn is_file(&self) -> bool {
        self.mode & Self::TYPE_MASK == Self::REGULAR
    }

    /// Returns `true` for symbolic links.
    #[must_use]
    pub const fn is_symlink(&self) -> bool {
        self.mode & Self::TYPE_MASK == Self::SYMLINK
    }
}

/// An open file on a worker.
pub trait WorkerFile: Read + Write + Send {}

impl<T: Read + Write + Send> WorkerFile for T {}

/// Backend-specific file operations. Paths are already resolved.
pub trait FileStore: Send + Sync {
    /// Lists the entry names of a directory, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the directory cannot be read.
    fn list(&self, path: &Utf8Path) -> Result<Vec<String>, WorkerError>;

    /// Moves `worker_path` to `local_path` on the controlling machine.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when either side cannot be accessed.
    fn fetch(&self, worker_path: &Utf8Path, local_path: &Utf8Path) -> Result<(), WorkerError>;

    /// Moves `local_path` on the controlling machine to `worker_path`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when either side cannot be accessed.
    fn store(&self, local_path: &Utf8Path, worker_path: &Utf8Path) -> Result<(), WorkerError>;

    /// Opens a file for reading or writing.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the file cannot be opened.
    fn open(&self, path: &Utf8Path, mode: OpenMode) -> Result<Box<dyn WorkerFile>, WorkerError>;

    /// Removes a file.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the file cannot be removed.
    fn remove(&self, path: &Utf8Path) -> Result<(), WorkerError>;

    /// Reads file metadata, following symlinks when asked.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the path cannot be inspected.
    fn stat(&self, path: &Utf8Path, follow_symlinks: bool) -> Result<FileAttributes, WorkerError>;

    /// Returns whether `path` is a directory.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the check itself fails.
    fn is_directory(&self, path: &Utf8Path) -> Result<bool, WorkerError>;

    /// Returns whether `path` is a regular file.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the check itself fails.
    fn is_file(&self, path: &Utf8Path) -> Result<bool, WorkerError>;
}

#[derive(Default)]
struct Tracking {
    commands: Vec<Weak<Command>>,
    closed: bool,
}

/// Lazily resolved interpreter facts, one lock each so a probe may depend
/// on another.
#[derive(Default)]
pub(crate) struct Capabilities {
    pub(crate) python_executable: Mutex<Option<String>>,
    pub(crate) python_version: Mutex<Option<PythonVersion>>,
    pub(crate) tmp_directory: Mutex<Option<Utf8PathBuf>>,
}

/// Bookkeeping shared by every worker variant.
pub struct WorkerCore {
    id: WorkerId,
    user: String,
    host: String,
    home: Option<Utf8PathBuf>,
    environment: Mutex<Arc<Environment>>,
    cwd: Mutex<Utf8PathBuf>,
    tracking: Mutex<Tracking>,
    pool: Mutex<Option<PoolId>>,
    group: Mutex<Option<GroupId>>,
    capabilities: Capabilities,
    probe_timeout: Duration,
}

impl fmt::Display for WorkerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Worker user={} host={}>", self.user, self.host)
    }
}

impl fmt::Debug for WorkerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerCore")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("host", &self.host)
            .field("cwd", &*self.cwd.lock())
            .finish_non_exhaustive()
    }
}

impl WorkerCore {
    /// Creates the bookkeeping for a new open worker.
    #[must_use]
    pub fn new(
        user: impl Into<String>,
        host: impl Into<String>,
        environment: Environment,
        cwd: Utf8PathBuf,
    ) -> Self {
        Self {
            id: WorkerId::next(),
            user: user.into(),
            host: host.into(),
            home: None,
            environment: Mutex::new(Arc::new(environment)),
            cwd: Mutex::new(cwd),
            tracking: Mutex::new(Tracking::default()),
            pool: Mutex::new(None),
            group: Mutex::new(None),
            capabilities: Capabilities::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Sets the home directory used to expand `~`.
    #[must_use]
    pub fn with_home(mut self, home: Option<Utf8PathBuf>) -> Self {
        self.home = home;
        self
    }

    /// Overrides how long capability probes may run.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Process-unique identifier.
    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    /// User the worker runs commands as.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Host the worker runs commands on.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Home directory, when known.
    #[must_use]
    pub fn home(&self) -> Option<&Utf8Path> {
        self.home.as_deref()
    }

    /// Time allowed for a capability probe.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Returns the current environment snapshot.
    #[must_use]
    pub fn environment(&self) -> Arc<Environment> {
        Arc::clone(&self.environment.lock())
    }

    /// Sets a variable for commands started from now on.
    pub fn set_env(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut environment = self.environment.lock();
        Arc::make_mut(&mut *environment).insert(key.into(), value.into());
    }

    /// Removes a variable, returning its previous value.
    pub fn remove_env(&self, key: &str) -> Option<String> {
        let mut environment = self.environment.lock();
        Arc::make_mut(&mut *environment).remove(key)
    }

    /// Current working directory.
    #[must_use]
    pub fn cwd(&self) -> Utf8PathBuf {
        self.cwd.lock().clone()
    }

    /// Resolves `path` against the working directory, expanding `~`.
    #[must_use]
    pub fn resolve_path(&self, path: &str) -> Utf8PathBuf {
        path::resolve(&self.cwd(), path, self.home())
    }

    /// Returns `true` once the worker has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tracking.lock().closed
    }

    /// Commands started on this worker that are still alive and not
    /// cancelled.
    #[must_use]
    pub fn commands(&self) -> Vec<Arc<Command>> {
        self.tracking
            .lock()
            .commands
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|command| !command.cancelled())
            .collect()
    }

    /// Pool the worker is leased from, if any.
    #[must_use]
    pub fn pool(&self) -> Option<PoolId> {
        *self.pool.lock()
    }

    /// Group the worker belongs to, if any.
    #[must_use]
    pub fn group(&self) -> Option<GroupId> {
        *self.group.lock()
    }

    pub(crate) fn set_cwd(&self, path: Utf8PathBuf) {
        *self.cwd.lock() = path;
    }

    pub(crate) const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub(crate) fn attach_pool(&self, pool: PoolId) {
        *self.pool.lock() = Some(pool);
    }

    pub(crate) fn detach_pool(&self) {
        *self.pool.lock() = None;
    }

    pub(crate) fn join_group(&self, group: GroupId) -> Result<(), WorkerError> {
        let mut current = self.group.lock();
        if current.is_some() {
            return Err(WorkerError::AlreadyGrouped {
                worker: self.to_string(),
            });
        }
        *current = Some(group);
        Ok(())
    }

    pub(crate) fn leave_group(&self, group: GroupId) {
        let mut current = self.group.lock();
        if *current == Some(group) {
            *current = None;
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<(), WorkerError> {
        if self.is_closed() {
            return Err(WorkerError::WorkerClosed {
                worker: self.to_string(),
            });
        }
        Ok(())
    }

    /// Worker environment overlaid by the caller override.
    pub(crate) fn effective_environment(&self, overlay: Option<&Environment>) -> Environment {
        let mut effective = (*self.environment()).clone();
        if let Some(extra) = overlay {
            effective.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        effective
    }

    /// Records a freshly started command and forgets dropped or cancelled
    /// ones. A command that raced with close is cancelled and rejected.
    pub(crate) fn track(&self, command: &Arc<Command>) -> Result<(), WorkerError> {
        let mut tracking = self.tracking.lock();
        if tracking.closed {
            drop(tracking);
            command.cancel().ok();
            return Err(WorkerError::WorkerClosed {
                worker: self.to_string(),
            });
        }
        tracking
            .commands
            .retain(|tracked| tracked.upgrade().is_some_and(|live| !live.cancelled()));
        tracking.commands.push(Arc::downgrade(command));
        Ok(())
    }

    /// Marks the worker closed and hands back the commands still alive.
    pub(crate) fn begin_close(&self) -> Result<Vec<Arc<Command>>, WorkerError> {
        let mut tracking = self.tracking.lock();
        if tracking.closed {
            return Err(WorkerError::AlreadyClosed {
                worker: self.to_string(),
            });
        }
        tracking.closed = true;
        let tracked = mem::take(&mut tracking.commands);
        drop(tracking);
        Ok(tracked.iter().filter_map(Weak::upgrade).collect())
    }
}

/// An execution target: the local machine or an authenticated session.
pub trait Worker: Send + Sync {
    /// Shared bookkeeping.
    fn core(&self) -> &WorkerCore;

    /// File operations for this worker.
    fn files(&self) -> Arc<dyn FileStore>;

    /// Starts `text` in `cwd` with exactly `environment`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the backend cannot be started.
    fn spawn_backend(
        &self,
        text: &str,
        environment: &Environment,
        cwd: &Utf8Path,
    ) -> Result<Box<dyn CommandBackend>, WorkerError>;

    /// Releases transport resources once outstanding commands are cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when tearing down the transport fails.
    fn release_resources(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Resolves a path on the controlling machine, used by the local side of
    /// [`Worker::get_file`] and [`Worker::put_file`].
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Io`] when the process working directory is
    /// unavailable or not UTF-8.
    fn resolve_controller_path(&self, path: &str) -> Result<Utf8PathBuf, WorkerError> {
        let process_cwd = std::env::current_dir().map_err(|err| WorkerError::io(".", &err))?;
        let base = Utf8PathBuf::from_path_buf(process_cwd).map_err(|raw| WorkerError::Io {
            path: Utf8PathBuf::from(raw.to_string_lossy().into_owned()),
            message: String::from("working directory is not valid UTF-8"),
        })?;
        Ok(path::resolve(&base, &path::expand_local_tilde(path), None))
    }

    /// Process-unique identifier.
    fn id(&self) -> WorkerId {
        self.core().id()
    }

    /// Current working directory.
    fn cwd(&self) -> Utf8PathBuf {
        self.core().cwd()
    }

    /// Current environment snapshot.
    fn environment(&self) -> Arc<Environment> {
        self.core().environment()
    }

    /// Sets a variable for commands started from now on.
    fn set_env(&self, key: &str, value: &str) {
        self.core().set_env(key, value);
    }

    /// Removes a variable, returning its previous value.
    fn remove_env(&self, key: &str) -> Option<String> {
        self.core().remove_env(key)
    }

    /// Starts `text` with the worker environment and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::WorkerClosed`] on a closed worker, or the
    /// backend's start failure.
    fn execute(&self, text: &str) -> Result<Arc<Command>, WorkerError> {
        self.execute_with(text, None)
    }

    /// Starts `text` with the worker environment overlaid by `environment`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::WorkerClosed`] on a closed worker, or the
    /// backend's start failure.
    fn execute_with(
        &self,
        text: &str,
        environment: Option<&Environment>,
    ) -> Result<Arc<Command>, WorkerError> {
        let core = self.core();
        core.ensure_open()?;
        let effective = core.effective_environment(environment);
        let backend = self.spawn_backend(text, &effective, &core.cwd())?;
        let command = Arc::new(Command::new(
            core.id(),
            text,
            environment.cloned(),
            backend,
        ));
        core.track(&command)?;
        tracing::debug!(worker = %core, command = text, "command started");
        Ok(command)
    }

    /// Runs Python `code` with the worker's interpreter. Multi-line code is
    /// staged in the worker's temporary directory and removed once the
    /// command finishes.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::PythonUnavailable`] when no interpreter or
    /// temporary directory resolves, or any error from staging or starting
    /// the command.
    fn execute_python(
        &self,
        code: &str,
        environment: Option<&Environment>,
    ) -> Result<Arc<Command>, WorkerError> {
        python::execute_python(self, code, environment)
    }

    /// Changes the working directory for commands started from now on.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::NotADirectory`] when the target is not a
    /// directory.
    fn change_directory(&self, path: &str) -> Result<(), WorkerError> {
        let target = self.core().resolve_path(path);
        if !self.files().is_directory(&target)? {
            return Err(WorkerError::NotADirectory { path: target });
        }
        tracing::debug!(worker = %self.core(), cwd = %target, "changed directory");
        self.core().set_cwd(target);
        Ok(())
    }

    /// Lists entry names of a directory, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the directory cannot be read.
    fn list_directory(&self, path: &str) -> Result<Vec<String>, WorkerError> {
        self.files().list(&self.core().resolve_path(path))
    }

    /// Moves a worker file to the controlling machine. The source no longer
    /// exists afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when either side cannot be accessed.
    fn get_file(&self, worker_path: &str, local_path: &str) -> Result<(), WorkerError> {
        let source = self.core().resolve_path(worker_path);
        let destination = self.resolve_controller_path(local_path)?;
        self.files().fetch(&source, &destination)
    }

    /// Moves a file from the controlling machine to the worker. The source
    /// no longer exists afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when either side cannot be accessed.
    fn put_file(&self, local_path: &str, worker_path: &str) -> Result<(), WorkerError> {
        let source = self.resolve_controller_path(local_path)?;
        let destination = self.core().resolve_path(worker_path);
        self.files().store(&source, &destination)
    }

    /// Opens a worker file.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the file cannot be opened.
    fn open_file(&self, path: &str, mode: OpenMode) -> Result<Box<dyn WorkerFile>, WorkerError> {
        self.files().open(&self.core().resolve_path(path), mode)
    }

    /// Removes a worker file.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the file cannot be removed.
    fn remove_file(&self, path: &str) -> Result<(), WorkerError> {
        self.files().remove(&self.core().resolve_path(path))
    }

    /// Reads worker file metadata.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the path cannot be inspected.
    fn stat_file(&self, path: &str, follow_symlinks: bool) -> Result<FileAttributes, WorkerError> {
        self.files()
            .stat(&self.core().resolve_path(path), follow_symlinks)
    }

    /// Returns whether `path` is a directory on the worker.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the check fails.
    fn is_directory(&self, path: &str) -> Result<bool, WorkerError> {
        self.files().is_directory(&self.core().resolve_path(path))
    }

    /// Returns whether `path` is a regular file on the worker.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the check fails.
    fn is_file(&self, path: &str) -> Result<bool, WorkerError> {
        self.files().is_file(&self.core().resolve_path(path))
    }

    /// Path of the Python interpreter, resolved once and cached.
    fn python_executable(&self) -> Option<String> {
        python::resolve_executable(self)
    }

    /// Version of the Python interpreter, resolved once and cached.
    fn python_version(&self) -> Option<PythonVersion> {
        python::resolve_version(self)
    }

    /// Temporary directory reported by the interpreter, resolved once and
    /// cached.
    fn tmp_directory(&self) -> Option<Utf8PathBuf> {
        python::resolve_tmp_directory(self)
    }

    /// Cancels every outstanding command and releases transport resources.
    /// Cancellation and release failures are logged and swallowed.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::AlreadyClosed`] when called twice.
    fn close(&self) -> Result<(), WorkerError> {
        let core = self.core();
        let outstanding = core.begin_close()?;
        for command in &outstanding {
            if let Err(err) = command.cancel() {
                tracing::debug!(worker = %core, error = %err, "ignoring cancel failure during close");
            }
        }
        if let Err(err) = self.release_resources() {
            tracing::warn!(worker = %core, error = %err, "releasing worker resources failed");
        }
        tracing::info!(worker = %core, cancelled = outstanding.len(), "worker closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::command::PollOutcome;

    #[fixture]
    fn core() -> WorkerCore {
        let mut environment = Environment::new();
        environment.insert(String::from("LANG"), String::from("C"));
        WorkerCore::new("ci", "farm-1", environment, Utf8PathBuf::from("/srv"))
            .with_home(Some(Utf8PathBuf::from("/home/ci")))
    }

    #[rstest]
    fn displays_user_and_host(core: WorkerCore) {
        assert_eq!(core.to_string(), "<Worker user=ci host=farm-1>");
    }

    #[rstest]
    fn environment_is_copy_on_write(core: WorkerCore) {
        let before = core.environment();
        core.set_env("CC", "clang");
        assert_eq!(before.get("CC"), None);
        assert_eq!(core.environment().get("CC").map(String::as_str), Some("clang"));
        assert_eq!(core.remove_env("CC").as_deref(), Some("clang"));
    }

    #[rstest]
    fn override_wins_over_worker_environment(core: WorkerCore) {
        let mut overlay = Environment::new();
        overlay.insert(String::from("LANG"), String::from("en_GB.UTF-8"));
        let effective = core.effective_environment(Some(&overlay));
        assert_eq!(effective.get("LANG").map(String::as_str), Some("en_GB.UTF-8"));
    }

    #[rstest]
    fn second_close_is_rejected(core: WorkerCore) {
        assert!(core.begin_close().expect("first close").is_empty());
        assert!(matches!(
            core.begin_close(),
            Err(WorkerError::AlreadyClosed { .. })
        ));
        assert!(matches!(
            core.ensure_open(),
            Err(WorkerError::WorkerClosed { .. })
        ));
    }

    struct Finished;

    impl CommandBackend for Finished {
        fn poll(&mut self, _timeout: Option<Duration>) -> PollOutcome {
            PollOutcome {
                exit_status: Some(0),
                ..PollOutcome::default()
            }
        }

        fn terminate(&mut self) {}
    }

    fn started(core: &WorkerCore) -> Arc<Command> {
        let command = Arc::new(Command::new(core.id(), "true", None, Box::new(Finished)));
        core.track(&command).expect("track");
        command
    }

    #[rstest]
    fn dropped_commands_are_forgotten(core: WorkerCore) {
        for _ in 0..50 {
            let command = started(&core);
            assert_eq!(command.wait(Some(Duration::from_secs(1))), Some(0));
        }
        let kept = started(&core);

        let tracked = core.commands();
        assert_eq!(tracked.len(), 1);
        assert!(tracked.first().is_some_and(|first| Arc::ptr_eq(first, &kept)));
        assert_eq!(core.tracking.lock().commands.len(), 1);
    }

    #[rstest]
    fn close_hands_back_only_live_commands(core: WorkerCore) {
        let kept = started(&core);
        drop(started(&core));

        let outstanding = core.begin_close().expect("close");

        assert_eq!(outstanding.len(), 1);
        assert!(outstanding.first().is_some_and(|first| Arc::ptr_eq(first, &kept)));
    }

    #[rstest]
    fn joins_one_group_at_a_time(core: WorkerCore) {
        let first = GroupId::next();
        core.join_group(first).expect("join");
        assert!(matches!(
            core.join_group(GroupId::next()),
            Err(WorkerError::AlreadyGrouped { .. })
        ));
        core.leave_group(first);
        assert_eq!(core.group(), None);
    }

    #[rstest]
    #[case(0o040_755, true, false, false)]
    #[case(0o100_644, false, true, false)]
    #[case(0o120_777, false, false, true)]
    fn classifies_file_types(
        #[case] mode: u32,
        #[case] dir: bool,
        #[case] file: bool,
        #[case] link: bool,
    ) {
        let attributes = FileAttributes {
            mode,
            ..FileAttributes::default()
        };
        assert_eq!(
            (attributes.is_dir(), attributes.is_file(), attributes.is_symlink()),
            (dir, file, link)
        );
    }
}
