//! Worker running commands over an authenticated session.
//!
//! Remote shells do not inherit a programmable environment, so each command
//! is prefixed with `export` statements for the worker environment and a
//! `cd` into the worker directory. File operations run small shell utilities
//! through [`Session::exec`].

use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;

use super::local::{read_local, remove_local, write_local};
use super::{Environment, FileAttributes, FileStore, OpenMode, Worker, WorkerCore, WorkerFile};
use crate::command::CommandBackend;
use crate::command::remote::RemoteBackend;
use crate::config::SshConfig;
use crate::error::WorkerError;
use crate::session::openssh::OpenSshSession;
use crate::session::{ExecOutput, Session};

/// Session variables that describe the transport rather than the host.
const TRANSPORT_VARIABLES: &[&str] = &["SSH_CLIENT", "SSH_CONNECTION", "SSH_TTY"];

const STAT_FORMAT: &str = "%f %i %d %h %u %g %s %X %Y %Z";

/// A worker bound to one remote session.
pub struct RemoteWorker<S: Session = OpenSshSession> {
    core: WorkerCore,
    session: Arc<S>,
    files: Arc<RemoteFiles<S>>,
}

impl<S: Session> fmt::Debug for RemoteWorker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteWorker")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl RemoteWorker<OpenSshSession> {
    /// Connects to `host` with the given SSH settings.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Transport`] when the session cannot be
    /// established, or a bootstrap failure from [`RemoteWorker::with_session`].
    pub fn connect(config: &SshConfig, host: &str) -> Result<Self, WorkerError> {
        let session = OpenSshSession::connect(config, host)?;
        let user = session.user().to_owned();
        Self::with_session(session, user, host)
    }
}

impl<S: Session> RemoteWorker<S> {
    /// Wraps an authenticated session, importing the remote working
    /// directory and environment.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Remote`] when `pwd` or `env` fail remotely, or
    /// [`WorkerError::Transport`] when they cannot be run.
    pub fn with_session(
        transport: S,
        user: impl Into<String>,
        host: impl Into<String>,
    ) -> Result<Self, WorkerError> {
        let session = Arc::new(transport);
        let pwd = run_checked(&*session, "pwd", Utf8Path::new("."), "pwd", None)?;
        let cwd = Utf8PathBuf::from(pwd.stdout_text());
        let env = run_checked(&*session, "env", &cwd, "env", None)?;
        let environment = parse_environment(&String::from_utf8_lossy(&env.stdout));
        let home = environment.get("HOME").map(Utf8PathBuf::from);
        let core = WorkerCore::new(user, host, environment, cwd).with_home(home);
        tracing::debug!(worker = %core, cwd = %core.cwd(), "remote worker ready");
        Ok(Self {
            core,
            files: Arc::new(RemoteFiles {
                session: Arc::clone(&session),
            }),
            session,
        })
    }

    /// Overrides how long capability probes may run.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.core = self.core.with_probe_timeout(timeout);
        self
    }

    /// The underlying session.
    #[must_use]
    pub fn session(&self) -> &S {
        &self.session
    }
}

impl<S: Session> Worker for RemoteWorker<S> {
    fn core(&self) -> &WorkerCore {
        &self.core
    }

    fn files(&self) -> Arc<dyn FileStore> {
        Arc::clone(&self.files) as Arc<dyn FileStore>
    }

    fn spawn_backend(
        &self,
        text: &str,
        environment: &Environment,
        cwd: &Utf8Path,
    ) -> Result<Box<dyn CommandBackend>, WorkerError> {
        let rendered = render_command(environment, cwd, text);
        let channel = self.session.open_channel(&rendered)?;
        Ok(Box::new(RemoteBackend::new(channel)))
    }

    fn release_resources(&self) -> Result<(), WorkerError> {
        self.session.close().map_err(WorkerError::from)
    }
}

/// Renders `export` prefixes, a `cd` into `cwd`, then the command text.
///
/// Keys that are not valid shell identifiers cannot be exported and are
/// skipped.
#[must_use]
pub fn render_command(environment: &Environment, cwd: &Utf8Path, text: &str) -> String {
    let mut rendered = String::new();
    for (key, value) in environment {
        if !is_shell_identifier(key) {
            continue;
        }
        let escaped_value = escape(value.as_str().into());
        rendered.push_str("export ");
        rendered.push_str(key);
        rendered.push('=');
        rendered.push_str(escaped_value.as_ref());
        rendered.push_str("; ");
    }
    let escaped_cwd = escape(cwd.as_str().into());
    rendered.push_str("cd ");
    rendered.push_str(escaped_cwd.as_ref());
    rendered.push_str(" && ");
    rendered.push_str(text);
    rendered
}

fn is_shell_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|first| first == '_' || first.is_ascii_alphabetic())
        && chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
}

fn parse_environment(raw: &str) -> Environment {
    raw.lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| is_shell_identifier(key) && !TRANSPORT_VARIABLES.contains(key))
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
}

fn quoted(path: &Utf8Path) -> String {
    escape(path.as_str().into()).into_owned()
}

fn run_checked<S: Session + ?Sized>(
    session: &S,
    operation: &str,
    path: &Utf8Path,
    command: &str,
    input: Option<&[u8]>,
) -> Result<ExecOutput, WorkerError> {
    let output = session.exec(command, input)?;
    if output.code == Some(0) {
        return Ok(output);
    }
    Err(WorkerError::Remote {
        operation: operation.to_owned(),
        path: path.to_owned(),
        status: output.code,
        stderr: output.stderr_text(),
    })
}

/// File operations executed over a session.
pub struct RemoteFiles<S: Session> {
    session: Arc<S>,
}

impl<S: Session> RemoteFiles<S> {
    fn run(
        &self,
        operation: &str,
        path: &Utf8Path,
        command: &str,
        input: Option<&[u8]>,
    ) -> Result<ExecOutput, WorkerError> {
        run_checked(&*self.session, operation, path, command, input)
    }

    fn test(&self, flag: &str, path: &Utf8Path) -> Result<bool, WorkerError> {
        let output = self
            .session
            .exec(&format!("test {flag} {}", quoted(path)), None)?;
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            status => Err(WorkerError::Remote {
                operation: String::from("test"),
                path: path.to_owned(),
                status,
                stderr: output.stderr_text(),
            }),
        }
    }

    fn read_bytes(&self, path: &Utf8Path) -> Result<Vec<u8>, WorkerError> {
        Ok(self
            .run("read", path, &format!("cat -- {}", quoted(path)), None)?
            .stdout)
    }
}

impl<S: Session> FileStore for RemoteFiles<S> {
    fn list(&self, path: &Utf8Path) -> Result<Vec<String>, WorkerError> {
        let output = self.run("list", path, &format!("ls -1A -- {}", quoted(path)), None)?;
        let mut names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();
        names.sort();
        Ok(names)
    }

    fn fetch(&self, worker_path: &Utf8Path, local_path: &Utf8Path) -> Result<(), WorkerError> {
        let contents = self.read_bytes(worker_path)?;
        write_local(local_path, &contents)?;
        self.run(
            "remove",
            worker_path,
            &format!("rm -f -- {}", quoted(worker_path)),
            None,
        )?;
        Ok(())
    }

    fn store(&self, local_path: &Utf8Path, worker_path: &Utf8Path) -> Result<(), WorkerError> {
        let contents = read_local(local_path)?;
        upload(&*self.session, worker_path, &contents, false)?;
        remove_local(local_path)
    }

    fn open(&self, path: &Utf8Path, mode: OpenMode) -> Result<Box<dyn WorkerFile>, WorkerError> {
        let file = match mode {
            OpenMode::Read => RemoteFile::reader(
                Arc::clone(&self.session),
                path.to_owned(),
                self.read_bytes(path)?,
            ),
            OpenMode::Write => RemoteFile::writer(Arc::clone(&self.session), path.to_owned(), false),
            OpenMode::Append => RemoteFile::writer(Arc::clone(&self.session), path.to_owned(), true),
        };
        Ok(Box::new(file))
    }

    fn remove(&self, path: &Utf8Path) -> Result<(), WorkerError> {
        self.run("remove", path, &format!("rm -- {}", quoted(path)), None)?;
        Ok(())
    }

    fn stat(&self, path: &Utf8Path, follow_symlinks: bool) -> Result<FileAttributes, WorkerError> {
        let follow = if follow_symlinks { "-L " } else { "" };
        let command = format!("stat {follow}-c {} -- {}", escape(STAT_FORMAT.into()), quoted(path));
        let output = self.run("stat", path, &command, None)?;
        let text = output.stdout_text();
        parse_stat(&text).ok_or_else(|| WorkerError::Remote {
            operation: String::from("stat"),
            path: path.to_owned(),
            status: output.code,
            stderr: format!("unexpected stat output: {text}"),
        })
    }

    fn is_directory(&self, path: &Utf8Path) -> Result<bool, WorkerError> {
        self.test("-d", path)
    }

    fn is_file(&self, path: &Utf8Path) -> Result<bool, WorkerError> {
        self.test("-f", path)
    }
}

fn upload<S: Session + ?Sized>(
    session: &S,
    path: &Utf8Path,
    contents: &[u8],
    append: bool,
) -> Result<(), WorkerError> {
    let redirect = if append { ">>" } else { ">" };
    run_checked(
        session,
        "write",
        path,
        &format!("cat {redirect} {}", quoted(path)),
        Some(contents),
    )?;
    Ok(())
}

fn parse_stat(text: &str) -> Option<FileAttributes> {
    let mut fields = text.split_whitespace();
    let mode = u32::from_str_radix(fields.next()?, 16).ok()?;
    let mut next_u64 = || fields.next()?.parse::<u64>().ok();
    let ino = next_u64()?;
    let dev = next_u64()?;
    let nlink = next_u64()?;
    let uid = u32::try_from(next_u64()?).ok()?;
    let gid = u32::try_from(next_u64()?).ok()?;
    let size = next_u64()?;
    let atime = i64::try_from(next_u64()?).ok()?;
    let mtime = i64::try_from(next_u64()?).ok()?;
    let ctime = i64::try_from(next_u64()?).ok()?;
    Some(FileAttributes {
        mode,
        ino,
        dev,
        nlink,
        uid,
        gid,
        size,
        atime,
        mtime,
        ctime,
    })
}

/// A buffered handle to a remote file.
///
/// Readers download the whole file on open. Writers upload on `flush` and,
/// best-effort, on drop; a write-mode handle truncates the file on its first
/// upload even if nothing was written.
struct RemoteFile<S: Session> {
    session: Arc<S>,
    path: Utf8PathBuf,
    contents: Cursor<Vec<u8>>,
    writable: bool,
    append: bool,
    dirty: bool,
}

impl<S: Session> RemoteFile<S> {
    const fn reader(session: Arc<S>, path: Utf8PathBuf, contents: Vec<u8>) -> Self {
        Self {
            session,
            path,
            contents: Cursor::new(contents),
            writable: false,
            append: false,
            dirty: false,
        }
    }

    const fn writer(session: Arc<S>, path: Utf8PathBuf, append: bool) -> Self {
        Self {
            session,
            path,
            contents: Cursor::new(Vec::new()),
            writable: true,
            append,
            dirty: !append,
        }
    }

    fn upload(&mut self) -> Result<(), WorkerError> {
        upload(&*self.session, &self.path, self.contents.get_ref(), self.append)?;
        self.contents = Cursor::new(Vec::new());
        self.append = true;
        self.dirty = false;
        Ok(())
    }
}

impl<S: Session> Read for RemoteFile<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.writable {
            return Err(io::Error::other(format!("{} is open for writing", self.path)));
        }
        self.contents.read(buf)
    }
}

impl<S: Session> Write for RemoteFile<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::other(format!("{} is open for reading", self.path)));
        }
        self.dirty = true;
        self.contents.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.dirty {
            self.upload().map_err(io::Error::other)?;
        }
        Ok(())
    }
}

impl<S: Session> Drop for RemoteFile<S> {
    fn drop(&mut self) {
        if self.dirty
            && let Err(err) = self.upload()
        {
            tracing::warn!(path = %self.path, error = %err, "uploading remote file on drop failed");
        }
    }
}
