//! Worker running commands on the controlling machine.

use std::env;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir, fs_utf8::OpenOptions};

use super::{Environment, FileAttributes, FileStore, OpenMode, Worker, WorkerCore, WorkerFile};
use crate::command::CommandBackend;
use crate::command::local::LocalBackend;
use crate::error::WorkerError;

/// Host name reported by local workers.
pub const LOCALHOST: &str = "localhost";

const UNKNOWN_USER: &str = "<unknown>";

/// Returns the local user name from `USER` or `USERNAME`.
#[must_use]
pub fn local_user_name() -> String {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| UNKNOWN_USER.to_owned())
}

/// A worker backed by processes on this machine.
///
/// Starts with a copy of the controlling process's environment and working
/// directory; later changes affect this worker only.
#[derive(Debug)]
pub struct LocalWorker {
    core: WorkerCore,
    files: Arc<LocalFiles>,
}

impl LocalWorker {
    /// Creates a worker for the current user on this machine.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Io`] when the process working directory is
    /// unavailable or not UTF-8.
    pub fn new() -> Result<Self, WorkerError> {
        let process_cwd = env::current_dir().map_err(|err| WorkerError::io(".", &err))?;
        let cwd = Utf8PathBuf::from_path_buf(process_cwd).map_err(|raw| WorkerError::Io {
            path: Utf8PathBuf::from(raw.to_string_lossy().into_owned()),
            message: String::from("working directory is not valid UTF-8"),
        })?;
        let environment: Environment = env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
            .collect();
        let home = env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .ok()
            .map(Utf8PathBuf::from);
        let core = WorkerCore::new(local_user_name(), LOCALHOST, environment, cwd).with_home(home);
        Ok(Self {
            core,
            files: Arc::new(LocalFiles),
        })
    }

    /// Overrides how long capability probes may run.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.core = self.core.with_probe_timeout(timeout);
        self
    }
}

impl Worker for LocalWorker {
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
        Ok(Box::new(LocalBackend::spawn(text, environment, cwd)?))
    }

    fn resolve_controller_path(&self, path: &str) -> Result<Utf8PathBuf, WorkerError> {
        Ok(self.core.resolve_path(path))
    }
}

/// Direct filesystem access for local workers.
#[derive(Debug, Default)]
pub struct LocalFiles;

impl FileStore for LocalFiles {
    fn list(&self, path: &Utf8Path) -> Result<Vec<String>, WorkerError> {
        let dir = open_dir(path)?;
        let mut names = Vec::new();
        for entry in dir.entries().map_err(|err| WorkerError::io(path, &err))? {
            let name = entry
                .and_then(|item| item.file_name())
                .map_err(|err| WorkerError::io(path, &err))?;
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn fetch(&self, worker_path: &Utf8Path, local_path: &Utf8Path) -> Result<(), WorkerError> {
        move_file(worker_path, local_path)
    }

    fn store(&self, local_path: &Utf8Path, worker_path: &Utf8Path) -> Result<(), WorkerError> {
        move_file(local_path, worker_path)
    }

    fn open(&self, path: &Utf8Path, mode: OpenMode) -> Result<Box<dyn WorkerFile>, WorkerError> {
        let (dir, name) = split(path)?;
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::Append => options.append(true).create(true),
        };
        let file = dir
            .open_with(name, &options)
            .map_err(|err| WorkerError::io(path, &err))?;
        Ok(Box::new(file))
    }

    fn remove(&self, path: &Utf8Path) -> Result<(), WorkerError> {
        let (dir, name) = split(path)?;
        dir.remove_file(name)
            .map_err(|err| WorkerError::io(path, &err))
    }

    fn stat(&self, path: &Utf8Path, follow_symlinks: bool) -> Result<FileAttributes, WorkerError> {
        let metadata = if follow_symlinks {
            fs::metadata(path)
        } else {
            fs::symlink_metadata(path)
        }
        .map_err(|err| WorkerError::io(path, &err))?;
        Ok(attributes(&metadata))
    }

    fn is_directory(&self, path: &Utf8Path) -> Result<bool, WorkerError> {
        Ok(path.is_dir())
    }

    fn is_file(&self, path: &Utf8Path) -> Result<bool, WorkerError> {
        Ok(path.is_file())
    }
}

fn open_dir(path: &Utf8Path) -> Result<Dir, WorkerError> {
    Dir::open_ambient_dir(path, ambient_authority()).map_err(|err| WorkerError::io(path, &err))
}

fn split(path: &Utf8Path) -> Result<(Dir, &str), WorkerError> {
    let name = path.file_name().ok_or_else(|| WorkerError::Io {
        path: path.to_owned(),
        message: String::from("path does not name a file"),
    })?;
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("/"));
    Ok((open_dir(parent)?, name))
}

/// Moves a file, copying then removing when a rename is not possible, for
/// example across filesystems.
pub(crate) fn move_file(from: &Utf8Path, to: &Utf8Path) -> Result<(), WorkerError> {
    let (from_dir, from_name) = split(from)?;
    let (to_dir, to_name) = split(to)?;
    if let Err(err) = from_dir.rename(from_name, &to_dir, to_name) {
        tracing::debug!(%from, %to, error = %err, "rename failed; copying instead");
        from_dir
            .copy(from_name, &to_dir, to_name)
            .map_err(|copy_err| WorkerError::io(from, &copy_err))?;
        from_dir
            .remove_file(from_name)
            .map_err(|remove_err| WorkerError::io(from, &remove_err))?;
    }
    Ok(())
}

/// Reads a file on the controlling machine.
pub(crate) fn read_local(path: &Utf8Path) -> Result<Vec<u8>, WorkerError> {
    let (dir, name) = split(path)?;
    dir.read(name).map_err(|err| WorkerError::io(path, &err))
}

/// Writes a file on the controlling machine, replacing any existing one.
pub(crate) fn write_local(path: &Utf8Path, contents: &[u8]) -> Result<(), WorkerError> {
    let (dir, name) = split(path)?;
    dir.write(name, contents)
        .map_err(|err| WorkerError::io(path, &err))
}

/// Removes a file on the controlling machine.
pub(crate) fn remove_local(path: &Utf8Path) -> Result<(), WorkerError> {
    LocalFiles.remove(path)
}

#[cfg(unix)]
fn attributes(metadata: &fs::Metadata) -> FileAttributes {
    use std::os::unix::fs::MetadataExt;

    FileAttributes {
        mode: metadata.mode(),
        ino: metadata.ino(),
        dev: metadata.dev(),
        nlink: metadata.nlink(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        size: metadata.size(),
        atime: metadata.atime(),
        mtime: metadata.mtime(),
        ctime: metadata.ctime(),
    }
}

#[cfg(not(unix))]
fn attributes(metadata: &fs::Metadata) -> FileAttributes {
    use std::time::{SystemTime, UNIX_EPOCH};

    let seconds = |time: std::io::Result<SystemTime>| {
        time.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| i64::try_from(d.as_secs()).ok())
            .unwrap_or_default()
    };
    let kind = if metadata.is_dir() {
        0o040_000
    } else if metadata.file_type().is_symlink() {
        0o120_000
    } else {
        0o100_000
    };
    FileAttributes {
        mode: kind | if metadata.permissions().readonly() { 0o444 } else { 0o644 },
        nlink: 1,
        size: metadata.len(),
        atime: seconds(metadata.accessed()),
        mtime: seconds(metadata.modified()),
        ctime: seconds(metadata.created()),
        ..FileAttributes::default()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::{Read, Write};

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;

    #[fixture]
    fn sandbox() -> (TempDir, Utf8PathBuf) {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-UTF-8 tempdir: {}", path.display()));
        (tmp, root)
    }

    #[rstest]
    fn writes_appends_and_reads(sandbox: (TempDir, Utf8PathBuf)) {
        let (_tmp, root) = sandbox;
        let path = root.join("notes.txt");

        LocalFiles
            .open(&path, OpenMode::Write)
            .and_then(|mut file| file.write_all(b"hello").map_err(|err| WorkerError::io(&path, &err)))
            .expect("write");
        LocalFiles
            .open(&path, OpenMode::Append)
            .and_then(|mut file| file.write_all(b" world").map_err(|err| WorkerError::io(&path, &err)))
            .expect("append");

        let mut contents = String::new();
        LocalFiles
            .open(&path, OpenMode::Read)
            .expect("open")
            .read_to_string(&mut contents)
            .expect("read");
        assert_eq!(contents, "hello world");
    }

    #[rstest]
    fn lists_sorted_entries(sandbox: (TempDir, Utf8PathBuf)) {
        let (_tmp, root) = sandbox;
        for name in ["b", "a", ".hidden"] {
            write_local(&root.join(name), b"").expect("seed");
        }
        assert_eq!(
            LocalFiles.list(&root).expect("list"),
            vec![String::from(".hidden"), String::from("a"), String::from("b")]
        );
    }

    #[rstest]
    fn move_removes_the_source(sandbox: (TempDir, Utf8PathBuf)) {
        let (_tmp, root) = sandbox;
        let from = root.join("from.txt");
        let to = root.join("to.txt");
        write_local(&from, b"payload").expect("seed");

        move_file(&from, &to).expect("move");

        assert!(!from.exists());
        assert_eq!(read_local(&to).expect("read"), b"payload");
    }

    #[rstest]
    fn stat_follows_symlinks_on_request(sandbox: (TempDir, Utf8PathBuf)) {
        let (_tmp, root) = sandbox;
        let target = root.join("target.txt");
        let link = root.join("link");
        write_local(&target, b"Hello world!\n").expect("seed");
        std::os::unix::fs::symlink(&target, &link).expect("symlink");

        let followed = LocalFiles.stat(&link, true).expect("stat");
        let raw = LocalFiles.stat(&link, false).expect("lstat");

        assert_eq!(followed.size, 13);
        assert!(followed.is_file());
        assert!(raw.is_symlink());
    }

    #[test]
    fn user_name_is_never_empty() {
        assert!(!local_user_name().is_empty());
    }
}
