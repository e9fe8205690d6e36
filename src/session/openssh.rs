//! Session transport built on the system OpenSSH client.
//!
//! One master connection is authenticated per session and every channel is
//! multiplexed over it through a private control socket, so commands start
//! without a fresh handshake.

use std::fs;
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

use super::{Channel, ChannelEvent, ExecOutput, Session, TransportError};
use crate::command::local::exit_code;
use crate::config::SshConfig;
use crate::pump::StreamPump;
use crate::worker::local::local_user_name;
use crate::worker::path::expand_local_tilde;

const IDLE_TICK: Duration = Duration::from_millis(10);

/// An authenticated OpenSSH master connection.
#[derive(Debug)]
pub struct OpenSshSession {
    ssh_bin: String,
    user: String,
    host: String,
    options: Vec<String>,
    control_dir: Utf8PathBuf,
    closed: AtomicBool,
}

impl OpenSshSession {
    /// Authenticates to `host` and keeps the master connection open.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] carrying ssh's diagnostics when
    /// the connection or authentication fails.
    pub fn connect(config: &SshConfig, host: &str) -> Result<Self, TransportError> {
        let connect_error = |message: String| TransportError::Connect {
            host: host.to_owned(),
            message,
        };
        let control_dir = create_control_dir().map_err(|err| connect_error(err.to_string()))?;
        let session = Self {
            ssh_bin: config.ssh_bin.clone(),
            user: config.user.clone().unwrap_or_else(local_user_name),
            host: host.to_owned(),
            options: build_options(config, &control_dir),
            control_dir,
            closed: AtomicBool::new(false),
        };

        let output = session
            .exec("true", None)
            .map_err(|err| connect_error(err.to_string()))?;
        if output.code != Some(0) {
            return Err(connect_error(output.stderr_text()));
        }
        tracing::debug!(host, user = %session.user, "ssh master connection established");
        Ok(session)
    }

    /// User the session authenticated as.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Host the session is connected to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    fn ssh(&self) -> Command {
        let mut command = Command::new(&self.ssh_bin);
        command
            .args(&self.options)
            .arg("-T")
            .arg(format!("{}@{}", self.user, self.host));
        command
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl Session for OpenSshSession {
    type Channel = OpenSshChannel;

    fn open_channel(&self, command: &str) -> Result<Self::Channel, TransportError> {
        self.ensure_open()?;
        let mut child = self
            .ssh()
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| io_error(&err))?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            reap(&mut child);
            return Err(TransportError::Io {
                message: String::from("ssh output pipes were not captured"),
            });
        };
        let pump = match StreamPump::start(stdout, stderr) {
            Ok(started) => started,
            Err(err) => {
                reap(&mut child);
                return Err(io_error(&err));
            }
        };
        Ok(OpenSshChannel {
            child,
            pump,
            status: None,
            reaped: false,
        })
    }

    fn exec(&self, command: &str, input: Option<&[u8]>) -> Result<ExecOutput, TransportError> {
        self.ensure_open()?;
        let mut child = self
            .ssh()
            .arg(command)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| io_error(&err))?;
        let stdin = child.stdin.take();
        let output = thread::scope(|scope| {
            if let (Some(bytes), Some(mut pipe)) = (input, stdin) {
                scope.spawn(move || {
                    if let Err(err) = pipe.write_all(bytes) {
                        tracing::debug!(error = %err, "writing exec input failed");
                    }
                });
            }
            child.wait_with_output()
        })
        .map_err(|err| io_error(&err))?;
        Ok(ExecOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let exit = Command::new(&self.ssh_bin)
            .args(&self.options)
            .args(["-O", "exit"])
            .arg(format!("{}@{}", self.user, self.host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(err) = exit {
            tracing::debug!(host = %self.host, error = %err, "stopping ssh master failed");
        }
        fs::remove_dir_all(&self.control_dir).map_err(|err| io_error(&err))?;
        tracing::debug!(host = %self.host, "ssh session closed");
        Ok(())
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::debug!(host = %self.host, error = %err, "closing ssh session on drop failed");
        }
    }
}

/// A command multiplexed over an [`OpenSshSession`].
#[derive(Debug)]
pub struct OpenSshChannel {
    child: Child,
    pump: StreamPump,
    status: Option<i32>,
    reaped: bool,
}

impl Channel for OpenSshChannel {
    fn read(&mut self, timeout: Option<Duration>) -> Result<Option<ChannelEvent>, TransportError> {
        if self.pump.is_drained() {
            thread::sleep(timeout.map_or(IDLE_TICK, |limit| limit.min(IDLE_TICK)));
            return Ok(None);
        }
        Ok(self.pump.next(timeout))
    }

    fn exit_status(&mut self) -> Result<Option<i32>, TransportError> {
        if self.status.is_none()
            && let Some(status) = self.child.try_wait().map_err(|err| io_error(&err))?
        {
            self.status = Some(exit_code(status));
            self.reaped = true;
        }
        Ok(if self.pump.is_drained() {
            self.status
        } else {
            None
        })
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.reaped {
            return Ok(());
        }
        self.reaped = true;
        self.child.kill().map_err(|err| io_error(&err))?;
        self.child.wait().map_err(|err| io_error(&err))?;
        Ok(())
    }
}

impl Drop for OpenSshChannel {
    fn drop(&mut self) {
        if !self.reaped {
            reap(&mut self.child);
        }
    }
}

fn build_options(config: &SshConfig, control_dir: &Utf8Path) -> Vec<String> {
    let mut options = vec![
        String::from("-o"),
        String::from("ControlMaster=auto"),
        String::from("-o"),
        format!("ControlPath={control_dir}/%C"),
        String::from("-o"),
        format!("ControlPersist={}", config.control_persist_secs),
        String::from("-o"),
        format!("ConnectTimeout={}", config.connect_timeout_secs),
        String::from("-p"),
        config.port.to_string(),
    ];
    if config.batch_mode {
        options.push(String::from("-o"));
        options.push(String::from("BatchMode=yes"));
    }
    let strict = if config.strict_host_key_checking {
        "yes"
    } else {
        "no"
    };
    options.push(String::from("-o"));
    options.push(format!("StrictHostKeyChecking={strict}"));
    if !config.known_hosts_file.trim().is_empty() {
        options.push(String::from("-o"));
        options.push(format!("UserKnownHostsFile={}", config.known_hosts_file));
    }
    if let Some(identity) = config.identity_file.as_deref() {
        options.push(String::from("-i"));
        options.push(expand_local_tilde(identity));
    }
    options
}

#[cfg(unix)]
fn create_control_dir() -> std::io::Result<Utf8PathBuf> {
    use std::os::unix::fs::DirBuilderExt;

    let path = control_dir_path()?;
    fs::DirBuilder::new().mode(0o700).create(&path)?;
    Ok(path)
}

#[cfg(not(unix))]
fn create_control_dir() -> std::io::Result<Utf8PathBuf> {
    let path = control_dir_path()?;
    fs::create_dir(&path)?;
    Ok(path)
}

fn control_dir_path() -> std::io::Result<Utf8PathBuf> {
    let base = Utf8PathBuf::from_path_buf(std::env::temp_dir()).map_err(|raw| {
        std::io::Error::other(format!("temp dir {} is not UTF-8", raw.display()))
    })?;
    Ok(base.join(format!("foreman-{}", Uuid::new_v4().simple())))
}

fn reap(child: &mut Child) {
    child.kill().ok();
    child.wait().ok();
}

fn io_error(err: &std::io::Error) -> TransportError {
    TransportError::Io {
        message: err.to_string(),
    }
}
