//! SSH connection settings for remote workers.
//!
//! [`SshConfig`] is loaded via `ortho-config`, which merges defaults,
//! configuration files and `FOREMAN_SSH_*` environment variables.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// SSH settings used when connecting remote workers.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FOREMAN_SSH",
    discovery(
        app_name = "foreman",
        env_var = "FOREMAN_CONFIG_PATH",
        config_file_name = "foreman.toml",
        dotfile_name = ".foreman.toml",
        project_file_name = "foreman.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as. Falls back to the local user name.
    pub user: Option<String>,
    /// Remote host. When absent the CLI runs commands on a local worker.
    pub host: Option<String>,
    /// Remote SSH port.
    #[ortho_config(default = DEFAULT_SSH_PORT)]
    pub port: u16,
    /// Private key used for authentication. Supports `~/` expansion; when
    /// absent SSH falls back to its default key locations.
    pub identity_file: Option<String>,
    /// Whether to force batch mode so SSH never prompts for passwords.
    #[ortho_config(default = true)]
    pub batch_mode: bool,
    /// Whether to enforce host key checking.
    #[ortho_config(default = true)]
    pub strict_host_key_checking: bool,
    /// Known hosts file override; empty keeps the client default.
    #[ortho_config(default = String::new())]
    pub known_hosts_file: String,
    /// Seconds to wait for the initial connection.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// Seconds the multiplexing master lingers after the last channel.
    #[ortho_config(default = 60)]
    pub control_persist_secs: u64,
}

/// Errors raised when loading or validating [`SshConfig`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when a configured value is blank. The message names the
    /// environment variable and file key that provide it.
    #[error("missing {field}: set FOREMAN_SSH_{env_suffix} or add {field} to foreman.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when the port is zero.
    #[error("invalid port 0: set FOREMAN_SSH_PORT to a port between 1 and 65535")]
    InvalidPort,
    /// Raised when parsing or merging configuration layers fails.
    #[error("ssh configuration parsing failed: {0}")]
    Parse(String),
}

impl SshConfig {
    /// Ensures configured values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] when a field is blank and
    /// [`ConfigError::InvalidPort`] when the port is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_optional_value(self.user.as_deref(), "user")?;
        Self::require_optional_value(self.host.as_deref(), "host")?;
        Self::require_optional_value(self.identity_file.as_deref(), "identity_file")?;
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        Ok(())
    }

    /// Loads configuration using defaults, configuration files, and
    /// environment variables, ignoring the process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("foreman")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), ConfigError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(ConfigError::InvalidConfig {
                field: field.to_owned(),
            }),
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), ConfigError> {
        Self::require_optional_value(Some(value), field)
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn base_config() -> SshConfig {
        SshConfig {
            ssh_bin: String::from("ssh"),
            user: Some(String::from("builder")),
            host: Some(String::from("farm-1")),
            port: DEFAULT_SSH_PORT,
            identity_file: None,
            batch_mode: true,
            strict_host_key_checking: true,
            known_hosts_file: String::new(),
            connect_timeout_secs: 10,
            control_persist_secs: 60,
        }
    }

    #[rstest]
    fn accepts_complete_configuration(base_config: SshConfig) {
        assert_eq!(base_config.validate(), Ok(()));
    }

    #[rstest]
    #[case("ssh_bin")]
    #[case("user")]
    #[case("host")]
    #[case("identity_file")]
    fn rejects_blank_values(mut base_config: SshConfig, #[case] field: &str) {
        let blank = String::from("  ");
        match field {
            "ssh_bin" => base_config.ssh_bin = blank,
            "user" => base_config.user = Some(blank),
            "host" => base_config.host = Some(blank),
            _ => base_config.identity_file = Some(blank),
        }

        let err = base_config.validate().expect_err("blank value should fail");

        assert_eq!(
            err,
            ConfigError::InvalidConfig {
                field: field.to_owned()
            }
        );
    }

    #[rstest]
    fn rejects_port_zero(mut base_config: SshConfig) {
        base_config.port = 0;
        assert_eq!(base_config.validate(), Err(ConfigError::InvalidPort));
    }

    #[test]
    fn invalid_config_names_the_environment_variable() {
        let err = ConfigError::InvalidConfig {
            field: String::from("identity_file"),
        };
        assert!(err.to_string().contains("FOREMAN_SSH_IDENTITY_FILE"));
    }
}
