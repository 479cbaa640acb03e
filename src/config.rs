//! Driver configuration.
//!
//! Defaults come from [`crate::constants`]. A YAML file can override any
//! subset of fields, and a few environment variables override the file:
//!
//! ```yaml
//! docker:
//!   binary: podman
//!   start_timeout_secs: 60
//! tar:
//!   exec_mode: host
//!   temp_dir: /var/tmp
//! ```

use crate::constants::{
    CONTAINER_START_TIMEOUT, DEFAULT_KEEPALIVE, DEFAULT_RUNTIME_BINARY, ENV_CONFIG,
    ENV_DOCKER_BINARY, ENV_TAR_EXEC_MODE, ENV_TMPDIR, NAME_PREFIX, READINESS_POLL_INTERVAL,
    RUNTIME_COMMAND_TIMEOUT,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level configuration for both driver kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    /// Runtime-backed driver settings.
    pub docker: DockerConfig,
    /// Archive-backed driver settings.
    pub tar: TarConfig,
}

/// Settings for the runtime-backed driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerConfig {
    /// Docker-compatible CLI binary.
    pub binary: String,
    /// Entrypoint that keeps the container alive between execs.
    pub keepalive: Vec<String>,
    /// Prefix for generated container names.
    pub container_prefix: String,
    /// Seconds to wait for the container to report `running`.
    pub start_timeout_secs: u64,
    /// Milliseconds between readiness polls.
    pub poll_interval_ms: u64,
    /// Seconds allowed for control-plane CLI calls.
    pub command_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_RUNTIME_BINARY.to_string(),
            keepalive: DEFAULT_KEEPALIVE.iter().map(|s| s.to_string()).collect(),
            container_prefix: NAME_PREFIX.to_string(),
            start_timeout_secs: CONTAINER_START_TIMEOUT.as_secs(),
            poll_interval_ms: READINESS_POLL_INTERVAL.as_millis() as u64,
            command_timeout_secs: RUNTIME_COMMAND_TIMEOUT.as_secs(),
        }
    }
}

impl DockerConfig {
    /// Readiness deadline.
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    /// Readiness poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Control-plane call deadline.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// How the archive-backed driver scopes commands to the extracted tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// `chroot` when running as root, `host` otherwise.
    #[default]
    Auto,
    /// Run through `chroot <root>`.
    Chroot,
    /// Run on the host with absolute paths rewritten under the root.
    Host,
}

impl ExecMode {
    /// Parses from name (`auto`, `chroot`, `host`).
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "chroot" => Some(Self::Chroot),
            "host" => Some(Self::Host),
            _ => None,
        }
    }

    /// Resolves `Auto` for the current process.
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto => {
                if is_root() {
                    Self::Chroot
                } else {
                    Self::Host
                }
            }
            other => other,
        }
    }
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Chroot => write!(f, "chroot"),
            Self::Host => write!(f, "host"),
        }
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

/// Settings for the archive-backed driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TarConfig {
    /// Command scoping strategy.
    pub exec_mode: ExecMode,
    /// Parent directory for extraction roots (system temp dir if unset).
    pub temp_dir: Option<PathBuf>,
    /// Prefix for extraction directory names.
    pub temp_prefix: String,
    /// Verify sha256 digests of OCI layout blobs.
    pub verify_digests: bool,
}

impl Default for TarConfig {
    fn default() -> Self {
        Self {
            exec_mode: ExecMode::Auto,
            temp_dir: None,
            temp_prefix: NAME_PREFIX.to_string(),
            verify_digests: true,
        }
    }
}

impl DriverConfig {
    /// Parses a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_yaml::from_str(&text).map_err(|e| Error::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Builds the config from the process environment.
    ///
    /// Loads the file named by `STRUCTEST_CONFIG` if set, then applies
    /// `STRUCTEST_DOCKER_BINARY`, `STRUCTEST_TAR_EXEC_MODE` and
    /// `STRUCTEST_TMPDIR`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`DriverConfig::from_env`] with an explicit variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup(ENV_CONFIG) {
            Some(path) if !path.is_empty() => {
                debug!("loading driver config from {}", path);
                Self::from_file(Path::new(&path))?
            }
            _ => Self::default(),
        };

        if let Some(binary) = lookup(ENV_DOCKER_BINARY).filter(|b| !b.is_empty()) {
            config.docker.binary = binary;
        }
        if let Some(mode) = lookup(ENV_TAR_EXEC_MODE).filter(|m| !m.is_empty()) {
            config.tar.exec_mode = ExecMode::from_str(&mode).ok_or_else(|| {
                Error::Config(format!(
                    "{}: unknown exec mode '{}' (expected auto, chroot or host)",
                    ENV_TAR_EXEC_MODE, mode
                ))
            })?;
        }
        if let Some(dir) = lookup(ENV_TMPDIR).filter(|d| !d.is_empty()) {
            config.tar.temp_dir = Some(PathBuf::from(dir));
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects values no driver can work with.
    pub fn validate(&self) -> Result<()> {
        if self.docker.binary.trim().is_empty() {
            return Err(Error::Config("docker.binary cannot be empty".to_string()));
        }
        if self.docker.keepalive.is_empty() {
            return Err(Error::Config("docker.keepalive cannot be empty".to_string()));
        }
        if self.docker.poll_interval_ms == 0 {
            return Err(Error::Config(
                "docker.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.docker.start_timeout_secs == 0 {
            return Err(Error::Config(
                "docker.start_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.docker.binary, "docker");
        assert_eq!(config.docker.keepalive, vec!["tail", "-f", "/dev/null"]);
        assert_eq!(config.tar.exec_mode, ExecMode::Auto);
        assert!(config.tar.verify_digests);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = DriverConfig::from_lookup(lookup(&[
            (ENV_DOCKER_BINARY, "podman"),
            (ENV_TAR_EXEC_MODE, "HOST"),
            (ENV_TMPDIR, "/var/tmp"),
        ]))
        .unwrap();
        assert_eq!(config.docker.binary, "podman");
        assert_eq!(config.tar.exec_mode, ExecMode::Host);
        assert_eq!(config.tar.temp_dir, Some(PathBuf::from("/var/tmp")));
    }

    #[test]
    fn test_env_rejects_bad_exec_mode() {
        let err = DriverConfig::from_lookup(lookup(&[(ENV_TAR_EXEC_MODE, "jail")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_exec_mode_resolve_is_concrete() {
        assert_ne!(ExecMode::Auto.resolve(), ExecMode::Auto);
        assert_eq!(ExecMode::Host.resolve(), ExecMode::Host);
        assert_eq!(ExecMode::Chroot.resolve(), ExecMode::Chroot);
    }
}
