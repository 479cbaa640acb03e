//! Container runtime client used by the runtime-backed driver.
//!
//! [`ContainerClient`] is the narrow surface [`DockerDriver`] needs from a
//! container runtime: start a detached container, report its state, exec
//! into it, stream a path out of it as a tar archive, and remove it.
//!
//! [`DockerCli`] implements it by shelling out to a Docker-compatible CLI
//! (`docker`, `podman`, `nerdctl`). Control-plane calls are bounded by a
//! timeout; `exec` is not, since command duration belongs to the test.
//!
//! [`DockerDriver`]: crate::drivers::docker::DockerDriver

use crate::command::{EnvVar, ExecResult, exit_code_of};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::Read;
use std::process::{Child, ChildStdout, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

// =============================================================================
// Client Types
// =============================================================================

/// Parameters for a detached container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Container name.
    pub name: String,
    /// Container-level environment.
    pub env: Vec<EnvVar>,
    /// Entrypoint plus arguments that keep the container running.
    pub entrypoint: Vec<String>,
}

/// Coarse container status as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Created or restarting; not ready yet.
    Starting,
    /// Running and accepting execs.
    Running,
    /// Exited with the given code.
    Exited(i32),
    /// Paused, dead, or anything unrecognized.
    Other(String),
}

impl InstanceStatus {
    /// Parses `<Status> <ExitCode>` as printed by `inspect --format`.
    pub fn parse(s: &str) -> Self {
        let mut parts = s.split_whitespace();
        let status = parts.next().unwrap_or_default().to_lowercase();
        let exit_code = parts.next().and_then(|c| c.parse().ok()).unwrap_or(0);
        match status.as_str() {
            "running" => Self::Running,
            "created" | "restarting" | "configured" | "initialized" => Self::Starting,
            "exited" | "stopped" => Self::Exited(exit_code),
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Exited(code) => write!(f, "exited ({})", code),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

/// A tar stream of a container path.
///
/// Reading yields the archive bytes. `finish` waits for the producer and
/// reports how the copy ended; dropping the stream early aborts it.
pub trait ArchiveStream: Read + Send {
    /// Completes the copy, surfacing producer errors such as a missing path.
    fn finish(self: Box<Self>) -> Result<()>;
}

// =============================================================================
// Client Trait
// =============================================================================

/// The container runtime operations the runtime-backed driver relies on.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Returns the runtime name used in errors and logs.
    fn name(&self) -> &str;

    /// Starts a detached container and returns its ID.
    async fn run_detached(&self, spec: &ContainerSpec) -> Result<String>;

    /// Reports the container's status.
    async fn inspect(&self, id: &str) -> Result<InstanceStatus>;

    /// Runs a command inside the container with a per-call environment.
    async fn exec(&self, id: &str, env: &[EnvVar], command: &[String]) -> Result<ExecResult>;

    /// Streams `path` out of the container as a tar archive.
    ///
    /// With `follow_links`, a symlink at `path` is resolved first.
    fn copy_from(&self, id: &str, path: &str, follow_links: bool)
    -> Result<Box<dyn ArchiveStream>>;

    /// Force-removes the container.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Force-removes the container without an async runtime (drop path).
    fn remove_blocking(&self, id: &str) -> Result<()>;
}

// =============================================================================
// Docker CLI Client
// =============================================================================

/// [`ContainerClient`] backed by a Docker-compatible CLI binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    command_timeout: Duration,
}

impl DockerCli {
    /// Creates a client for `binary` with a control-plane timeout.
    pub fn new(binary: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            command_timeout,
        }
    }

    /// Returns the CLI binary.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Checks whether the CLI can reach its daemon.
    pub fn is_available(&self) -> bool {
        std::process::Command::new(&self.binary)
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Builds the argument vector for `run -d`.
    pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];
        for var in &spec.env {
            args.push("-e".to_string());
            args.push(var.to_assignment());
        }
        let mut entrypoint = spec.entrypoint.iter();
        if let Some(program) = entrypoint.next() {
            args.push("--entrypoint".to_string());
            args.push(program.clone());
        }
        args.push(spec.image.clone());
        args.extend(entrypoint.cloned());
        args
    }

    /// Builds the argument vector for `exec`: the exec prefix, then the
    /// caller's fragments unchanged.
    pub fn exec_args(id: &str, env: &[EnvVar], command: &[String]) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        for var in env {
            args.push("-e".to_string());
            args.push(var.to_assignment());
        }
        args.push(id.to_string());
        args.extend_from_slice(command);
        args
    }

    /// Builds the argument vector for `cp <id>:<path> -`.
    pub fn copy_args(id: &str, path: &str, follow_links: bool) -> Vec<String> {
        let mut args = vec!["cp".to_string()];
        if follow_links {
            args.push("-L".to_string());
        }
        args.push(format!("{}:{}", id, path));
        args.push("-".to_string());
        args
    }

    fn unavailable(&self, e: std::io::Error) -> Error {
        Error::RuntimeUnavailable {
            runtime: self.binary.clone(),
            reason: e.to_string(),
        }
    }

    /// Runs a control-plane command under the configured timeout.
    async fn control(&self, operation: &str, args: &[String]) -> Result<std::process::Output> {
        debug!("{} {}", self.binary, args.join(" "));

        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("{} {}", self.binary, operation),
                duration: self.command_timeout,
            })?
            .map_err(|e| self.unavailable(e))
    }

    /// Decides whether a failed exec reached the container.
    ///
    /// The exec ran unless the container is gone, stopped or unreachable.
    async fn confirm_dispatched(&self, id: &str, stderr: &str) -> Result<()> {
        let reason = match self.inspect(id).await {
            Ok(InstanceStatus::Running) => return Ok(()),
            Ok(status) => format!("{} (container {})", stderr, status),
            Err(e) => {
                debug!("inspect after failed exec in {}: {}", id, e);
                stderr.to_string()
            }
        };
        Err(Error::ExecFailed {
            container: id.to_string(),
            reason,
        })
    }
}

/// Prefixes the CLI itself (not the exec'd command) puts on its errors.
const CLI_ERROR_PREFIXES: &[&str] = &[
    "Error response from daemon",
    "Cannot connect to the Docker daemon",
    "error during connect",
    "Error: No such container",
    "Error: no container with name or ID",
    "Error: can only create exec sessions on running containers",
];

/// Whether stderr starts the way a CLI or daemon failure does.
///
/// Only a hint: a command may print the same text, so callers confirm
/// against the container's state.
fn looks_like_cli_error(stderr: &str) -> bool {
    let first = stderr.trim_start().lines().next().unwrap_or_default();
    CLI_ERROR_PREFIXES.iter().any(|p| first.starts_with(p))
}

/// Copy failures that mean the path does not exist in the container.
fn is_missing_path(stderr: &str) -> bool {
    stderr.contains("No such container:path")
        || stderr.contains("Could not find the file")
        || stderr.contains("no such file or directory")
        || stderr.contains("not a directory")
}

#[async_trait]
impl ContainerClient for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn run_detached(&self, spec: &ContainerSpec) -> Result<String> {
        let output = self.control("run", &Self::run_args(spec)).await?;
        if !output.status.success() {
            return Err(Error::StartFailed {
                id: spec.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(Error::StartFailed {
                id: spec.name.clone(),
                reason: "runtime returned no container ID".to_string(),
            });
        }
        Ok(id)
    }

    async fn inspect(&self, id: &str) -> Result<InstanceStatus> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}} {{.State.ExitCode}}".to_string(),
            id.to_string(),
        ];
        let output = self.control("inspect", &args).await?;
        if !output.status.success() {
            return Err(Error::ExecFailed {
                container: id.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(InstanceStatus::parse(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn exec(&self, id: &str, env: &[EnvVar], command: &[String]) -> Result<ExecResult> {
        let args = Self::exec_args(id, env, command);
        debug!("{} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| self.unavailable(e))?;

        let exit_code = exit_code_of(output.status);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if exit_code != 0 && looks_like_cli_error(&stderr) {
            self.confirm_dispatched(id, stderr.trim()).await?;
        }

        Ok(ExecResult::from_output(
            &output.stdout,
            &output.stderr,
            exit_code,
        ))
    }

    fn copy_from(
        &self,
        id: &str,
        path: &str,
        follow_links: bool,
    ) -> Result<Box<dyn ArchiveStream>> {
        let args = Self::copy_args(id, path, follow_links);
        debug!("{} {}", self.binary, args.join(" "));

        let mut child = std::process::Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.unavailable(e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("copy stdout was not captured".to_string()))?;

        Ok(Box::new(CliCopy {
            child: Some(child),
            stdout,
            container: id.to_string(),
            path: path.to_string(),
        }))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let args = vec!["rm".to_string(), "-f".to_string(), id.to_string()];
        let output = self.control("rm", &args).await?;
        if !output.status.success() {
            return Err(Error::CleanupFailed {
                resource: format!("container {}", id),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn remove_blocking(&self, id: &str) -> Result<()> {
        let output = std::process::Command::new(&self.binary)
            .args(["rm", "-f", id])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| self.unavailable(e))?;
        if !output.status.success() {
            return Err(Error::CleanupFailed {
                resource: format!("container {}", id),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// A running `cp <id>:<path> -`.
struct CliCopy {
    child: Option<Child>,
    stdout: ChildStdout,
    container: String,
    path: String,
}

impl Read for CliCopy {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl ArchiveStream for CliCopy {
    fn finish(mut self: Box<Self>) -> Result<()> {
        let Some(child) = self.child.take() else {
            return Ok(());
        };
        // Drain so the producer is never blocked on a full pipe.
        std::io::copy(&mut self.stdout, &mut std::io::sink())?;
        let output = child.wait_with_output()?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_missing_path(&stderr) {
            return Err(Error::NotFound {
                path: self.path.clone(),
            });
        }
        Err(Error::ExecFailed {
            container: self.container.clone(),
            reason: stderr,
        })
    }
}

impl Drop for CliCopy {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("copy process already gone: {}", e);
            }
            if let Err(e) = child.wait() {
                warn!("failed to reap copy process: {}", e);
            }
        }
    }
}
