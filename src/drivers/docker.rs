//! # Docker Driver - Live Container Materialization
//!
//! Implements [`Driver`] by running the image as a detached container and
//! talking to it through a [`ContainerClient`] (the `docker` CLI by default).
//!
//! ## Lifecycle
//!
//! ```text
//! new(image)          no container yet
//!   │
//! setup(env, cmds)    run -d --entrypoint <keepalive> → poll inspect until running
//!   │                 → exec each setup command (non-zero aborts setup)
//!   ▼
//! process_command     exec -e K=V <id> <cmd...>
//! stat/read/readdir   cp [-L] <id>:<path> - | tar headers
//!   │
//! destroy()           rm -f <id>
//! ```
//!
//! ## Filesystem Inspection
//!
//! The copy primitive returns a tar stream whose first entry is `path`
//! itself. `stat_file` reads just that header and aborts the copy;
//! `read_dir` walks the headers and keeps entries exactly one component
//! below the first one. File content is only buffered for `read_file`.
//!
//! ## Resource Cleanup
//!
//! If the driver is dropped while a container is still recorded, `Drop`
//! force-removes it with a blocking CLI call.

use crate::client::{ArchiveStream, ContainerClient, ContainerSpec, DockerCli, InstanceStatus};
use crate::command::{Command, EnvVar, ExecResult};
use crate::config::{DockerConfig, DriverConfig};
use crate::constants::validate_image_ref;
use crate::driver::{Driver, DriverState, Lifecycle};
use crate::error::{Error, Result};
use crate::metadata::{FileInfo, base_name};
use async_trait::async_trait;
use std::io::Read;
use std::sync::Arc;
use tar::{Archive, EntryType};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Driver kind name.
pub const DOCKER_DRIVER_NAME: &str = "docker";

type CopyArchive<'a> = Archive<&'a mut Box<dyn ArchiveStream>>;

/// Runtime-backed driver: one live container per driver.
pub struct DockerDriver {
    image: String,
    client: Arc<dyn ContainerClient>,
    config: DockerConfig,
    lifecycle: Lifecycle,
    container: Option<String>,
}

impl DockerDriver {
    /// Creates a driver configured from the environment.
    pub fn new(image: &str) -> Result<Self> {
        Self::with_config(image, &DriverConfig::from_env()?)
    }

    /// Creates a driver using the CLI named in `config`.
    pub fn with_config(image: &str, config: &DriverConfig) -> Result<Self> {
        let client = DockerCli::new(&config.docker.binary, config.docker.command_timeout());
        Self::with_client(image, Arc::new(client), config.docker.clone())
    }

    /// Creates a driver over an arbitrary container client.
    pub fn with_client(
        image: &str,
        client: Arc<dyn ContainerClient>,
        config: DockerConfig,
    ) -> Result<Self> {
        validate_image_ref(image).map_err(|reason| Error::InvalidImageReference {
            reference: image.to_string(),
            reason: reason.to_string(),
        })?;
        if config.keepalive.is_empty() {
            return Err(Error::Config("docker.keepalive cannot be empty".to_string()));
        }

        Ok(Self {
            image: image.to_string(),
            client,
            config,
            lifecycle: Lifecycle::new(DOCKER_DRIVER_NAME),
            container: None,
        })
    }

    /// Returns the container ID once `setup` has started one.
    pub fn container_id(&self) -> Option<&str> {
        self.container.as_deref()
    }

    /// Returns the execution prefix placed before every command.
    pub fn exec_prefix(&self) -> Vec<String> {
        let mut prefix = vec![self.client.name().to_string(), "exec".to_string()];
        if let Some(id) = &self.container {
            prefix.push(id.clone());
        }
        prefix
    }

    fn ready_container(&self, operation: &str) -> Result<&str> {
        self.lifecycle.ensure_ready(operation)?;
        self.container
            .as_deref()
            .ok_or_else(|| Error::Internal("ready driver has no container".to_string()))
    }

    /// Polls until the container runs, exits, or the start timeout elapses.
    async fn wait_until_running(&self, id: &str) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.config.start_timeout();

        loop {
            match self.client.inspect(id).await? {
                InstanceStatus::Running => {
                    debug!("container {} running after {:?}", id, started.elapsed());
                    return Ok(());
                }
                InstanceStatus::Exited(code) => {
                    return Err(Error::StartFailed {
                        id: id.to_string(),
                        reason: format!("container exited with code {} before it was ready", code),
                    });
                }
                InstanceStatus::Other(status) if status == "dead" => {
                    return Err(Error::StartFailed {
                        id: id.to_string(),
                        reason: "container is dead".to_string(),
                    });
                }
                status => debug!("container {} is {}", id, status),
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: format!("waiting for container {} to run", id),
                    duration: self.config.start_timeout(),
                });
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    /// Streams `path` out of the container and hands the tar to `visit`.
    ///
    /// With `complete`, the copy is waited on after `visit` succeeds so a
    /// truncated stream is reported; otherwise it is aborted.
    async fn read_archive<T: Send + 'static>(
        &self,
        operation: &str,
        path: &str,
        follow_links: bool,
        complete: bool,
        visit: fn(&mut CopyArchive<'_>, &str) -> std::io::Result<Option<T>>,
    ) -> Result<T> {
        let id = self.ready_container(operation)?.to_string();
        let client = Arc::clone(&self.client);
        let path = absolute(path);

        tokio::task::spawn_blocking(move || {
            let stream = client.copy_from(&id, &path, follow_links)?;
            scan_archive(stream, &path, complete, visit)
        })
        .await
        .map_err(|e| Error::Internal(format!("copy task failed: {}", e)))?
    }
}

/// Runtime copy paths are always absolute.
fn absolute(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Runs `visit` over a copy stream and reconciles its result with how the
/// copy ended. A producer error (missing path, vanished container) wins
/// over whatever the tar reader made of the truncated stream.
fn scan_archive<T>(
    mut stream: Box<dyn ArchiveStream>,
    path: &str,
    complete: bool,
    visit: fn(&mut CopyArchive<'_>, &str) -> std::io::Result<Option<T>>,
) -> Result<T> {
    let visited = {
        let mut archive = Archive::new(&mut stream);
        visit(&mut archive, path)
    };

    match visited {
        Ok(Some(value)) => {
            if complete {
                stream.finish()?;
            }
            Ok(value)
        }
        Ok(None) => {
            stream.finish()?;
            Err(Error::NotFound {
                path: path.to_string(),
            })
        }
        Err(e) => {
            stream.finish()?;
            Err(Error::from_io(e, path))
        }
    }
}

/// Archive member name without `./`, leading `/` or trailing `/`.
fn member_name(entry_path: &std::path::Path) -> String {
    let name = entry_path.to_string_lossy();
    let mut name: &str = &name;
    while let Some(rest) = name.strip_prefix("./").or_else(|| name.strip_prefix('/')) {
        name = rest;
    }
    let name = name.trim_end_matches('/');
    if name == "." { String::new() } else { name.to_string() }
}

fn visit_stat(archive: &mut CopyArchive<'_>, path: &str) -> std::io::Result<Option<FileInfo>> {
    let Some(entry) = archive.entries()?.next() else {
        return Ok(None);
    };
    let entry = entry?;
    Ok(Some(FileInfo::from_tar_header(base_name(path), entry.header())?))
}

fn visit_read_file(archive: &mut CopyArchive<'_>, _path: &str) -> std::io::Result<Option<Vec<u8>>> {
    let Some(entry) = archive.entries()?.next() else {
        return Ok(None);
    };
    let mut entry = entry?;
    if entry.header().entry_type() == EntryType::Directory {
        return Err(std::io::ErrorKind::IsADirectory.into());
    }
    let mut data = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut data)?;
    Ok(Some(data))
}

fn visit_read_dir(
    archive: &mut CopyArchive<'_>,
    _path: &str,
) -> std::io::Result<Option<Vec<FileInfo>>> {
    let mut entries = archive.entries()?;
    let Some(first) = entries.next() else {
        return Ok(None);
    };
    let first = first?;
    if first.header().entry_type() != EntryType::Directory {
        return Err(std::io::ErrorKind::NotADirectory.into());
    }
    let top = member_name(&first.path()?);

    let mut children = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = member_name(&entry.path()?);
        let rel = if top.is_empty() {
            name.as_str()
        } else {
            match name.strip_prefix(top.as_str()).and_then(|r| r.strip_prefix('/')) {
                Some(rel) => rel,
                None => continue,
            }
        };
        if rel.is_empty() || rel.contains('/') {
            continue;
        }
        children.push(FileInfo::from_tar_header(rel, entry.header())?);
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Some(children))
}

#[async_trait]
impl Driver for DockerDriver {
    fn name(&self) -> &str {
        DOCKER_DRIVER_NAME
    }

    fn image(&self) -> &str {
        &self.image
    }

    fn state(&self) -> DriverState {
        self.lifecycle.state()
    }

    async fn setup(&mut self, env: &[EnvVar], commands: &[Command]) -> Result<()> {
        self.lifecycle.begin_setup()?;

        let spec = ContainerSpec {
            image: self.image.clone(),
            name: format!("{}{}", self.config.container_prefix, uuid::Uuid::now_v7()),
            env: env.to_vec(),
            entrypoint: self.config.keepalive.clone(),
        };
        let id = self.client.run_detached(&spec).await?;
        // Recorded before readiness so a failed start is still cleaned up.
        self.container = Some(id.clone());
        info!("started container {} ({}) from {}", spec.name, id, self.image);

        self.wait_until_running(&id).await?;

        for command in commands {
            if command.is_empty() {
                return Err(Error::InvalidCommand("empty setup command".to_string()));
            }
            let result = self.client.exec(&id, env, command.parts()).await?;
            if !result.is_success() {
                return Err(Error::SetupCommandFailed {
                    command: command.parts().to_vec(),
                    exit_code: result.exit_code,
                    stderr: result.stderr.trim().to_string(),
                });
            }
        }

        self.lifecycle.mark_ready();
        Ok(())
    }

    async fn process_command(&self, env: &[EnvVar], command: &Command) -> Result<ExecResult> {
        let id = self.ready_container("process_command")?;
        if command.is_empty() {
            return Err(Error::InvalidCommand("empty command".to_string()));
        }
        debug!("exec in {}: {}", id, command);
        self.client.exec(id, env, command.parts()).await
    }

    async fn stat_file(&self, path: &str) -> Result<FileInfo> {
        self.read_archive("stat_file", path, false, false, visit_stat)
            .await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.read_archive("read_file", path, true, true, visit_read_file)
            .await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        self.read_archive("read_dir", path, true, true, visit_read_dir)
            .await
    }

    async fn destroy(&mut self) -> Result<()> {
        self.lifecycle.begin_destroy()?;
        let Some(id) = self.container.take() else {
            debug!("docker driver for {} destroyed before setup", self.image);
            return Ok(());
        };

        match self.client.remove(&id).await {
            Ok(()) => {
                info!("removed container {}", id);
                Ok(())
            }
            Err(e) => {
                warn!("failed to remove container {}: {}", id, e);
                Err(e)
            }
        }
    }
}

impl Drop for DockerDriver {
    fn drop(&mut self) {
        if let Some(id) = self.container.take() {
            warn!("docker driver dropped with live container {}; removing", id);
            if let Err(e) = self.client.remove_blocking(&id) {
                warn!("failed to remove container {}: {}", id, e);
            }
        }
    }
}

/// Factory constructor for the runtime-backed driver.
pub fn new_docker_driver(image: &str) -> Result<Box<dyn Driver>> {
    Ok(Box::new(DockerDriver::new(image)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_member_name() {
        assert_eq!(member_name(Path::new("etc/")), "etc");
        assert_eq!(member_name(Path::new("./etc/passwd")), "etc/passwd");
        assert_eq!(member_name(Path::new("./")), "");
        assert_eq!(member_name(Path::new(".")), "");
    }

    #[test]
    fn test_absolute() {
        assert_eq!(absolute("etc/hosts"), "/etc/hosts");
        assert_eq!(absolute("/etc/hosts"), "/etc/hosts");
    }
}
