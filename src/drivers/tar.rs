//! # Tar Driver - Flattened Image Filesystem
//!
//! Implements [`Driver`] over an image archive on the host. The constructor
//! reads the archive (docker-save, OCI layout or plain rootfs tar) and
//! flattens its layers into a private temp directory; everything after that
//! works against the extracted tree.
//!
//! ## Command Scoping
//!
//! | Mode     | Invocation                         | Environment base          |
//! |----------|------------------------------------|---------------------------|
//! | `chroot` | `chroot <root> <cmd...>`           | default `PATH`, image env |
//! | `host`   | `<cmd...>` with cwd = root         | host `PATH`, image env    |
//!
//! In `host` mode absolute paths in the program and its arguments are
//! rewritten under the root. Paths embedded inside shell scripts are not.
//!
//! ## Path Resolution
//!
//! Filesystem operations never leave the root: `..` is clamped, absolute
//! symlink targets are re-rooted, and symlink chains are bounded by
//! [`MAX_SYMLINK_HOPS`].

use crate::archive::{ArchiveFormat, FlattenStats, ImageArchive, make_removable};
use crate::command::{Command, EnvVar, ExecResult, exit_code_of};
use crate::config::{DriverConfig, ExecMode, TarConfig};
use crate::constants::{DEFAULT_PATH, MAX_SYMLINK_HOPS, validate_image_ref};
use crate::driver::{Driver, DriverState, Lifecycle};
use crate::error::{Error, Result};
use crate::metadata::{FileInfo, base_name};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Driver kind name.
pub const TAR_DRIVER_NAME: &str = "tar";

/// Archive-backed driver: one extracted root per driver.
pub struct TarDriver {
    image: String,
    exec_mode: ExecMode,
    format: ArchiveFormat,
    stats: FlattenStats,
    image_env: Vec<EnvVar>,
    setup_env: Vec<EnvVar>,
    chroot_binary: PathBuf,
    root_path: PathBuf,
    root: Option<TempDir>,
    lifecycle: Lifecycle,
}

impl TarDriver {
    /// Extracts `image` using configuration from the environment.
    pub fn new(image: &str) -> Result<Self> {
        Self::with_config(image, &DriverConfig::from_env()?)
    }

    /// Extracts `image` using `config.tar`.
    pub fn with_config(image: &str, config: &DriverConfig) -> Result<Self> {
        validate_image_ref(image).map_err(|reason| Error::InvalidImageReference {
            reference: image.to_string(),
            reason: reason.to_string(),
        })?;

        let archive = ImageArchive::open(Path::new(image), config.tar.verify_digests)?;
        Self::from_archive(archive, &config.tar)
    }

    /// Flattens an already loaded archive.
    pub fn from_archive(archive: ImageArchive, config: &TarConfig) -> Result<Self> {
        let root = create_root(config)?;
        let stats = match archive.flatten_into(root.path()) {
            Ok(stats) => stats,
            Err(e) => {
                discard_root(root);
                return Err(e);
            }
        };

        let exec_mode = config.exec_mode.resolve();
        if config.exec_mode == ExecMode::Auto && exec_mode == ExecMode::Host {
            warn!("not running as root; commands for {} run on the host", archive.reference());
        }
        info!(
            "extracted {} ({:?}, {} layers) into {} [exec mode: {}]",
            archive.reference(),
            archive.format(),
            stats.layers,
            root.path().display(),
            exec_mode
        );

        Ok(Self {
            image: archive.reference().to_string(),
            exec_mode,
            format: archive.format(),
            stats,
            image_env: archive.env().to_vec(),
            setup_env: Vec::new(),
            chroot_binary: locate_chroot(),
            root_path: root.path().to_path_buf(),
            root: Some(root),
            lifecycle: Lifecycle::new(TAR_DRIVER_NAME),
        })
    }

    /// Returns the extraction root while the driver is alive.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_ref().map(|r| r.path())
    }

    /// Returns the resolved command scoping mode.
    pub fn exec_mode(&self) -> ExecMode {
        self.exec_mode
    }

    /// Returns the detected archive layout.
    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Returns extraction counters.
    pub fn stats(&self) -> &FlattenStats {
        &self.stats
    }

    /// Returns the environment declared by the image config.
    pub fn image_env(&self) -> &[EnvVar] {
        &self.image_env
    }

    /// Builds the environment for one invocation, lowest precedence first.
    fn environment(&self, call_env: &[EnvVar]) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        match self.exec_mode {
            ExecMode::Host => {
                let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
                vars.push(("PATH".to_string(), path));
                vars.extend(
                    self.image_env
                        .iter()
                        .filter(|v| v.key != "PATH")
                        .map(|v| (v.key.clone(), v.value.clone())),
                );
            }
            _ => {
                vars.push(("PATH".to_string(), DEFAULT_PATH.to_string()));
                vars.extend(self.image_env.iter().map(|v| (v.key.clone(), v.value.clone())));
            }
        }
        vars.extend(
            self.setup_env
                .iter()
                .chain(call_env)
                .map(|v| (v.key.clone(), v.value.clone())),
        );
        vars
    }

    fn build_command(&self, command: &Command) -> Result<tokio::process::Command> {
        let program = command
            .program()
            .ok_or_else(|| Error::InvalidCommand("empty command".to_string()))?;

        let cmd = match self.exec_mode {
            ExecMode::Host => {
                let program = if program.starts_with('/') {
                    match resolve(&self.root_path, program, true) {
                        Ok(path) => path.to_string_lossy().into_owned(),
                        Err(_) => reroot(&self.root_path, program),
                    }
                } else {
                    program.to_string()
                };
                let mut cmd = tokio::process::Command::new(program);
                cmd.args(command.arguments().iter().map(|a| reroot_arg(&self.root_path, a)))
                    .current_dir(&self.root_path);
                cmd
            }
            _ => {
                let mut cmd = tokio::process::Command::new(&self.chroot_binary);
                cmd.arg(&self.root_path).args(command.parts());
                cmd
            }
        };
        Ok(cmd)
    }

    async fn run(&self, env: &[EnvVar], command: &Command) -> Result<ExecResult> {
        let mut cmd = self.build_command(command)?;
        cmd.env_clear()
            .envs(self.environment(env))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("running in {} ({}): {}", self.root_path.display(), self.exec_mode, command);
        match cmd.output().await {
            Ok(output) => Ok(ExecResult::from_output(
                &output.stdout,
                &output.stderr,
                exit_code_of(output.status),
            )),
            Err(e) => self.spawn_failure(command, e),
        }
    }

    /// Maps a spawn error the way a shell reports it: missing program is
    /// exit 127, non-executable is 126. A missing `chroot` is a dispatch
    /// failure.
    fn spawn_failure(&self, command: &Command, e: std::io::Error) -> Result<ExecResult> {
        if self.exec_mode != ExecMode::Host {
            return Err(Error::RuntimeUnavailable {
                runtime: self.chroot_binary.display().to_string(),
                reason: e.to_string(),
            });
        }
        let program = command.program().unwrap_or_default();
        let exit_code = match e.kind() {
            std::io::ErrorKind::NotFound => 127,
            std::io::ErrorKind::PermissionDenied => 126,
            _ => {
                return Err(Error::ExecFailed {
                    container: self.root_path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };
        Ok(ExecResult {
            stdout: String::new(),
            stderr: format!("{}: {}\n", program, e),
            exit_code,
        })
    }

    async fn blocking<T, F>(&self, operation: &str, path: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path, &str) -> Result<T> + Send + 'static,
    {
        self.lifecycle.ensure_ready(operation)?;
        let root = self.root_path.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || f(&root, &path))
            .await
            .map_err(|e| Error::Internal(format!("{} task failed: {}", operation, e)))?
    }
}

/// Finds `chroot` on the host `PATH`, then in the standard system dirs.
///
/// Looked up once so a `PATH` in the command environment cannot hide it.
fn locate_chroot() -> PathBuf {
    let host = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&host)
        .chain(std::env::split_paths(DEFAULT_PATH))
        .filter(|dir| dir.is_absolute())
        .map(|dir| dir.join("chroot"))
        .find(|p| p.is_file())
        .unwrap_or_else(|| PathBuf::from("chroot"))
}

/// Creates the extraction root under the configured parent.
fn create_root(config: &TarConfig) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(&config.temp_prefix);
    let root = match &config.temp_dir {
        Some(parent) => builder.tempdir_in(parent)?,
        None => builder.tempdir()?,
    };
    Ok(root)
}

fn discard_root(root: TempDir) {
    let path = root.path().to_path_buf();
    if let Err(e) = make_removable(&path) {
        warn!("failed to unlock {}: {}", path.display(), e);
    }
    if let Err(e) = root.close() {
        warn!("failed to remove {}: {}", path.display(), e);
    }
}

fn reroot(root: &Path, path: &str) -> String {
    root.join(path.trim_start_matches('/'))
        .to_string_lossy()
        .into_owned()
}

/// Rewrites `/abs` and `key=/abs` under the root; everything else is kept.
fn reroot_arg(root: &Path, arg: &str) -> String {
    if arg.starts_with('/') {
        return reroot(root, arg);
    }
    match arg.split_once('=') {
        Some((key, value)) if value.starts_with('/') && !key.is_empty() => {
            format!("{}={}", key, reroot(root, value))
        }
        _ => arg.to_string(),
    }
}

/// Resolves an image path to a host path under `root`.
///
/// Every existing component must exist; a missing one or a non-directory
/// in the middle is `NotFound`.
fn resolve(root: &Path, path: &str, follow_final: bool) -> Result<PathBuf> {
    let not_found = || Error::NotFound {
        path: path.to_string(),
    };

    let mut pending: Vec<String> = path.split('/').rev().map(str::to_string).collect();
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        match part.as_str() {
            "" | "." => continue,
            ".." => {
                resolved.pop();
                continue;
            }
            _ => {}
        }

        let candidate = resolved.join(&part);
        let host = root.join(&candidate);
        let is_last = pending.iter().all(|p| p.is_empty() || p == ".");

        let meta = fs::symlink_metadata(&host).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => not_found(),
            _ => Error::from_io(e, path),
        })?;

        if meta.file_type().is_symlink() && (!is_last || follow_final) {
            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return Err(Error::SymlinkLoop {
                    path: path.to_string(),
                });
            }
            let target = fs::read_link(&host).map_err(|e| Error::from_io(e, path))?;
            let target = target.to_string_lossy();
            if target.starts_with('/') {
                resolved = PathBuf::new();
            }
            pending.extend(target.split('/').rev().map(str::to_string));
            continue;
        }

        if !is_last && !meta.is_dir() {
            return Err(not_found());
        }
        resolved = candidate;
    }

    Ok(root.join(resolved))
}

fn stat_in(root: &Path, path: &str) -> Result<FileInfo> {
    let host = resolve(root, path, false)?;
    let meta = fs::symlink_metadata(&host).map_err(|e| Error::from_io(e, path))?;
    Ok(FileInfo::from_fs(base_name(path), &meta))
}

fn read_in(root: &Path, path: &str) -> Result<Vec<u8>> {
    let host = resolve(root, path, true)?;
    let meta = fs::metadata(&host).map_err(|e| Error::from_io(e, path))?;
    if meta.is_dir() {
        return Err(Error::IsADirectory {
            path: path.to_string(),
        });
    }
    fs::read(&host).map_err(|e| Error::from_io(e, path))
}

fn list_in(root: &Path, path: &str) -> Result<Vec<FileInfo>> {
    let host = resolve(root, path, true)?;
    let meta = fs::metadata(&host).map_err(|e| Error::from_io(e, path))?;
    if !meta.is_dir() {
        return Err(Error::NotADirectory {
            path: path.to_string(),
        });
    }

    let mut children = Vec::new();
    for entry in fs::read_dir(&host).map_err(|e| Error::from_io(e, path))? {
        let entry = entry?;
        let meta = fs::symlink_metadata(entry.path())?;
        children.push(FileInfo::from_fs(
            entry.file_name().to_string_lossy().into_owned(),
            &meta,
        ));
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(children)
}

#[async_trait]
impl Driver for TarDriver {
    fn name(&self) -> &str {
        TAR_DRIVER_NAME
    }

    fn image(&self) -> &str {
        &self.image
    }

    fn state(&self) -> DriverState {
        self.lifecycle.state()
    }

    async fn setup(&mut self, env: &[EnvVar], commands: &[Command]) -> Result<()> {
        self.lifecycle.begin_setup()?;
        self.setup_env = env.to_vec();

        for command in commands {
            let result = self.run(&[], command).await?;
            if !result.is_success() {
                return Err(Error::SetupCommandFailed {
                    command: command.parts().to_vec(),
                    exit_code: result.exit_code,
                    stderr: result.stderr.trim().to_string(),
                });
            }
        }

        self.lifecycle.mark_ready();
        debug!("tar driver for {} ready", self.image);
        Ok(())
    }

    async fn process_command(&self, env: &[EnvVar], command: &Command) -> Result<ExecResult> {
        self.lifecycle.ensure_ready("process_command")?;
        self.run(env, command).await
    }

    async fn stat_file(&self, path: &str) -> Result<FileInfo> {
        self.blocking("stat_file", path, stat_in).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.blocking("read_file", path, read_in).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        self.blocking("read_dir", path, list_in).await
    }

    async fn destroy(&mut self) -> Result<()> {
        self.lifecycle.begin_destroy()?;
        let Some(root) = self.root.take() else {
            return Ok(());
        };

        let path = root.path().display().to_string();
        let result = make_removable(root.path()).and_then(|()| root.close());
        match result {
            Ok(()) => {
                info!("removed extraction root {}", path);
                Ok(())
            }
            Err(e) => {
                warn!("failed to remove extraction root {}: {}", path, e);
                Err(Error::CleanupFailed {
                    resource: path,
                    reason: e.to_string(),
                })
            }
        }
    }
}

impl Drop for TarDriver {
    fn drop(&mut self) {
        if let Some(root) = self.root.take() {
            debug!("tar driver dropped without destroy; removing {}", root.path().display());
            discard_root(root);
        }
    }
}

/// Factory constructor for the archive-backed driver.
pub fn new_tar_driver(image: &str) -> Result<Box<dyn Driver>> {
    Ok(Box::new(TarDriver::new(image)?))
}
