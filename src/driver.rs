//! Driver trait - uniform exec and filesystem inspection over one image.
//!
//! A driver owns exactly one materialization of an image: a running
//! container or an extracted filesystem tree. Every materialization strategy
//! implements the same contract:
//!
//! - `setup`: create the execution context and run setup commands
//! - `process_command`: run one command with a per-call environment
//! - `stat_file` / `read_file` / `read_dir`: inspect the image filesystem
//! - `destroy`: release the materialization
//!
//! # Lifecycle
//!
//! ```text
//! new(image) → setup(env, cmds) → [process_command | stat_file | read_file | read_dir]* → destroy()
//! ```
//!
//! Inspection and exec before `setup` fail with [`Error::NotReady`]; a
//! second `setup` or `destroy` fails with [`Error::InvalidState`].
//!
//! # Implementations
//!
//! - `DockerDriver`: a live container driven through a runtime CLI
//! - `TarDriver`: an image archive flattened into a temp directory

use crate::command::{Command, EnvVar, ExecResult};
use crate::error::{Error, Result};
use crate::metadata::FileInfo;
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};
use tracing::warn;

// =============================================================================
// Driver State
// =============================================================================

/// Lifecycle state of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Constructed; `setup` not yet called.
    Created,
    /// `setup` succeeded; operations are allowed.
    Ready,
    /// `destroy` was called.
    Destroyed,
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Ready => write!(f, "ready"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Lifecycle bookkeeping shared by the driver implementations.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    driver: &'static str,
    state: DriverState,
    setup_attempted: bool,
}

impl Lifecycle {
    pub(crate) fn new(driver: &'static str) -> Self {
        Self {
            driver,
            state: DriverState::Created,
            setup_attempted: false,
        }
    }

    pub(crate) fn state(&self) -> DriverState {
        self.state
    }

    fn invalid(&self, expected: DriverState) -> Error {
        Error::InvalidState {
            driver: self.driver.to_string(),
            state: self.state.to_string(),
            expected: expected.to_string(),
        }
    }

    /// Fails unless `setup` has completed and `destroy` has not.
    pub(crate) fn ensure_ready(&self, operation: &str) -> Result<()> {
        match self.state {
            DriverState::Ready => Ok(()),
            DriverState::Created => Err(Error::NotReady {
                driver: self.driver.to_string(),
                operation: operation.to_string(),
            }),
            DriverState::Destroyed => Err(self.invalid(DriverState::Ready)),
        }
    }

    /// Claims the single `setup` call. A failed setup still consumes it.
    pub(crate) fn begin_setup(&mut self) -> Result<()> {
        match self.state {
            DriverState::Created if !self.setup_attempted => {
                self.setup_attempted = true;
                Ok(())
            }
            DriverState::Created => Err(Error::InvalidState {
                driver: self.driver.to_string(),
                state: "created (setup already attempted)".to_string(),
                expected: DriverState::Created.to_string(),
            }),
            _ => Err(self.invalid(DriverState::Created)),
        }
    }

    pub(crate) fn mark_ready(&mut self) {
        self.state = DriverState::Ready;
    }

    /// Transitions to `Destroyed`; fails on a second call.
    pub(crate) fn begin_destroy(&mut self) -> Result<()> {
        if self.state == DriverState::Destroyed {
            return Err(Error::InvalidState {
                driver: self.driver.to_string(),
                state: self.state.to_string(),
                expected: "created or ready".to_string(),
            });
        }
        self.state = DriverState::Destroyed;
        Ok(())
    }
}

// =============================================================================
// Driver Trait
// =============================================================================

/// Execution and inspection contract over one materialized image.
///
/// A single driver is not meant to be shared between concurrent callers;
/// independent drivers own independent materializations and can run in
/// parallel.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Returns the driver kind name (`docker`, `tar`).
    fn name(&self) -> &str;

    /// Returns the image reference this driver is bound to.
    fn image(&self) -> &str;

    /// Returns the current lifecycle state.
    fn state(&self) -> DriverState;

    /// Prepares the execution context.
    ///
    /// `env` applies to the whole materialization (and to every setup
    /// command); `commands` run in order and any non-zero exit aborts
    /// setup with [`Error::SetupCommandFailed`].
    async fn setup(&mut self, env: &[EnvVar], commands: &[Command]) -> Result<()>;

    /// Runs one command and captures its output.
    ///
    /// `env` is scoped to this invocation. A non-zero exit code is returned
    /// as `Ok`; `Err` means the command could not be dispatched.
    async fn process_command(&self, env: &[EnvVar], command: &Command) -> Result<ExecResult>;

    /// Returns metadata for `path` without following a final symlink.
    async fn stat_file(&self, path: &str) -> Result<FileInfo>;

    /// Returns the full contents of `path`.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Returns metadata for the immediate children of `path`, sorted by name.
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>>;

    /// Releases the materialization. Must be called exactly once.
    async fn destroy(&mut self) -> Result<()>;
}

// =============================================================================
// Scoped Ownership
// =============================================================================

/// Owns a driver and guarantees it is torn down.
///
/// Call [`DriverGuard::release`] on the normal path. If the guard is dropped
/// without it (early return, panic), the driver's own `Drop` removes the
/// container or temp directory synchronously.
pub struct DriverGuard {
    driver: Box<dyn Driver>,
    released: bool,
}

impl DriverGuard {
    /// Wraps a freshly constructed driver.
    pub fn new(driver: Box<dyn Driver>) -> Self {
        Self {
            driver,
            released: false,
        }
    }

    /// Destroys the driver, logging any cleanup failure.
    ///
    /// Cleanup errors are returned for inspection but are never fatal to
    /// an otherwise passing test.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let result = self.driver.destroy().await;
        if let Err(e) = &result {
            warn!(
                "failed to destroy {} driver for {}: {}",
                self.driver.name(),
                self.driver.image(),
                e
            );
        }
        result
    }
}

impl Deref for DriverGuard {
    type Target = dyn Driver;

    fn deref(&self) -> &Self::Target {
        self.driver.as_ref()
    }
}

impl DerefMut for DriverGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.driver.as_mut()
    }
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                "{} driver for {} dropped without release; falling back to drop cleanup",
                self.driver.name(),
                self.driver.image()
            );
        }
    }
}
