//! # structest
//!
//! **Container Image Inspection Drivers for Structure Tests**
//!
//! This crate gives a structure-test harness one interface for running
//! commands inside a container image and inspecting its filesystem,
//! regardless of how the image is materialized.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           structest                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                      Driver Trait                           │    │
//! │  │  setup(env, cmds) → process_command / stat / read / ls     │    │
//! │  │                     → destroy()                             │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                  init_driver_impl(kind)                   │      │
//! │  │       "docker" | "runtime"        "tar" | "archive"       │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! ├──────────────────────────────┼──────────────────────────────────────┤
//! │  ┌──────────────────────┐    │    ┌──────────────────────────┐      │
//! │  │     DockerDriver     │◄───┴───►│        TarDriver         │      │
//! │  │  detached container  │         │  layers flattened into   │      │
//! │  │  exec -e / cp | tar  │         │  a temp dir; chroot or   │      │
//! │  │  (ContainerClient)   │         │  host exec, in-root      │      │
//! │  │                      │         │  path resolution         │      │
//! │  └──────────────────────┘         └──────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Exit Codes and Dispatch Failures
//!
//! [`Driver::process_command`] returns `Result<ExecResult>`. `Ok` always
//! carries the command's exit code (including non-zero and `128 + n` for a
//! signal); `Err` means the command never ran.
//!
//! # Security Properties
//!
//! - **Path Traversal Protection**: archive entries with `..` or absolute
//!   paths are rejected during extraction.
//! - **Root Confinement**: tar-driver filesystem calls resolve symlinks
//!   inside the extraction root.
//! - **Size Limits**: per-layer and total extraction bounds in [`constants`].
//! - **Digest Verification**: OCI layout blobs are checked against their
//!   sha256 digests.
//!
//! # Example
//!
//! ```rust,ignore
//! use structest::{Command, DriverGuard, EnvVar, init_driver_impl};
//!
//! #[tokio::main]
//! async fn main() -> structest::Result<()> {
//!     let ctor = init_driver_impl("docker").expect("known driver");
//!     let mut driver = DriverGuard::new(ctor("alpine:3.20")?);
//!     driver.setup(&[], &[]).await?;
//!
//!     let result = driver
//!         .process_command(&[EnvVar::new("GREETING", "hi")], &Command::from(["sh", "-c", "echo $GREETING"]))
//!         .await?;
//!     assert_eq!(result.stdout, "hi\n");
//!
//!     driver.release().await
//! }
//! ```

pub mod archive;
pub mod client;
pub mod command;
pub mod config;
pub mod constants;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod metadata;

// Re-exports
pub use archive::{ArchiveFormat, FlattenStats, ImageArchive};
pub use client::{ContainerClient, ContainerSpec, DockerCli, InstanceStatus};
pub use command::{Command, EnvVar, ExecResult};
pub use config::{DockerConfig, DriverConfig, ExecMode, TarConfig};
pub use constants::*;
pub use driver::{Driver, DriverGuard, DriverState};
pub use drivers::{
    DockerDriver, DriverConstructor, DriverKind, TarDriver, init_driver_impl, new_driver,
};
pub use error::{Error, Result};
pub use metadata::{FileInfo, FileKind};
