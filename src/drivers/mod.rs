//! Driver implementations and the factory that selects between them.
//!
//! | Kind     | Aliases   | Materialization                    |
//! |----------|-----------|------------------------------------|
//! | `docker` | `runtime` | detached container via runtime CLI |
//! | `tar`    | `archive` | image archive flattened to a tmpdir |

pub mod docker;
pub mod tar;

pub use self::docker::DockerDriver;
pub use self::tar::TarDriver;

use crate::config::DriverConfig;
use crate::driver::Driver;
use crate::error::{Error, Result};

/// Builds a driver for an image reference.
pub type DriverConstructor = fn(&str) -> Result<Box<dyn Driver>>;

/// Available driver kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// Live container.
    Docker,
    /// Extracted image archive.
    Tar,
}

impl DriverKind {
    /// Parses a driver-kind identifier. Case-sensitive.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "docker" | "runtime" => Some(Self::Docker),
            "tar" | "archive" => Some(Self::Tar),
            _ => None,
        }
    }

    /// Returns the canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => docker::DOCKER_DRIVER_NAME,
            Self::Tar => self::tar::TAR_DRIVER_NAME,
        }
    }

    /// Returns the env-configured constructor for this kind.
    pub fn constructor(&self) -> DriverConstructor {
        match self {
            Self::Docker => docker::new_docker_driver,
            Self::Tar => self::tar::new_tar_driver,
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves a driver-kind identifier to its constructor.
///
/// Returns `None` for unrecognized identifiers; nothing is created.
pub fn init_driver_impl(kind: &str) -> Option<DriverConstructor> {
    DriverKind::from_str(kind).map(|k| k.constructor())
}

/// Builds a driver of `kind` for `image` with an explicit configuration.
pub fn new_driver(kind: &str, image: &str, config: &DriverConfig) -> Result<Box<dyn Driver>> {
    let kind = DriverKind::from_str(kind).ok_or_else(|| Error::UnknownDriver(kind.to_string()))?;
    config.validate()?;
    Ok(match kind {
        DriverKind::Docker => Box::new(DockerDriver::with_config(image, config)?),
        DriverKind::Tar => Box::new(TarDriver::with_config(image, config)?),
    })
}
