//! Error types for the driver layer.

use std::path::PathBuf;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the driver layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Filesystem Inspection Errors (assertable)
    // =========================================================================
    /// Path does not exist inside the image.
    #[error("no such file or directory: {path}")]
    NotFound { path: String },

    /// Path exists but is not a directory.
    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    /// Path is a directory where a file was expected.
    #[error("is a directory: {path}")]
    IsADirectory { path: String },

    /// Too many levels of symbolic links while resolving a path.
    #[error("too many levels of symbolic links: {path}")]
    SymlinkLoop { path: String },

    // =========================================================================
    // Driver Lifecycle Errors
    // =========================================================================
    /// Driver kind is not recognized by the factory.
    #[error("unknown driver '{0}' (expected one of: docker, tar)")]
    UnknownDriver(String),

    /// Operation called before `setup`.
    #[error("{driver} driver is not set up; call setup() before {operation}")]
    NotReady { driver: String, operation: String },

    /// Driver is in the wrong lifecycle state for the operation.
    #[error("{driver} driver is {state}, expected {expected}")]
    InvalidState {
        driver: String,
        state: String,
        expected: String,
    },

    /// A setup command exited non-zero.
    #[error("setup command {command:?} exited with code {exit_code}: {stderr}")]
    SetupCommandFailed {
        command: Vec<String>,
        exit_code: i32,
        stderr: String,
    },

    /// Releasing a materialization failed.
    #[error("failed to clean up {resource}: {reason}")]
    CleanupFailed { resource: String, reason: String },

    // =========================================================================
    // Container Errors
    // =========================================================================
    /// Container could not be started or never became ready.
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Command could not be dispatched into the container.
    #[error("exec failed in container '{container}': {reason}")]
    ExecFailed { container: String, reason: String },

    /// Runtime CLI is missing or unreachable.
    #[error("runtime '{runtime}' not available: {reason}")]
    RuntimeUnavailable { runtime: String, reason: String },

    /// Command is malformed (e.g. empty).
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    // =========================================================================
    // Image/Archive Errors
    // =========================================================================
    /// Failed to parse or validate an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Image archive could not be read.
    #[error("failed to load image '{reference}': {reason}")]
    ImageLoadFailed { reference: String, reason: String },

    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Layer content does not match its declared digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Image size exceeded limits.
    #[error("image exceeds size limit: {size} > {limit}")]
    ImageTooLarge { size: u64, limit: u64 },

    /// Path traversal attempt detected in tar archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value or unreadable config file.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Config file could not be read.
    #[error("failed to read config {path}: {reason}")]
    ConfigFile { path: PathBuf, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for the missing-path condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true when a directory listing hit a non-directory.
    pub fn is_not_a_directory(&self) -> bool {
        matches!(self, Self::NotADirectory { .. })
    }

    /// Maps an I/O error for `path` onto the inspection taxonomy.
    pub(crate) fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound {
                path: path.to_string(),
            },
            std::io::ErrorKind::NotADirectory => Self::NotADirectory {
                path: path.to_string(),
            },
            std::io::ErrorKind::IsADirectory => Self::IsADirectory {
                path: path.to_string(),
            },
            _ => Self::Io(err),
        }
    }
}
