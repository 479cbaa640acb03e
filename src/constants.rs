//! # Driver Constants
//!
//! Resource limits, timeouts and well-known names for the driver layer.
//! These constants are the single source of truth for the bounds applied
//! while materializing images.
//!
//! ## Cross-References
//!
//! - [`crate::archive`]: Uses size limits and whiteout markers for layer flattening
//! - [`crate::drivers::tar`]: Uses symlink hop bound and default `PATH`
//! - [`crate::drivers::docker`]: Uses readiness timeouts and container naming
//! - [`crate::config`]: Uses the defaults and environment variable names

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================
//
// These limits prevent disk exhaustion from malformed image archives. The
// cumulative worst-case is bounded by MAX_ROOTFS_SIZE during extraction.
// =============================================================================

/// Maximum image reference length in bytes.
///
/// **Security**: Prevents pathological image names being forwarded to the
/// runtime CLI.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single layer blob (1 GiB).
///
/// **Security**: Each layer is held in memory while it is flattened; this
/// bounds the allocation.
pub const MAX_LAYER_SIZE: usize = 1024 * 1024 * 1024;

/// Maximum total extracted rootfs size (8 GiB).
///
/// **Security**: Enforced during tar extraction, accumulating across all layers.
///
/// **Attack Vector**: Compression bombs (small compressed, huge uncompressed).
pub const MAX_ROOTFS_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Maximum number of layers in an image.
pub const MAX_LAYERS: usize = 128;

/// Maximum manifest/index/config JSON size (4 MiB).
pub const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

/// Maximum symlink hops while resolving a path inside an extracted rootfs.
///
/// Matches Linux `MAXSYMLINKS`.
pub const MAX_SYMLINK_HOPS: usize = 40;

// =============================================================================
// Timeouts
// =============================================================================
//
// Control-plane CLI calls are bounded. Command execution (`process_command`)
// is deliberately unbounded; callers impose their own deadline if needed.
// =============================================================================

/// Default time to wait for a container to reach the running state.
pub const CONTAINER_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between readiness polls.
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default timeout for control-plane runtime CLI calls (run, inspect, rm).
pub const RUNTIME_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Names
// =============================================================================

/// Default runtime CLI binary.
pub const DEFAULT_RUNTIME_BINARY: &str = "docker";

/// Prefix for container and temp directory names.
pub const NAME_PREFIX: &str = "structest-";

/// Default keep-alive entrypoint for runtime-backed containers.
pub const DEFAULT_KEEPALIVE: &[&str] = &["tail", "-f", "/dev/null"];

/// `PATH` used inside a chroot when the image config does not set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

// =============================================================================
// Layer Format Markers
// =============================================================================
//
// Reference: <https://github.com/opencontainers/image-spec/blob/main/layer.md#whiteouts>
// =============================================================================

/// Whiteout prefix: `.wh.<name>` deletes `<name>` from lower layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Opaque whiteout marker: hides all lower-layer entries of its directory.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// File at the root of a `docker save` archive.
pub const DOCKER_MANIFEST_FILE: &str = "manifest.json";

/// Marker file at the root of an OCI image layout.
pub const OCI_LAYOUT_FILE: &str = "oci-layout";

/// Index file at the root of an OCI image layout.
pub const OCI_INDEX_FILE: &str = "index.json";

/// Gzip magic bytes.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// =============================================================================
// Environment Variables
// =============================================================================

/// Path of a YAML config file loaded by [`crate::config::DriverConfig::from_env`].
pub const ENV_CONFIG: &str = "STRUCTEST_CONFIG";

/// Overrides `docker.binary`.
pub const ENV_DOCKER_BINARY: &str = "STRUCTEST_DOCKER_BINARY";

/// Overrides `tar.exec_mode`.
pub const ENV_TAR_EXEC_MODE: &str = "STRUCTEST_TAR_EXEC_MODE";

/// Overrides `tar.temp_dir`.
pub const ENV_TMPDIR: &str = "STRUCTEST_TMPDIR";

/// Log level for the `structest` binary.
pub const ENV_LOG: &str = "STRUCTEST_LOG";

// =============================================================================
// Validation
// =============================================================================

/// Validates an image reference before it reaches a driver.
pub fn validate_image_ref(reference: &str) -> std::result::Result<(), &'static str> {
    if reference.trim().is_empty() {
        return Err("image reference cannot be empty");
    }
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err("image reference exceeds maximum length");
    }
    if reference.chars().any(|c| c.is_control()) {
        return Err("image reference contains control characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_image_ref() {
        assert!(validate_image_ref("alpine:3.19").is_ok());
        assert!(validate_image_ref("/tmp/image.tar").is_ok());
        assert!(validate_image_ref("").is_err());
        assert!(validate_image_ref("   ").is_err());
        assert!(validate_image_ref("bad\nref").is_err());
        assert!(validate_image_ref(&"a".repeat(MAX_IMAGE_REF_LEN + 1)).is_err());
    }

    #[test]
    fn test_opaque_marker_carries_prefix() {
        assert!(OPAQUE_WHITEOUT.starts_with(WHITEOUT_PREFIX));
    }
}
