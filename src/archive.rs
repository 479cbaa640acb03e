//! Image archive loading and layer flattening.
//!
//! Turns an image archive on the host into a single root filesystem
//! directory, the way a container runtime would stack the layers.
//!
//! ## Supported Layouts
//!
//! | Layout          | Detected by                | Layers come from            |
//! |-----------------|----------------------------|-----------------------------|
//! | `docker save`   | `manifest.json` at the root| `Layers` paths in manifest  |
//! | OCI image layout| `oci-layout` + `index.json`| manifest blob `layers[]`    |
//! | Plain rootfs    | anything else              | the archive itself          |
//!
//! The outer archive and each layer may be gzip-compressed.
//!
//! ## Layer Semantics
//!
//! - Later layers override earlier ones at the same path.
//! - `.wh.<name>` deletes `<name>` from lower layers.
//! - `.wh..wh..opq` hides every lower-layer entry of its directory.
//! - Whiteouts of a layer are applied before that layer's own entries are
//!   unpacked, so they never hide content from their own layer.
//!
//! ## Security
//!
//! - Entries with `..` or absolute paths are rejected ([`Error::PathTraversal`]).
//! - Whiteouts never follow symlinks while locating their target.
//! - Per-layer and total size bounds ([`MAX_LAYER_SIZE`], [`MAX_ROOTFS_SIZE`]).

use crate::command::EnvVar;
use crate::constants::{
    DOCKER_MANIFEST_FILE, GZIP_MAGIC, MAX_LAYER_SIZE, MAX_LAYERS, MAX_MANIFEST_SIZE,
    MAX_ROOTFS_SIZE, OCI_INDEX_FILE, OCI_LAYOUT_FILE, OPAQUE_WHITEOUT, WHITEOUT_PREFIX,
};
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, info};

/// Zstd frame magic bytes.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Nested OCI indexes followed before giving up.
const MAX_INDEX_DEPTH: usize = 4;

// =============================================================================
// Archive Model
// =============================================================================

/// Layout of an image archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// `docker save` output.
    DockerSave,
    /// OCI image layout.
    OciLayout,
    /// A single root filesystem tarball.
    Rootfs,
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DockerSave => write!(f, "docker-save"),
            Self::OciLayout => write!(f, "oci-layout"),
            Self::Rootfs => write!(f, "rootfs"),
        }
    }
}

/// One filesystem layer, possibly compressed.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Layer identifier (digest or path inside the archive).
    pub id: String,
    /// Raw layer bytes.
    pub data: Vec<u8>,
}

/// A loaded image archive.
#[derive(Debug, Clone)]
pub struct ImageArchive {
    reference: String,
    format: ArchiveFormat,
    layers: Vec<Layer>,
    env: Vec<EnvVar>,
}

/// Outcome of flattening layers into a rootfs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlattenStats {
    /// Layers applied.
    pub layers: usize,
    /// Entries unpacked.
    pub entries: usize,
    /// Whiteouts applied.
    pub whiteouts: usize,
    /// Bytes of regular file content unpacked.
    pub bytes: u64,
}

// =============================================================================
// Manifest Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerManifestEntry {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageConfigFile {
    #[serde(default)]
    config: Option<ImageRuntimeConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageRuntimeConfig {
    #[serde(default)]
    env: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciDescriptor {
    #[serde(default)]
    media_type: Option<String>,
    digest: String,
}

#[derive(Debug, Deserialize)]
struct OciIndex {
    manifests: Vec<OciDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciManifest {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    config: Option<OciDescriptor>,
    #[serde(default)]
    layers: Vec<OciDescriptor>,
    #[serde(default)]
    manifests: Vec<OciDescriptor>,
}

// =============================================================================
// Loading
// =============================================================================

impl ImageArchive {
    /// Reads an image archive from the host filesystem.
    pub fn open(path: &Path, verify_digests: bool) -> Result<Self> {
        let reference = path.display().to_string();
        let bytes = fs::read(path).map_err(|e| Error::ImageLoadFailed {
            reference: reference.clone(),
            reason: e.to_string(),
        })?;
        Self::from_bytes(reference, bytes, verify_digests)
    }

    /// Parses an in-memory image archive.
    pub fn from_bytes(
        reference: impl Into<String>,
        bytes: Vec<u8>,
        verify_digests: bool,
    ) -> Result<Self> {
        let reference = reference.into();
        let load_err = |reason: String| Error::ImageLoadFailed {
            reference: reference.clone(),
            reason,
        };

        let bytes = decompress(&reference, bytes)?;
        let names = list_files(&bytes).map_err(|e| load_err(e.to_string()))?;

        let archive = if names.iter().any(|n| n == DOCKER_MANIFEST_FILE) {
            let files = collect_files(&bytes).map_err(|e| load_err(e.to_string()))?;
            Self::from_docker_save(&reference, files)?
        } else if names.iter().any(|n| n == OCI_LAYOUT_FILE)
            && names.iter().any(|n| n == OCI_INDEX_FILE)
        {
            let files = collect_files(&bytes).map_err(|e| load_err(e.to_string()))?;
            Self::from_oci_layout(&reference, files, verify_digests)?
        } else {
            Self {
                reference: reference.clone(),
                format: ArchiveFormat::Rootfs,
                layers: vec![Layer {
                    id: reference.clone(),
                    data: bytes,
                }],
                env: Vec::new(),
            }
        };

        if archive.layers.len() > MAX_LAYERS {
            return Err(load_err(format!(
                "image has {} layers (limit {})",
                archive.layers.len(),
                MAX_LAYERS
            )));
        }

        info!(
            "loaded {} image {} ({} layers)",
            archive.format,
            archive.reference,
            archive.layers.len()
        );
        Ok(archive)
    }

    fn from_docker_save(reference: &str, files: HashMap<String, Vec<u8>>) -> Result<Self> {
        let load_err = |reason: String| Error::ImageLoadFailed {
            reference: reference.to_string(),
            reason,
        };

        let manifest_bytes = files
            .get(DOCKER_MANIFEST_FILE)
            .ok_or_else(|| load_err("missing manifest.json".to_string()))?;
        let manifest: Vec<DockerManifestEntry> = parse_json(manifest_bytes)
            .map_err(|e| load_err(format!("manifest.json: {}", e)))?;
        let entry = manifest
            .into_iter()
            .next()
            .ok_or_else(|| load_err("manifest.json lists no images".to_string()))?;

        debug!(
            "docker-save image {} with tags {:?}",
            entry.config,
            entry.repo_tags.as_deref().unwrap_or_default()
        );

        let env = match files.get(&normalize_name(&entry.config)) {
            Some(bytes) => read_image_config(bytes)
                .map_err(|e| load_err(format!("{}: {}", entry.config, e)))?,
            None => Vec::new(),
        };

        // Layers may repeat: identical blobs are stored once and listed twice.
        let mut layers = Vec::with_capacity(entry.layers.len());
        for layer_path in &entry.layers {
            let data = files
                .get(&normalize_name(layer_path))
                .cloned()
                .ok_or_else(|| load_err(format!("missing layer {}", layer_path)))?;
            layers.push(Layer {
                id: layer_path.clone(),
                data,
            });
        }

        Ok(Self {
            reference: reference.to_string(),
            format: ArchiveFormat::DockerSave,
            layers,
            env,
        })
    }

    fn from_oci_layout(
        reference: &str,
        files: HashMap<String, Vec<u8>>,
        verify_digests: bool,
    ) -> Result<Self> {
        let load_err = |reason: String| Error::ImageLoadFailed {
            reference: reference.to_string(),
            reason,
        };

        let index_bytes = files
            .get(OCI_INDEX_FILE)
            .ok_or_else(|| load_err("missing index.json".to_string()))?;
        let index: OciIndex =
            parse_json(index_bytes).map_err(|e| load_err(format!("index.json: {}", e)))?;
        let mut descriptor = index
            .manifests
            .into_iter()
            .next()
            .ok_or_else(|| load_err("index.json lists no manifests".to_string()))?;

        // Follow nested indexes down to an image manifest.
        let mut depth = 0;
        let manifest = loop {
            let blob = read_blob(&files, &descriptor.digest, verify_digests, reference)?;
            let manifest: OciManifest = parse_json(&blob)
                .map_err(|e| load_err(format!("manifest {}: {}", descriptor.digest, e)))?;
            let is_index = manifest.media_type.as_deref().is_some_and(|m| m.contains("index"))
                || descriptor.media_type.as_deref().is_some_and(|m| m.contains("index"))
                || (manifest.layers.is_empty() && !manifest.manifests.is_empty());
            if !is_index {
                break manifest;
            }
            depth += 1;
            if depth > MAX_INDEX_DEPTH {
                return Err(load_err("too many nested image indexes".to_string()));
            }
            descriptor = manifest
                .manifests
                .into_iter()
                .next()
                .ok_or_else(|| load_err("nested index lists no manifests".to_string()))?;
        };

        let env = match &manifest.config {
            Some(config) => {
                let blob = read_blob(&files, &config.digest, verify_digests, reference)?;
                read_image_config(&blob)
                    .map_err(|e| load_err(format!("config {}: {}", config.digest, e)))?
            }
            None => Vec::new(),
        };

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for desc in &manifest.layers {
            if desc.media_type.as_deref().is_some_and(|m| m.ends_with("+zstd")) {
                return Err(Error::LayerExtractionFailed {
                    digest: desc.digest.clone(),
                    reason: "zstd-compressed layers are not supported".to_string(),
                });
            }
            let data = read_blob(&files, &desc.digest, verify_digests, reference)?;
            layers.push(Layer {
                id: desc.digest.clone(),
                data,
            });
        }

        Ok(Self {
            reference: reference.to_string(),
            format: ArchiveFormat::OciLayout,
            layers,
            env,
        })
    }

    /// Returns the archive reference (host path).
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Returns the detected layout.
    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Returns the layers, lowest first.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Returns the image config's `Env`.
    pub fn env(&self) -> &[EnvVar] {
        &self.env
    }

    /// Applies all layers, in order, into `rootfs`.
    pub fn flatten_into(&self, rootfs: &Path) -> Result<FlattenStats> {
        let mut stats = FlattenStats::default();
        let mut dir_modes = HashMap::new();

        for layer in &self.layers {
            debug!("Extracting layer: {}", layer.id);

            if layer.data.len() > MAX_LAYER_SIZE {
                return Err(Error::ImageTooLarge {
                    size: layer.data.len() as u64,
                    limit: MAX_LAYER_SIZE as u64,
                });
            }

            let data = decompress_layer(layer)?;
            stats.whiteouts += apply_whiteouts(&data, rootfs, &layer.id)?;
            unpack_layer(&data, rootfs, &layer.id, &mut stats, &mut dir_modes)?;
            stats.layers += 1;
        }

        restore_dir_modes(dir_modes);

        info!(
            "flattened {} layers into {} ({} entries, {} whiteouts)",
            stats.layers,
            rootfs.display(),
            stats.entries,
            stats.whiteouts
        );
        Ok(stats)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> std::result::Result<T, String> {
    if bytes.len() > MAX_MANIFEST_SIZE {
        return Err(format!("document exceeds {} bytes", MAX_MANIFEST_SIZE));
    }
    serde_json::from_slice(bytes).map_err(|e| e.to_string())
}

/// Reads `config.Env` from an image config document.
fn read_image_config(bytes: &[u8]) -> std::result::Result<Vec<EnvVar>, String> {
    let config: ImageConfigFile = parse_json(bytes)?;
    let env = config
        .config
        .unwrap_or_default()
        .env
        .unwrap_or_default()
        .iter()
        .filter_map(|s| EnvVar::parse(s))
        .collect();
    Ok(env)
}

/// Strips `./` and leading `/` from archive member names.
fn normalize_name(name: &str) -> String {
    let mut name = name;
    loop {
        if let Some(rest) = name.strip_prefix("./") {
            name = rest;
        } else if let Some(rest) = name.strip_prefix('/') {
            name = rest;
        } else {
            break;
        }
    }
    name.to_string()
}

/// Maps `sha256:<hex>` to `blobs/sha256/<hex>`.
fn blob_path(digest: &str) -> Option<String> {
    let (alg, hex) = digest.split_once(':')?;
    if alg.is_empty()
        || hex.is_empty()
        || !alg.chars().all(|c| c.is_ascii_alphanumeric())
        || !hex.chars().all(|c| c.is_ascii_hexdigit())
    {
        return None;
    }
    Some(format!("blobs/{}/{}", alg, hex))
}

/// Copies a blob out of the layout, verifying its digest when asked.
fn read_blob(
    files: &HashMap<String, Vec<u8>>,
    digest: &str,
    verify: bool,
    reference: &str,
) -> Result<Vec<u8>> {
    let path = blob_path(digest).ok_or_else(|| Error::ImageLoadFailed {
        reference: reference.to_string(),
        reason: format!("invalid digest {}", digest),
    })?;
    let data = files.get(&path).ok_or_else(|| Error::ImageLoadFailed {
        reference: reference.to_string(),
        reason: format!("missing blob {}", digest),
    })?;
    if verify {
        verify_digest(digest, data)?;
    }
    Ok(data.clone())
}

/// Verifies sha256 digests; other algorithms are accepted unverified.
fn verify_digest(digest: &str, data: &[u8]) -> Result<()> {
    let Some(expected) = digest.strip_prefix("sha256:") else {
        debug!("skipping verification of non-sha256 digest {}", digest);
        return Ok(());
    };
    let actual = hex::encode(Sha256::digest(data));
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::DigestMismatch {
            expected: digest.to_string(),
            actual: format!("sha256:{}", actual),
        });
    }
    Ok(())
}

fn decompress(reference: &str, bytes: Vec<u8>) -> Result<Vec<u8>> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        return Ok(bytes);
    }
    let mut out = Vec::new();
    GzDecoder::new(&bytes[..])
        .take(MAX_ROOTFS_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::ImageLoadFailed {
            reference: reference.to_string(),
            reason: format!("gzip: {}", e),
        })?;
    if out.len() as u64 > MAX_ROOTFS_SIZE {
        return Err(Error::ImageTooLarge {
            size: out.len() as u64,
            limit: MAX_ROOTFS_SIZE,
        });
    }
    Ok(out)
}

fn decompress_layer(layer: &Layer) -> Result<Cow<'_, [u8]>> {
    if layer.data.starts_with(&ZSTD_MAGIC) {
        return Err(Error::LayerExtractionFailed {
            digest: layer.id.clone(),
            reason: "zstd-compressed layers are not supported".to_string(),
        });
    }
    if !layer.data.starts_with(&GZIP_MAGIC) {
        return Ok(Cow::Borrowed(&layer.data));
    }
    let mut out = Vec::new();
    GzDecoder::new(&layer.data[..])
        .take(MAX_ROOTFS_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::LayerExtractionFailed {
            digest: layer.id.clone(),
            reason: e.to_string(),
        })?;
    if out.len() as u64 > MAX_ROOTFS_SIZE {
        return Err(Error::ImageTooLarge {
            size: out.len() as u64,
            limit: MAX_ROOTFS_SIZE,
        });
    }
    Ok(Cow::Owned(out))
}

/// Names of regular files in a tar, normalized.
fn list_files(bytes: &[u8]) -> std::io::Result<Vec<String>> {
    let mut archive = Archive::new(bytes);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        if entry.header().entry_type().is_file() {
            names.push(normalize_name(&entry.path()?.to_string_lossy()));
        }
    }
    Ok(names)
}

/// Contents of every regular file in a tar, keyed by normalized name.
fn collect_files(bytes: &[u8]) -> std::io::Result<HashMap<String, Vec<u8>>> {
    let mut archive = Archive::new(bytes);
    let mut files = HashMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = normalize_name(&entry.path()?.to_string_lossy());
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        files.insert(name, data);
    }
    Ok(files)
}

/// Rejects absolute paths and `..` components.
fn validate_entry_path(path: &Path) -> Result<()> {
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(Error::PathTraversal {
            path: path.to_string_lossy().to_string(),
        });
    }
    Ok(())
}

/// Joins `rel` under `root` only if no intermediate component is a symlink.
///
/// The final component is not inspected.
fn literal_path(root: &Path, rel: &Path) -> Option<PathBuf> {
    let components: Vec<_> = rel
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    let mut current = root.to_path_buf();
    for (i, component) in components.iter().enumerate() {
        current.push(component);
        if i + 1 < components.len() {
            match fs::symlink_metadata(&current) {
                Ok(meta) if meta.is_dir() => {}
                _ => return None,
            }
        }
    }
    Some(current)
}

/// Creates a FIFO at `rel` under `root`, adding missing parent directories.
///
/// Refuses to go through a symlinked or non-directory parent.
#[cfg(unix)]
fn make_fifo(root: &Path, rel: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::PermissionsExt;

    let components: Vec<_> = rel
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    let Some((name, parents)) = components.split_last() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty fifo path",
        ));
    };

    let mut target = root.to_path_buf();
    for component in parents {
        target.push(component);
        match fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("parent {} is not a directory", target.display()),
                ));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => fs::create_dir(&target)?,
            Err(e) => return Err(e),
        }
    }
    target.push(name);

    let c_path = std::ffi::CString::new(target.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated path for the whole call.
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    fs::set_permissions(&target, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn make_fifo(_root: &Path, _rel: &Path, _mode: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "fifos are not supported on this platform",
    ))
}

/// Removes whatever is at `path` without following a final symlink.
fn remove_entry(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn apply_whiteouts(data: &[u8], rootfs: &Path, layer_id: &str) -> Result<usize> {
    let extract_err = |reason: String| Error::LayerExtractionFailed {
        digest: layer_id.to_string(),
        reason,
    };

    let mut archive = Archive::new(data);
    let mut applied = 0;

    for entry in archive.entries().map_err(|e| extract_err(e.to_string()))? {
        let entry = entry.map_err(|e| extract_err(e.to_string()))?;
        let path = entry.path().map_err(|e| extract_err(e.to_string()))?;
        validate_entry_path(&path)?;

        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let parent = path.parent().unwrap_or(Path::new(""));

        if filename == OPAQUE_WHITEOUT {
            let dir = if parent.as_os_str().is_empty() {
                Some(rootfs.to_path_buf())
            } else {
                literal_path(rootfs, parent)
            };
            let Some(dir) = dir else {
                continue;
            };
            if !fs::symlink_metadata(&dir).map(|m| m.is_dir()).unwrap_or(false) {
                continue;
            }
            for child in fs::read_dir(&dir).map_err(|e| extract_err(e.to_string()))? {
                let child = child.map_err(|e| extract_err(e.to_string()))?;
                remove_entry(&child.path()).map_err(|e| extract_err(e.to_string()))?;
            }
            debug!("opaque whiteout cleared {}", dir.display());
            applied += 1;
        } else if let Some(target) = filename.strip_prefix(WHITEOUT_PREFIX) {
            if target.is_empty() {
                continue;
            }
            if let Some(target_path) = literal_path(rootfs, &parent.join(target)) {
                remove_entry(&target_path).map_err(|e| extract_err(e.to_string()))?;
                debug!("whiteout removed {}", target_path.display());
                applied += 1;
            }
        }
    }

    Ok(applied)
}

fn unpack_layer(
    data: &[u8],
    rootfs: &Path,
    layer_id: &str,
    stats: &mut FlattenStats,
    dir_modes: &mut HashMap<PathBuf, u32>,
) -> Result<()> {
    let extract_err = |reason: String| Error::LayerExtractionFailed {
        digest: layer_id.to_string(),
        reason,
    };

    let mut archive = Archive::new(data);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    for entry in archive.entries().map_err(|e| extract_err(e.to_string()))? {
        let mut entry = entry.map_err(|e| extract_err(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| extract_err(e.to_string()))?
            .into_owned();
        validate_entry_path(&path)?;

        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if filename.starts_with(WHITEOUT_PREFIX) {
            continue;
        }
        if path.components().all(|c| matches!(c, Component::CurDir)) {
            continue;
        }

        let entry_type = entry.header().entry_type();
        // Device nodes need CAP_MKNOD; they are left out of the tree.
        if matches!(entry_type, EntryType::Char | EntryType::Block) {
            debug!("skipping device node {}", path.display());
            continue;
        }

        // A later layer may change the type of an existing path.
        if let Some(target) = literal_path(rootfs, &path) {
            if let Ok(existing) = fs::symlink_metadata(&target) {
                let keep = entry_type == EntryType::Directory && existing.is_dir();
                if !keep {
                    remove_entry(&target).map_err(|e| extract_err(e.to_string()))?;
                }
            }
        }

        if entry_type == EntryType::Fifo {
            let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
            match make_fifo(rootfs, &path, mode) {
                Ok(()) => stats.entries += 1,
                Err(e) => debug!("skipping fifo {}: {}", path.display(), e),
            }
            continue;
        }

        let size = entry.size();
        stats.bytes += size;
        if stats.bytes > MAX_ROOTFS_SIZE {
            return Err(Error::ImageTooLarge {
                size: stats.bytes,
                limit: MAX_ROOTFS_SIZE,
            });
        }

        let unpacked = entry
            .unpack_in(rootfs)
            .map_err(|e| extract_err(format!("{}: {}", path.display(), e)))?;
        if !unpacked {
            debug!("tar skipped {}", path.display());
            continue;
        }
        stats.entries += 1;

        if entry_type == EntryType::Directory {
            let mode = entry.header().mode().unwrap_or(0o755) & 0o7777;
            let dir = rootfs.join(&path);
            hold_dir_writable(&dir, mode).map_err(|e| extract_err(e.to_string()))?;
            dir_modes.insert(dir, mode);
        }
    }

    Ok(())
}

/// Keeps a freshly unpacked directory owner-writable until flattening ends.
#[cfg(unix)]
fn hold_dir_writable(dir: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode & 0o700 != 0o700 {
        fs::set_permissions(dir, fs::Permissions::from_mode(mode | 0o700))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn hold_dir_writable(_dir: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Applies the final directory modes, deepest paths first.
#[cfg(unix)]
fn restore_dir_modes(dir_modes: HashMap<PathBuf, u32>) {
    use std::os::unix::fs::PermissionsExt;
    let mut dirs: Vec<_> = dir_modes.into_iter().collect();
    dirs.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
    for (path, mode) in dirs {
        if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(mode)) {
            debug!("could not restore mode of {}: {}", path.display(), e);
        }
    }
}

#[cfg(not(unix))]
fn restore_dir_modes(_dir_modes: HashMap<PathBuf, u32>) {}

/// Makes every directory under `root` owner-writable so it can be removed.
#[cfg(unix)]
pub(crate) fn make_removable(root: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = fs::symlink_metadata(root)?;
    if !meta.is_dir() {
        return Ok(());
    }
    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        fs::set_permissions(root, fs::Permissions::from_mode(mode | 0o700))?;
    }
    for child in fs::read_dir(root)? {
        let child = child?;
        if child.file_type()?.is_dir() {
            make_removable(&child.path())?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn make_removable(_root: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("./manifest.json"), "manifest.json");
        assert_eq!(normalize_name("/abc/layer.tar"), "abc/layer.tar");
        assert_eq!(normalize_name("blobs/sha256/ab"), "blobs/sha256/ab");
    }

    #[test]
    fn test_blob_path() {
        assert_eq!(
            blob_path("sha256:abcdef").as_deref(),
            Some("blobs/sha256/abcdef")
        );
        assert_eq!(blob_path("sha256:../etc"), None);
        assert_eq!(blob_path("nodigest"), None);
    }

    #[test]
    fn test_validate_entry_path() {
        assert!(validate_entry_path(Path::new("etc/passwd")).is_ok());
        assert!(validate_entry_path(Path::new("./etc/a..b")).is_ok());
        assert!(matches!(
            validate_entry_path(Path::new("../escape")),
            Err(Error::PathTraversal { .. })
        ));
        assert!(matches!(
            validate_entry_path(Path::new("/etc/passwd")),
            Err(Error::PathTraversal { .. })
        ));
    }

    #[test]
    fn test_verify_digest() {
        let data = b"hello world";
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        assert!(verify_digest(&digest, data).is_ok());
        assert!(matches!(
            verify_digest(&digest, b"tampered"),
            Err(Error::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_read_image_config() {
        let json = br#"{"config":{"Env":["PATH=/usr/bin","GREETING=hi=there"],"WorkingDir":"/app"}}"#;
        let env = read_image_config(json).unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env[1], EnvVar::new("GREETING", "hi=there"));
        assert!(read_image_config(b"{}").unwrap().is_empty());
    }
}
