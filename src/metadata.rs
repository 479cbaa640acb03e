//! Filesystem entry metadata shared by all drivers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Symbolic link (not followed).
    Symlink,
    /// Device, FIFO, socket or anything else.
    Other,
}

impl FileKind {
    fn type_char(self) -> char {
        match self {
            Self::File => '-',
            Self::Dir => 'd',
            Self::Symlink => 'l',
            Self::Other => '?',
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Dir => write!(f, "dir"),
            Self::Symlink => write!(f, "symlink"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Metadata for one filesystem entry inside an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Base name of the entry.
    pub name: String,
    /// Size in bytes (0 for directories from runtime archives).
    pub size: u64,
    /// Permission bits, including setuid/setgid/sticky (`0o7777` mask).
    pub mode: u32,
    /// Last modification time.
    pub modified: DateTime<Utc>,
    /// Entry type.
    pub kind: FileKind,
}

impl FileInfo {
    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    /// Returns true for regular files.
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    /// Renders the mode the way `ls -l` does, e.g. `-rwxr-xr-x`.
    pub fn permissions(&self) -> String {
        let mode = self.mode;
        let mut out = String::with_capacity(10);
        out.push(self.kind.type_char());

        let bit = |mask: u32, c: char| if mode & mask != 0 { c } else { '-' };
        let special = |exec: bool, set: bool, lower: char, upper: char| match (exec, set) {
            (true, true) => lower,
            (false, true) => upper,
            (true, false) => 'x',
            (false, false) => '-',
        };

        out.push(bit(0o400, 'r'));
        out.push(bit(0o200, 'w'));
        out.push(special(mode & 0o100 != 0, mode & 0o4000 != 0, 's', 'S'));
        out.push(bit(0o040, 'r'));
        out.push(bit(0o020, 'w'));
        out.push(special(mode & 0o010 != 0, mode & 0o2000 != 0, 's', 'S'));
        out.push(bit(0o004, 'r'));
        out.push(bit(0o002, 'w'));
        out.push(special(mode & 0o001 != 0, mode & 0o1000 != 0, 't', 'T'));
        out
    }

    /// Builds metadata from a host `lstat`/`stat` result.
    pub(crate) fn from_fs(name: impl Into<String>, meta: &std::fs::Metadata) -> Self {
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Dir
        } else if file_type.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        };

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o7777
        };
        #[cfg(not(unix))]
        let mode = if meta.permissions().readonly() { 0o444 } else { 0o644 };

        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::UNIX_EPOCH);

        Self {
            name: name.into(),
            size: meta.len(),
            mode,
            modified,
            kind,
        }
    }

    /// Builds metadata from a tar header (runtime copy archives).
    pub(crate) fn from_tar_header(
        name: impl Into<String>,
        header: &tar::Header,
    ) -> std::io::Result<Self> {
        let kind = match header.entry_type() {
            tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::Link => {
                FileKind::File
            }
            tar::EntryType::Directory => FileKind::Dir,
            tar::EntryType::Symlink => FileKind::Symlink,
            _ => FileKind::Other,
        };
        let mtime = header.mtime()?;
        let modified = i64::try_from(mtime)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(DateTime::UNIX_EPOCH);

        Ok(Self {
            name: name.into(),
            size: if kind == FileKind::Dir { 0 } else { header.size()? },
            mode: header.mode()? & 0o7777,
            modified,
            kind,
        })
    }
}

/// Returns the base name `stat` reports for an image path (`/` for the root).
pub(crate) fn base_name(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, name)) if !name.is_empty() => name.to_string(),
        None if !trimmed.is_empty() => trimmed.to_string(),
        _ => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(mode: u32, kind: FileKind) -> FileInfo {
        FileInfo {
            name: "x".to_string(),
            size: 0,
            mode,
            modified: DateTime::UNIX_EPOCH,
            kind,
        }
    }

    #[test]
    fn test_permissions_string() {
        assert_eq!(info(0o644, FileKind::File).permissions(), "-rw-r--r--");
        assert_eq!(info(0o755, FileKind::Dir).permissions(), "drwxr-xr-x");
        assert_eq!(info(0o777, FileKind::Symlink).permissions(), "lrwxrwxrwx");
        assert_eq!(info(0o4755, FileKind::File).permissions(), "-rwsr-xr-x");
        assert_eq!(info(0o1777, FileKind::Dir).permissions(), "drwxrwxrwt");
        assert_eq!(info(0o2644, FileKind::File).permissions(), "-rw-r-Sr--");
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("/etc/passwd"), "passwd");
        assert_eq!(base_name("/etc/"), "etc");
        assert_eq!(base_name("/"), "/");
        assert_eq!(base_name("relative"), "relative");
    }

    #[test]
    fn test_from_tar_header() {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(12);
        header.set_mode(0o100644);
        header.set_mtime(1_700_000_000);
        let meta = FileInfo::from_tar_header("hosts", &header).unwrap();
        assert_eq!(meta.size, 12);
        assert_eq!(meta.mode, 0o644);
        assert_eq!(meta.modified.timestamp(), 1_700_000_000);
        assert!(meta.is_file());
    }
}
