//! Core storage types.
//!
//! These types cross the gateway boundary and are serialization-friendly so
//! the protocol adapter can forward them without translation layers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which physical backend a path routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Internal flash volume. Always mounted.
    Internal,
    /// Removable card. May be absent, unmounted or unformatted.
    External,
}

/// Entry type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// File metadata as reported by `stat` and directory reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Entry type.
    pub kind: FileType,
    /// Size in bytes (0 for directories).
    pub size: u64,
}

impl FileInfo {
    /// Metadata for a regular file.
    pub fn file(size: u64) -> Self {
        Self {
            kind: FileType::File,
            size,
        }
    }

    /// Metadata for a directory.
    pub fn directory() -> Self {
        Self {
            kind: FileType::Directory,
            size: 0,
        }
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// One directory entry: a name plus its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not a full path).
    pub name: String,
    /// Entry metadata.
    pub info: FileInfo,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(name: impl Into<String>, info: FileInfo) -> Self {
        Self {
            name: name.into(),
            info,
        }
    }
}

/// Filesystem capacity report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfo {
    /// Total space in bytes.
    pub total_space: u64,
    /// Free space in bytes.
    pub free_space: u64,
}

/// Filesystem flavor found on a mounted card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum FsType {
    /// FAT16 volume.
    Fat16,
    /// FAT32 volume.
    Fat32,
    /// exFAT volume.
    ExFat,
    /// Could not be determined.
    Unknown,
}

/// Identity and capacity of the removable card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardInfo {
    /// Volume label.
    pub label: String,
    /// Filesystem flavor.
    pub fs_type: FsType,
    /// Total space in bytes.
    pub total_space: u64,
    /// Free space in bytes.
    pub free_space: u64,
}

/// Health of one backend.
///
/// Only `Ok` serves filesystem operations. The intermediate states record
/// how far the last mount attempt got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum StorageStatus {
    /// Mounted and serving.
    Ok,
    /// No media present.
    NotReady,
    /// Media present, volume mount failed.
    NotMounted,
    /// Mounted but no recognizable filesystem. Terminal until a format.
    NoFilesystem,
    /// Filesystem detected but its metadata could not be read.
    NotAccessible,
    /// Hardware initialization failed.
    InternalError,
}

/// Requested access for an open call. A flag set, not a mode enum: write
/// handles usually keep read access too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessMode {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
}

impl AccessMode {
    /// Read-only access.
    pub fn read() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    /// Write-only access.
    pub fn write() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    /// Read and write access.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }
}

/// How an open call treats existing and missing targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenMode {
    /// Fail with NotExists when the target is missing.
    pub open_existing: bool,
    /// Create an empty file when the target is missing.
    pub open_always: bool,
    /// Like open_always, but the cursor starts at end of file.
    pub open_append: bool,
    /// Fail with Exists when the target is present.
    pub create_new: bool,
    /// Truncate an existing target to zero length.
    pub create_always: bool,
}

impl OpenMode {
    /// Open only if the target exists.
    pub fn open_existing() -> Self {
        Self {
            open_existing: true,
            ..Default::default()
        }
    }

    /// Open, creating an empty file if missing.
    pub fn open_always() -> Self {
        Self {
            open_always: true,
            ..Default::default()
        }
    }

    /// Open or create, positioned at end of file.
    pub fn open_append() -> Self {
        Self {
            open_append: true,
            ..Default::default()
        }
    }

    /// Create, failing if the target exists.
    pub fn create_new() -> Self {
        Self {
            create_new: true,
            ..Default::default()
        }
    }

    /// Create, truncating any existing target.
    pub fn create_always() -> Self {
        Self {
            create_always: true,
            ..Default::default()
        }
    }
}

/// Engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Command queue depth. A full queue blocks senders, it never errors.
    pub queue_depth: usize,
    /// How long the dispatcher waits for a command before running the
    /// media lifecycle tick.
    pub tick_period: Duration,
    /// Mount attempts per insertion before giving up.
    pub mount_retry_count: u32,
    /// Delay between failed mount attempts.
    pub mount_retry_delay: Duration,
    /// Buffer size for streamed file copies.
    pub copy_buffer_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_depth: 16,
            tick_period: Duration::from_secs(1),
            mount_retry_count: 10,
            mount_retry_delay: Duration::from_millis(1000),
            copy_buffer_len: 512,
        }
    }
}
