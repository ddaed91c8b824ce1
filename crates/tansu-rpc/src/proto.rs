//! Session protocol records.
//!
//! The session/framing layer (out of scope here) turns a host-facing byte
//! stream into these discrete records and back. A logical command is
//! identified by `command_id`; multi-record transfers carry the same id in
//! every record and flag `has_next` on all but the last.

use serde::{Deserialize, Serialize};

use tansu_storage::{FileType, StorageError};

/// Payload capacity of one read or write chunk.
pub const READ_CHUNK_CAPACITY: usize = 512;

/// Entry capacity of one listing page.
pub const LIST_PAGE_CAPACITY: usize = 50;

/// Wire status of a request or response record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Success.
    Ok,
    /// Unspecified failure.
    Error,
    /// The record could not be decoded.
    ErrorDecode,
    /// The command is not supported.
    ErrorNotImplemented,
    /// The handler is busy.
    ErrorBusy,
    /// An in-flight multi-record command was cut short by another command.
    ErrorContinuousCommandInterrupted,
    /// Arguments were rejected before reaching storage.
    ErrorInvalidParameters,

    // One-to-one mappings of the storage domain errors.
    /// Storage backend not ready.
    ErrorStorageNotReady,
    /// Path already exists.
    ErrorStorageExists,
    /// Path does not exist.
    ErrorStorageNotExists,
    /// Invalid storage argument.
    ErrorStorageInvalidParameter,
    /// Storage denied the operation.
    ErrorStorageDenied,
    /// Path is not routable.
    ErrorStorageInvalidName,
    /// Storage internal failure.
    ErrorStorageInternal,
    /// Storage operation not implemented.
    ErrorStorageNotImplemented,
    /// Path is held by an open handle.
    ErrorStorageAlreadyOpen,
    /// Directory is not empty.
    ErrorStorageDirNotEmpty,
}

impl From<&StorageError> for CommandStatus {
    fn from(e: &StorageError) -> Self {
        match e {
            StorageError::NotReady => CommandStatus::ErrorStorageNotReady,
            StorageError::Exists(_) => CommandStatus::ErrorStorageExists,
            StorageError::NotExists(_) => CommandStatus::ErrorStorageNotExists,
            StorageError::InvalidParameter => CommandStatus::ErrorStorageInvalidParameter,
            StorageError::Denied(_) => CommandStatus::ErrorStorageDenied,
            StorageError::InvalidName(_) => CommandStatus::ErrorStorageInvalidName,
            StorageError::Internal(_) => CommandStatus::ErrorStorageInternal,
            StorageError::NotImplemented => CommandStatus::ErrorStorageNotImplemented,
            StorageError::AlreadyOpen(_) => CommandStatus::ErrorStorageAlreadyOpen,
        }
    }
}

/// One entry of a stat or listing response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Entry name (listing) or final path component (stat).
    pub name: String,
    /// Entry type.
    pub kind: FileType,
    /// Size in bytes (0 for directories).
    pub size: u64,
}

/// Request payloads understood by the storage handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPayload {
    /// Liveness probe; interrupts in-flight transfers like any other
    /// unrelated command.
    Ping,
    /// Total and free space of the filesystem holding `path`.
    Info { path: String },
    /// Change marker of the backend holding `path`.
    Timestamp { path: String },
    /// Metadata for one path.
    Stat { path: String },
    /// Paginated directory listing.
    List { path: String },
    /// Paginated file read.
    Read { path: String },
    /// One chunk of a (possibly multi-record) file write.
    Write { path: String, data: Vec<u8> },
    /// Remove a path; `recursive` walks directory trees.
    Delete { path: String, recursive: bool },
    /// Create a directory.
    Mkdir { path: String },
    /// Move a path.
    Rename { old_path: String, new_path: String },
    /// Hash a file's contents.
    Checksum { path: String },
    /// No payload. Paired with a non-`Ok` status this reports a
    /// protocol-level failure from the peer.
    Empty,
}

/// Response payloads produced by the storage handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Status-only response.
    Empty,
    /// Liveness reply.
    Ping,
    /// Filesystem capacity.
    Info { total_space: u64, free_space: u64 },
    /// Backend change marker.
    Timestamp { timestamp: u64 },
    /// Metadata for one path.
    Stat { file: FileEntry },
    /// One page of directory entries.
    List { files: Vec<FileEntry> },
    /// One chunk of file data.
    Read { data: Vec<u8> },
    /// Lowercase hex digest of the file contents.
    Checksum { digest: String },
}

/// One request record from the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Logical command identity; shared by every record of one transfer.
    pub command_id: u32,
    /// Record status; non-`Ok` on an `Empty` payload reports a peer-side
    /// failure.
    pub status: CommandStatus,
    /// More records of this command follow.
    pub has_next: bool,
    /// The command itself.
    pub payload: RequestPayload,
}

impl Request {
    /// A single-record command.
    pub fn new(command_id: u32, payload: RequestPayload) -> Self {
        Self {
            command_id,
            status: CommandStatus::Ok,
            has_next: false,
            payload,
        }
    }

    /// Mark that more records of this command follow.
    pub fn with_next(mut self, has_next: bool) -> Self {
        self.has_next = has_next;
        self
    }
}

/// One response record toward the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Command this record answers.
    pub command_id: u32,
    /// Outcome.
    pub status: CommandStatus,
    /// More response records of this command follow.
    pub has_next: bool,
    /// Response data.
    pub payload: ResponsePayload,
}

impl Response {
    /// A final success record.
    pub fn ok(command_id: u32, payload: ResponsePayload) -> Self {
        Self {
            command_id,
            status: CommandStatus::Ok,
            has_next: false,
            payload,
        }
    }

    /// A non-final success record (more follow).
    pub fn ok_more(command_id: u32, payload: ResponsePayload) -> Self {
        Self {
            command_id,
            status: CommandStatus::Ok,
            has_next: true,
            payload,
        }
    }

    /// A status-only failure record.
    pub fn error(command_id: u32, status: CommandStatus) -> Self {
        Self {
            command_id,
            status,
            has_next: false,
            payload: ResponsePayload::Empty,
        }
    }
}
