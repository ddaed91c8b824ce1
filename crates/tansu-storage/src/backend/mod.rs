//! Backend driver interface.
//!
//! A backend is one physical storage medium behind the engine. The engine
//! never touches media directly: it goes through [`StorageBackend`] and the
//! cursor traits, so a hardware port only has to supply these three objects.
//!
//! Paths handed to a backend are always backend-relative: the virtual prefix
//! has already been stripped by the router.

pub mod disk;
pub mod memory;
pub mod removable;

pub use disk::DiskBackend;
pub use memory::MemoryBackend;
pub use removable::{MediaSlot, MountAttempt, RemovableBackend, SimCard, SimulatedSlot};

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::types::{AccessMode, DirEntry, FileInfo, FsInfo, OpenMode, StorageStatus};

/// Filesystem operations of one backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Open a file, producing a positioned cursor.
    async fn open_file(
        &self,
        path: &str,
        access: AccessMode,
        mode: OpenMode,
    ) -> StorageResult<Box<dyn FileCursor>>;

    /// Open a directory for iteration.
    async fn open_dir(&self, path: &str) -> StorageResult<Box<dyn DirCursor>>;

    /// Get metadata for a path.
    async fn stat(&self, path: &str) -> StorageResult<FileInfo>;

    /// Remove a file or an empty directory.
    async fn remove(&self, path: &str) -> StorageResult<()>;

    /// Create a directory. The parent must already exist.
    async fn mkdir(&self, path: &str) -> StorageResult<()>;

    /// Report total and free space.
    async fn fs_info(&self) -> StorageResult<FsInfo>;

    /// Current health. Backends without a media lifecycle are always `Ok`.
    fn status(&self) -> StorageStatus {
        StorageStatus::Ok
    }
}

/// An open file: a byte cursor over one path.
#[async_trait]
pub trait FileCursor: Send {
    /// Read up to `buf.len()` bytes at the cursor, advancing it.
    /// Returns the number of bytes read; fewer than requested means EOF.
    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize>;

    /// Write `data` at the cursor, advancing it. Returns bytes written.
    async fn write(&mut self, data: &[u8]) -> StorageResult<usize>;

    /// Move the cursor. `from_start` seeks absolute, otherwise forward
    /// relative to the current position. Returns the new position.
    async fn seek(&mut self, offset: u64, from_start: bool) -> StorageResult<u64>;

    /// Current cursor position.
    async fn tell(&mut self) -> StorageResult<u64>;

    /// Truncate the file at the current cursor position.
    async fn truncate(&mut self) -> StorageResult<()>;

    /// Current file size.
    async fn size(&mut self) -> StorageResult<u64>;

    /// Flush pending writes to the medium.
    async fn sync(&mut self) -> StorageResult<()>;

    /// True when the cursor sits at or past end of file.
    async fn eof(&mut self) -> StorageResult<bool>;

    /// Release the cursor. Called exactly once by the engine.
    async fn close(&mut self) -> StorageResult<()>;
}

/// An open directory iterator.
#[async_trait]
pub trait DirCursor: Send {
    /// Next entry, or `None` when the directory is exhausted.
    async fn read_next(&mut self) -> StorageResult<Option<DirEntry>>;

    /// Restart iteration from the first entry.
    async fn rewind(&mut self) -> StorageResult<()>;

    /// Release the cursor. Called exactly once by the engine.
    async fn close(&mut self) -> StorageResult<()>;
}
