//! Host directory backend.
//!
//! Maps a backend onto a directory of the host filesystem. Used by
//! development builds that run the engine against real files instead of the
//! in-memory volume; the directory plays the role of the flash image.
//!
//! All paths are confined to the root directory: `..` components are
//! resolved before joining, so a backend-relative path can never escape.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::backend::{DirCursor, FileCursor, StorageBackend};
use crate::error::{StorageError, StorageResult};
use crate::types::{AccessMode, DirEntry, FileInfo, FsInfo, OpenMode};

fn map_io(e: io::Error, path: &str) -> StorageError {
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::not_exists(path),
        io::ErrorKind::AlreadyExists => StorageError::exists(path),
        io::ErrorKind::PermissionDenied => StorageError::denied(path),
        io::ErrorKind::DirectoryNotEmpty => StorageError::denied("directory not empty"),
        io::ErrorKind::NotADirectory | io::ErrorKind::IsADirectory => {
            StorageError::denied(path)
        }
        io::ErrorKind::InvalidInput => StorageError::InvalidParameter,
        _ => StorageError::internal(e.to_string()),
    }
}

/// Backend over a host directory.
#[derive(Debug, Clone)]
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    /// Serve files under `root`. The directory must already exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a backend-relative path inside the root.
    fn full_path(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        // Same normalization as the in-memory volume: `..` pops, it never
        // climbs above the root.
        let mut depth = 0usize;
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if depth > 0 {
                        full.pop();
                        depth -= 1;
                    }
                }
                other => {
                    full.push(other);
                    depth += 1;
                }
            }
        }
        full
    }
}

#[async_trait]
impl StorageBackend for DiskBackend {
    async fn open_file(
        &self,
        path: &str,
        access: AccessMode,
        mode: OpenMode,
    ) -> StorageResult<Box<dyn FileCursor>> {
        if !access.read && !access.write {
            return Err(StorageError::InvalidParameter);
        }
        let full = self.full_path(path);

        let mut options = fs::OpenOptions::new();
        options.read(access.read).write(access.write);
        if mode.open_always || mode.open_append {
            options.create(true);
        }
        if mode.create_new {
            options.create_new(true);
        }
        if mode.create_always {
            options.create(true);
            if access.write {
                options.truncate(true);
            }
        }

        let mut file = options.open(&full).await.map_err(|e| map_io(e, path))?;
        if mode.open_append {
            file.seek(SeekFrom::End(0))
                .await
                .map_err(|e| map_io(e, path))?;
        }

        Ok(Box::new(DiskFileCursor {
            file,
            path: path.to_string(),
        }))
    }

    async fn open_dir(&self, path: &str) -> StorageResult<Box<dyn DirCursor>> {
        let full = self.full_path(path);
        let mut reader = fs::read_dir(&full).await.map_err(|e| map_io(e, path))?;

        let mut listing = Vec::new();
        loop {
            let entry = reader.next_entry().await.map_err(|e| map_io(e, path))?;
            let Some(entry) = entry else { break };
            // Names that are not valid Unicode cannot cross the gateway.
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let meta = entry.metadata().await.map_err(|e| map_io(e, path))?;
            let info = if meta.is_dir() {
                FileInfo::directory()
            } else {
                FileInfo::file(meta.len())
            };
            listing.push(DirEntry::new(name, info));
        }
        listing.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Box::new(DiskDirCursor { listing, next: 0 }))
    }

    async fn stat(&self, path: &str) -> StorageResult<FileInfo> {
        let meta = fs::metadata(self.full_path(path))
            .await
            .map_err(|e| map_io(e, path))?;
        Ok(if meta.is_dir() {
            FileInfo::directory()
        } else {
            FileInfo::file(meta.len())
        })
    }

    async fn remove(&self, path: &str) -> StorageResult<()> {
        let full = self.full_path(path);
        if full == self.root {
            return Err(StorageError::denied("cannot remove the volume root"));
        }
        let meta = fs::metadata(&full).await.map_err(|e| map_io(e, path))?;
        if meta.is_dir() {
            fs::remove_dir(&full).await.map_err(|e| map_io(e, path))
        } else {
            fs::remove_file(&full).await.map_err(|e| map_io(e, path))
        }
    }

    async fn mkdir(&self, path: &str) -> StorageResult<()> {
        fs::create_dir(self.full_path(path))
            .await
            .map_err(|e| map_io(e, path))
    }

    async fn fs_info(&self) -> StorageResult<FsInfo> {
        // No portable free-space query; the engine's fs_info command
        // reports this as unsupported for disk-backed volumes.
        Err(StorageError::NotImplemented)
    }
}

struct DiskFileCursor {
    file: fs::File,
    path: String,
}

#[async_trait]
impl FileCursor for DiskFileCursor {
    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        let mut filled = 0;
        // A single read may return short of EOF; keep going.
        while filled < buf.len() {
            let n = self
                .file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| map_io(e, &self.path))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn write(&mut self, data: &[u8]) -> StorageResult<usize> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| map_io(e, &self.path))?;
        Ok(data.len())
    }

    async fn seek(&mut self, offset: u64, from_start: bool) -> StorageResult<u64> {
        let target = if from_start {
            SeekFrom::Start(offset)
        } else {
            SeekFrom::Current(offset as i64)
        };
        self.file
            .seek(target)
            .await
            .map_err(|e| map_io(e, &self.path))
    }

    async fn tell(&mut self) -> StorageResult<u64> {
        self.file
            .stream_position()
            .await
            .map_err(|e| map_io(e, &self.path))
    }

    async fn truncate(&mut self) -> StorageResult<()> {
        let pos = self.tell().await?;
        self.file
            .set_len(pos)
            .await
            .map_err(|e| map_io(e, &self.path))
    }

    async fn size(&mut self) -> StorageResult<u64> {
        let meta = self
            .file
            .metadata()
            .await
            .map_err(|e| map_io(e, &self.path))?;
        Ok(meta.len())
    }

    async fn sync(&mut self) -> StorageResult<()> {
        self.file
            .sync_all()
            .await
            .map_err(|e| map_io(e, &self.path))
    }

    async fn eof(&mut self) -> StorageResult<bool> {
        let pos = self.tell().await?;
        let size = self.size().await?;
        Ok(pos >= size)
    }

    async fn close(&mut self) -> StorageResult<()> {
        self.file
            .sync_all()
            .await
            .map_err(|e| map_io(e, &self.path))
    }
}

struct DiskDirCursor {
    listing: Vec<DirEntry>,
    next: usize,
}

#[async_trait]
impl DirCursor for DiskDirCursor {
    async fn read_next(&mut self) -> StorageResult<Option<DirEntry>> {
        let entry = self.listing.get(self.next).cloned();
        if entry.is_some() {
            self.next += 1;
        }
        Ok(entry)
    }

    async fn rewind(&mut self) -> StorageResult<()> {
        self.next = 0;
        Ok(())
    }

    async fn close(&mut self) -> StorageResult<()> {
        Ok(())
    }
}
