//! In-memory backend.
//!
//! Backs the internal flash volume and the simulated card volumes. All data
//! is ephemeral. Cursor state lives in the cursor object itself, so several
//! cursors over different paths can coexist; path exclusivity is enforced a
//! level up by the open-handle registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::backend::{DirCursor, FileCursor, StorageBackend};
use crate::error::{StorageError, StorageResult};
use crate::types::{AccessMode, DirEntry, FileInfo, FsInfo, OpenMode};

#[derive(Debug, Clone)]
enum MemEntry {
    File(Vec<u8>),
    Directory,
}

#[derive(Debug)]
struct VolumeInner {
    entries: RwLock<HashMap<String, MemEntry>>,
    capacity: u64,
}

/// In-memory filesystem volume.
///
/// Cloning is cheap and shares the same volume.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<VolumeInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Default volume capacity: 16 MiB.
    pub const DEFAULT_CAPACITY: u64 = 16 * 1024 * 1024;

    /// Create an empty volume with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create an empty volume with an explicit byte capacity.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            inner: Arc::new(VolumeInner {
                entries: RwLock::new(HashMap::new()),
                capacity,
            }),
        }
    }

    /// Normalize a backend-relative path: strip leading slashes, resolve
    /// `.` and `..`. The empty string is the volume root.
    fn normalize(path: &str) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other),
            }
        }
        parts.join("/")
    }

    fn parent_of(path: &str) -> &str {
        match path.rfind('/') {
            Some(idx) => &path[..idx],
            None => "",
        }
    }

    fn used_bytes(entries: &HashMap<String, MemEntry>) -> u64 {
        entries
            .values()
            .map(|e| match e {
                MemEntry::File(data) => data.len() as u64,
                MemEntry::Directory => 0,
            })
            .sum()
    }

    fn parent_exists(entries: &HashMap<String, MemEntry>, path: &str) -> bool {
        let parent = Self::parent_of(path);
        parent.is_empty() || matches!(entries.get(parent), Some(MemEntry::Directory))
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn open_file(
        &self,
        path: &str,
        access: AccessMode,
        mode: OpenMode,
    ) -> StorageResult<Box<dyn FileCursor>> {
        if !access.read && !access.write {
            return Err(StorageError::InvalidParameter);
        }

        let norm = Self::normalize(path);
        if norm.is_empty() {
            return Err(StorageError::denied("cannot open a directory as a file"));
        }

        let mut entries = self.inner.entries.write();
        let pos = match entries.get_mut(&norm) {
            Some(MemEntry::Directory) => {
                return Err(StorageError::denied("cannot open a directory as a file"));
            }
            Some(MemEntry::File(data)) => {
                if mode.create_new {
                    return Err(StorageError::exists(&norm));
                }
                if mode.create_always {
                    data.clear();
                }
                if mode.open_append {
                    data.len() as u64
                } else {
                    0
                }
            }
            None => {
                let creates = mode.open_always
                    || mode.open_append
                    || mode.create_new
                    || mode.create_always;
                if !creates {
                    return Err(StorageError::not_exists(&norm));
                }
                if !Self::parent_exists(&entries, &norm) {
                    return Err(StorageError::not_exists(&norm));
                }
                entries.insert(norm.clone(), MemEntry::File(Vec::new()));
                0
            }
        };
        drop(entries);

        Ok(Box::new(MemFileCursor {
            inner: Arc::clone(&self.inner),
            path: norm,
            pos,
            access,
        }))
    }

    async fn open_dir(&self, path: &str) -> StorageResult<Box<dyn DirCursor>> {
        let norm = Self::normalize(path);
        let entries = self.inner.entries.read();

        if !norm.is_empty() {
            match entries.get(&norm) {
                Some(MemEntry::Directory) => {}
                Some(MemEntry::File(_)) => {
                    return Err(StorageError::denied("not a directory"));
                }
                None => return Err(StorageError::not_exists(&norm)),
            }
        }

        let mut listing: Vec<DirEntry> = entries
            .iter()
            .filter(|(p, _)| {
                Self::parent_of(p) == norm && !p.is_empty() && p.as_str() != norm
            })
            .map(|(p, e)| {
                let name = p.rsplit('/').next().unwrap_or(p).to_string();
                let info = match e {
                    MemEntry::File(data) => FileInfo::file(data.len() as u64),
                    MemEntry::Directory => FileInfo::directory(),
                };
                DirEntry::new(name, info)
            })
            .collect();
        listing.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Box::new(MemDirCursor { listing, next: 0 }))
    }

    async fn stat(&self, path: &str) -> StorageResult<FileInfo> {
        let norm = Self::normalize(path);
        if norm.is_empty() {
            return Ok(FileInfo::directory());
        }
        let entries = self.inner.entries.read();
        match entries.get(&norm) {
            Some(MemEntry::File(data)) => Ok(FileInfo::file(data.len() as u64)),
            Some(MemEntry::Directory) => Ok(FileInfo::directory()),
            None => Err(StorageError::not_exists(&norm)),
        }
    }

    async fn remove(&self, path: &str) -> StorageResult<()> {
        let norm = Self::normalize(path);
        if norm.is_empty() {
            return Err(StorageError::denied("cannot remove the volume root"));
        }
        let mut entries = self.inner.entries.write();
        match entries.get(&norm) {
            Some(MemEntry::Directory) => {
                let has_children = entries.keys().any(|p| Self::parent_of(p) == norm);
                if has_children {
                    return Err(StorageError::denied("directory not empty"));
                }
                entries.remove(&norm);
                Ok(())
            }
            Some(MemEntry::File(_)) => {
                entries.remove(&norm);
                Ok(())
            }
            None => Err(StorageError::not_exists(&norm)),
        }
    }

    async fn mkdir(&self, path: &str) -> StorageResult<()> {
        let norm = Self::normalize(path);
        if norm.is_empty() {
            return Err(StorageError::exists("/"));
        }
        let mut entries = self.inner.entries.write();
        if entries.contains_key(&norm) {
            return Err(StorageError::exists(&norm));
        }
        if !Self::parent_exists(&entries, &norm) {
            return Err(StorageError::not_exists(&norm));
        }
        entries.insert(norm, MemEntry::Directory);
        Ok(())
    }

    async fn fs_info(&self) -> StorageResult<FsInfo> {
        let entries = self.inner.entries.read();
        let used = Self::used_bytes(&entries);
        Ok(FsInfo {
            total_space: self.inner.capacity,
            free_space: self.inner.capacity.saturating_sub(used),
        })
    }
}

struct MemFileCursor {
    inner: Arc<VolumeInner>,
    path: String,
    pos: u64,
    access: AccessMode,
}

#[async_trait]
impl FileCursor for MemFileCursor {
    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        if !self.access.read {
            return Err(StorageError::denied("handle not opened for reading"));
        }
        let entries = self.inner.entries.read();
        let data = match entries.get(&self.path) {
            Some(MemEntry::File(data)) => data,
            _ => return Err(StorageError::not_exists(&self.path)),
        };
        let start = (self.pos as usize).min(data.len());
        let end = (start + buf.len()).min(data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&data[start..end]);
        drop(entries);
        self.pos += n as u64;
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> StorageResult<usize> {
        if !self.access.write {
            return Err(StorageError::denied("handle not opened for writing"));
        }
        let mut entries = self.inner.entries.write();
        let used = MemoryBackend::used_bytes(&entries);
        let file = match entries.get_mut(&self.path) {
            Some(MemEntry::File(file)) => file,
            _ => return Err(StorageError::not_exists(&self.path)),
        };
        let end = self.pos as usize + data.len();
        let growth = end.saturating_sub(file.len()) as u64;
        if used + growth > self.inner.capacity {
            return Err(StorageError::denied("no space left on volume"));
        }
        if end > file.len() {
            file.resize(end, 0);
        }
        file[self.pos as usize..end].copy_from_slice(data);
        drop(entries);
        self.pos = end as u64;
        Ok(data.len())
    }

    async fn seek(&mut self, offset: u64, from_start: bool) -> StorageResult<u64> {
        self.pos = if from_start {
            offset
        } else {
            self.pos.saturating_add(offset)
        };
        Ok(self.pos)
    }

    async fn tell(&mut self) -> StorageResult<u64> {
        Ok(self.pos)
    }

    async fn truncate(&mut self) -> StorageResult<()> {
        if !self.access.write {
            return Err(StorageError::denied("handle not opened for writing"));
        }
        let mut entries = self.inner.entries.write();
        match entries.get_mut(&self.path) {
            Some(MemEntry::File(file)) => {
                file.truncate(self.pos as usize);
                Ok(())
            }
            _ => Err(StorageError::not_exists(&self.path)),
        }
    }

    async fn size(&mut self) -> StorageResult<u64> {
        let entries = self.inner.entries.read();
        match entries.get(&self.path) {
            Some(MemEntry::File(file)) => Ok(file.len() as u64),
            _ => Err(StorageError::not_exists(&self.path)),
        }
    }

    async fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    async fn eof(&mut self) -> StorageResult<bool> {
        let size = self.size().await?;
        Ok(self.pos >= size)
    }

    async fn close(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

struct MemDirCursor {
    listing: Vec<DirEntry>,
    next: usize,
}

#[async_trait]
impl DirCursor for MemDirCursor {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_write_read() {
        let fs = MemoryBackend::new();
        let mut f = fs
            .open_file("test.txt", AccessMode::read_write(), OpenMode::create_always())
            .await
            .unwrap();
        f.write(b"hello world").await.unwrap();
        f.seek(0, true).await.unwrap();

        let mut buf = [0u8; 64];
        let n = f.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[tokio::test]
    async fn test_open_existing_missing() {
        let fs = MemoryBackend::new();
        let err = fs
            .open_file("nope.txt", AccessMode::read(), OpenMode::open_existing())
            .await
            .err().unwrap();
        assert!(matches!(err, StorageError::NotExists(_)));
    }

    #[tokio::test]
    async fn test_create_new_collision() {
        let fs = MemoryBackend::new();
        fs.open_file("a.txt", AccessMode::write(), OpenMode::create_new())
            .await
            .unwrap();
        let err = fs
            .open_file("a.txt", AccessMode::write(), OpenMode::create_new())
            .await
            .err().unwrap();
        assert!(matches!(err, StorageError::Exists(_)));
    }

    #[tokio::test]
    async fn test_create_always_truncates() {
        let fs = MemoryBackend::new();
        let mut f = fs
            .open_file("t.txt", AccessMode::write(), OpenMode::create_always())
            .await
            .unwrap();
        f.write(b"0123456789").await.unwrap();
        f.close().await.unwrap();

        let mut f = fs
            .open_file("t.txt", AccessMode::write(), OpenMode::create_always())
            .await
            .unwrap();
        assert_eq!(f.size().await.unwrap(), 0);
        f.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_append_position() {
        let fs = MemoryBackend::new();
        let mut f = fs
            .open_file("log.txt", AccessMode::write(), OpenMode::create_always())
            .await
            .unwrap();
        f.write(b"one").await.unwrap();
        f.close().await.unwrap();

        let mut f = fs
            .open_file("log.txt", AccessMode::write(), OpenMode::open_append())
            .await
            .unwrap();
        assert_eq!(f.tell().await.unwrap(), 3);
        f.write(b"two").await.unwrap();
        assert_eq!(f.size().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_parent_must_exist() {
        let fs = MemoryBackend::new();
        let err = fs
            .open_file("no/dir/file.txt", AccessMode::write(), OpenMode::create_always())
            .await
            .err().unwrap();
        assert!(matches!(err, StorageError::NotExists(_)));

        let err = fs.mkdir("no/dir").await.err().unwrap();
        assert!(matches!(err, StorageError::NotExists(_)));
    }

    #[tokio::test]
    async fn test_read_only_handle_denies_write() {
        let fs = MemoryBackend::new();
        fs.open_file("r.txt", AccessMode::write(), OpenMode::create_always())
            .await
            .unwrap();
        let mut f = fs
            .open_file("r.txt", AccessMode::read(), OpenMode::open_existing())
            .await
            .unwrap();
        let err = f.write(b"x").await.err().unwrap();
        assert!(matches!(err, StorageError::Denied(_)));
    }

    #[tokio::test]
    async fn test_dir_iteration_sorted() {
        let fs = MemoryBackend::new();
        fs.mkdir("d").await.unwrap();
        for name in ["d/c.txt", "d/a.txt", "d/b.txt"] {
            fs.open_file(name, AccessMode::write(), OpenMode::create_always())
                .await
                .unwrap();
        }

        let mut dir = fs.open_dir("d").await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = dir.read_next().await.unwrap() {
            names.push(entry.name);
        }
        assert_eq!(names, ["a.txt", "b.txt", "c.txt"]);

        dir.rewind().await.unwrap();
        assert_eq!(dir.read_next().await.unwrap().unwrap().name, "a.txt");
    }

    #[tokio::test]
    async fn test_remove_non_empty_dir_denied() {
        let fs = MemoryBackend::new();
        fs.mkdir("d").await.unwrap();
        fs.open_file("d/f.txt", AccessMode::write(), OpenMode::create_always())
            .await
            .unwrap();

        let err = fs.remove("d").await.err().unwrap();
        assert!(matches!(err, StorageError::Denied(_)));

        fs.remove("d/f.txt").await.unwrap();
        fs.remove("d").await.unwrap();
        assert!(matches!(
            fs.stat("d").await.unwrap_err(),
            StorageError::NotExists(_)
        ));
    }

    #[tokio::test]
    async fn test_fs_info_accounts_for_data() {
        let fs = MemoryBackend::with_capacity(1024);
        let mut f = fs
            .open_file("f.bin", AccessMode::write(), OpenMode::create_always())
            .await
            .unwrap();
        f.write(&[0xAA; 100]).await.unwrap();

        let info = fs.fs_info().await.unwrap();
        assert_eq!(info.total_space, 1024);
        assert_eq!(info.free_space, 924);
    }

    #[tokio::test]
    async fn test_volume_full() {
        let fs = MemoryBackend::with_capacity(8);
        let mut f = fs
            .open_file("f.bin", AccessMode::write(), OpenMode::create_always())
            .await
            .unwrap();
        let err = f.write(&[0u8; 16]).await.err().unwrap();
        assert!(matches!(err, StorageError::Denied(_)));
    }
}
