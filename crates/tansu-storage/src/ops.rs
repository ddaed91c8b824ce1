//! Recursive operations built on the single-entry primitives.
//!
//! Everything here runs at the gateway level: each step is an ordinary
//! command through the dispatcher, so these functions interleave fairly
//! with other callers instead of monopolizing the engine.

use crate::error::{StorageError, StorageResult};
use crate::storage::{Dir, Storage};
use crate::types::{AccessMode, FileInfo, OpenMode};

/// Depth-first directory walker over gateway handles.
///
/// Yields each entry's full virtual path and metadata. Directories are
/// yielded before their contents. In non-recursive mode only the immediate
/// children of the opened directory are yielded.
pub struct DirWalk {
    storage: Storage,
    recursive: bool,
    stack: Vec<WalkLevel>,
}

struct WalkLevel {
    path: String,
    dir: Dir,
}

impl DirWalk {
    /// New recursive walker.
    pub fn new(storage: &Storage) -> Self {
        Self {
            storage: storage.clone(),
            recursive: true,
            stack: Vec::new(),
        }
    }

    /// Toggle descending into subdirectories.
    pub fn set_recursive(&mut self, recursive: bool) {
        self.recursive = recursive;
    }

    /// Start walking at `path`.
    pub async fn open(&mut self, path: &str) -> StorageResult<()> {
        let dir = self.storage.open_dir(path).await?;
        self.stack = vec![WalkLevel {
            path: path.trim_end_matches('/').to_string(),
            dir,
        }];
        Ok(())
    }

    /// Next entry, or `None` when the walk is done.
    pub async fn read(&mut self) -> StorageResult<Option<(String, FileInfo)>> {
        loop {
            if self.stack.is_empty() {
                return Ok(None);
            }

            let entry = {
                let level = self.stack.last_mut().expect("stack not empty");
                match level.dir.read().await {
                    Ok(entry) => entry,
                    Err(e) => {
                        self.close().await;
                        return Err(e);
                    }
                }
            };

            match entry {
                Some(entry) => {
                    let parent = &self.stack.last().expect("stack not empty").path;
                    let full = format!("{parent}/{}", entry.name);
                    if entry.info.is_dir() && self.recursive {
                        match self.storage.open_dir(&full).await {
                            Ok(dir) => self.stack.push(WalkLevel {
                                path: full.clone(),
                                dir,
                            }),
                            Err(e) => {
                                self.close().await;
                                return Err(e);
                            }
                        }
                    }
                    return Ok(Some((full, entry.info)));
                }
                None => {
                    let level = self.stack.pop().expect("stack not empty");
                    let _ = level.dir.close().await;
                }
            }
        }
    }

    /// Release any directories still held by the walk.
    pub async fn close(&mut self) {
        while let Some(level) = self.stack.pop() {
            let _ = level.dir.close().await;
        }
    }
}

impl Storage {
    // ── Copy / merge / rename ────────────────────────────────────────────

    /// Copy a file or a whole directory tree. Fails with `Exists` when a
    /// destination file is already present.
    pub async fn copy(&self, old_path: &str, new_path: &str) -> StorageResult<()> {
        let info = self.stat(old_path).await?;
        if info.is_dir() {
            self.copy_tree(old_path, new_path).await
        } else {
            self.copy_file(old_path, new_path).await
        }
    }

    async fn copy_tree(&self, old_path: &str, new_path: &str) -> StorageResult<()> {
        self.mkdir(new_path).await?;

        let mut walk = DirWalk::new(self);
        walk.open(old_path).await?;
        loop {
            let Some((path, info)) = walk.read().await? else {
                break;
            };
            let target = format!("{new_path}{}", &path[old_path.len()..]);
            let step = if info.is_dir() {
                self.mkdir(&target).await
            } else {
                self.copy_file(&path, &target).await
            };
            if let Err(e) = step {
                walk.close().await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn copy_file(&self, old_path: &str, new_path: &str) -> StorageResult<()> {
        let mut src = self
            .open_file(old_path, AccessMode::read(), OpenMode::open_existing())
            .await?;
        let dst = self
            .open_file(new_path, AccessMode::write(), OpenMode::create_new())
            .await;
        let mut dst = match dst {
            Ok(dst) => dst,
            Err(e) => {
                let _ = src.close().await;
                return Err(e);
            }
        };

        let mut result = Ok(());
        loop {
            let chunk = match src.read(self.copy_buffer_len).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            if chunk.is_empty() {
                break;
            }
            if let Err(e) = dst.write(&chunk).await {
                result = Err(e);
                break;
            }
        }

        let _ = src.close().await;
        let _ = dst.close().await;
        result
    }

    /// Copy like [`copy`](Self::copy), but on a destination file collision
    /// pick a non-colliding sibling name (numeric suffix before the
    /// extension) instead of failing.
    pub async fn merge(&self, old_path: &str, new_path: &str) -> StorageResult<()> {
        // Iterative worklist instead of recursion: each item is one
        // (source, destination) pair still to merge.
        let mut pending = vec![(old_path.to_string(), new_path.to_string())];

        while let Some((src, dst)) = pending.pop() {
            let info = self.stat(&src).await?;

            if info.is_dir() {
                self.ensure_dir(&dst).await?;

                let mut walk = DirWalk::new(self);
                walk.set_recursive(false);
                walk.open(&src).await?;
                let mut children = Vec::new();
                loop {
                    match walk.read().await {
                        Ok(Some((child, _))) => children.push(child),
                        Ok(None) => break,
                        Err(e) => {
                            walk.close().await;
                            return Err(e);
                        }
                    }
                }

                for child in children {
                    let base = child.rsplit('/').next().expect("walk yields names");
                    pending.push((child.clone(), format!("{dst}/{base}")));
                }
            } else {
                let target = if self.exists(&dst).await {
                    self.next_free_path(&dst).await?
                } else {
                    dst
                };
                self.copy_file(&src, &target).await?;
            }
        }
        Ok(())
    }

    /// Move by copy-then-remove. Not a backend-level atomic rename.
    ///
    /// Known limitation kept from the original behavior: renaming a
    /// directory into its own subtree is not guarded against and will not
    /// terminate sensibly; callers must reject that case themselves.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> StorageResult<()> {
        self.copy(old_path, new_path).await?;
        self.remove_recursive(old_path)
            .await
            .map_err(|_| StorageError::internal("could not remove rename source"))
    }

    /// Merge `source` into `dest`, then drop `source`. A missing source is
    /// a no-op.
    pub async fn migrate(&self, source: &str, dest: &str) -> StorageResult<()> {
        if !self.exists(source).await {
            return Ok(());
        }
        self.merge(source, dest).await?;
        let _ = self.remove_recursive(source).await;
        Ok(())
    }

    // ── Removal ──────────────────────────────────────────────────────────

    /// Remove a file or directory tree. Succeeds when the target is gone by
    /// the end, including when it never existed.
    pub async fn remove_recursive(&self, path: &str) -> StorageResult<()> {
        match self.remove(path).await {
            Ok(()) | Err(StorageError::NotExists(_)) => return Ok(()),
            // Likely a non-empty directory; walk it.
            Err(_) => {}
        }

        // Depth-first with one mutable current-directory buffer: descend
        // into the first subdirectory found, remove files as encountered,
        // ascend by trimming back to the parent.
        let mut cur_dir = path.to_string();
        loop {
            let mut dir = self.open_dir(&cur_dir).await?;
            let mut go_deeper = false;

            loop {
                let entry = match dir.read().await {
                    Ok(entry) => entry,
                    Err(e) => {
                        let _ = dir.close().await;
                        return Err(e);
                    }
                };
                let Some(entry) = entry else {
                    break;
                };

                if entry.info.is_dir() {
                    cur_dir.push('/');
                    cur_dir.push_str(&entry.name);
                    go_deeper = true;
                    break;
                }

                let full = format!("{cur_dir}/{}", entry.name);
                if let Err(e) = self.remove(&full).await {
                    let _ = dir.close().await;
                    return Err(e);
                }
            }
            dir.close().await?;

            if go_deeper {
                continue;
            }

            self.remove(&cur_dir).await?;
            if cur_dir == path {
                return Ok(());
            }
            let parent_len = cur_dir.rfind('/').unwrap_or(0);
            cur_dir.truncate(parent_len);
        }
    }

    /// True when the directory has no entries.
    pub async fn dir_is_empty(&self, path: &str) -> StorageResult<bool> {
        let mut dir = self.open_dir(path).await?;
        let first = dir.read().await;
        let _ = dir.close().await;
        Ok(first?.is_none())
    }

    /// Create a directory, tolerating one that already exists.
    pub async fn ensure_dir(&self, path: &str) -> StorageResult<()> {
        match self.mkdir(path).await {
            Ok(()) | Err(StorageError::Exists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── Free-name search ─────────────────────────────────────────────────

    /// Find the first `filename`, `filename1`, `filename2`, … (extension
    /// appended) that does not exist in `dirname`. Returns the name without
    /// the extension.
    pub async fn next_file_name(
        &self,
        dirname: &str,
        filename: &str,
        extension: &str,
    ) -> StorageResult<String> {
        let mut num = 0u32;
        let mut candidate = format!("{dirname}/{filename}{extension}");
        while self.exists(&candidate).await {
            num += 1;
            candidate = format!("{dirname}/{filename}{num}{extension}");
        }
        Ok(if num == 0 {
            filename.to_string()
        } else {
            format!("{filename}{num}")
        })
    }

    async fn next_free_path(&self, path: &str) -> StorageResult<String> {
        let (dirname, basename) = match path.rfind('/') {
            Some(idx) => (&path[..idx], &path[idx + 1..]),
            None => ("", path),
        };
        let (stem, extension) = match basename.rfind('.') {
            Some(idx) => (&basename[..idx], &basename[idx..]),
            None => (basename, ""),
        };
        let name = self.next_file_name(dirname, stem, extension).await?;
        Ok(format!("{dirname}/{name}{extension}"))
    }
}
