//! Synchronous call gateway.
//!
//! [`Storage`] is the client-facing handle: every method builds one command,
//! enqueues it with an indefinitely blocking send, awaits the per-call reply
//! and returns the result. Concurrent callers serialize through the bounded
//! queue with backpressure; nobody ever sees a "busy" error from saturation.
//!
//! Open calls add one wrinkle: when the path is already held by another
//! handle, the open is retried after the next handle-close event instead of
//! surfacing `AlreadyOpen` to the caller. The wait is intentionally
//! unbounded. Do not add a timeout here; callers that need a bound must
//! impose their own deadline.

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::engine::StorageCommand;
use crate::error::{StorageError, StorageResult};
use crate::events::{EventBus, StorageEvent};
use crate::registry::HandleId;
use crate::types::{
    AccessMode, CardInfo, DirEntry, FileInfo, FsInfo, OpenMode, StorageStatus,
};

fn engine_gone() -> StorageError {
    StorageError::internal("storage engine stopped")
}

/// Cloneable gateway to the storage engine.
#[derive(Clone)]
pub struct Storage {
    tx: mpsc::Sender<StorageCommand>,
    events: EventBus,
    pub(crate) copy_buffer_len: usize,
}

impl Storage {
    pub(crate) fn new(
        tx: mpsc::Sender<StorageCommand>,
        events: EventBus,
        copy_buffer_len: usize,
    ) -> Self {
        Self {
            tx,
            events,
            copy_buffer_len,
        }
    }

    /// Subscribe to engine events (mounts, unmounts, handle closes).
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    async fn call<T>(
        &self,
        command: StorageCommand,
        rx: oneshot::Receiver<StorageResult<T>>,
    ) -> StorageResult<T> {
        self.tx.send(command).await.map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    // ── Files ────────────────────────────────────────────────────────────

    async fn open_file_once(
        &self,
        path: &str,
        access: AccessMode,
        mode: OpenMode,
    ) -> StorageResult<HandleId> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StorageCommand::FileOpen {
                path: path.to_string(),
                access,
                mode,
                reply,
            },
            rx,
        )
        .await
    }

    /// Open a file, waiting out contention.
    ///
    /// If another handle holds the path, this blocks until that handle
    /// closes and then retries the whole open, indefinitely. `AlreadyOpen`
    /// is never returned to the caller.
    pub async fn open_file(
        &self,
        path: &str,
        access: AccessMode,
        mode: OpenMode,
    ) -> StorageResult<File> {
        let mut closes = self.events.subscribe();
        loop {
            match self.open_file_once(path, access, mode).await {
                Err(StorageError::AlreadyOpen(_)) => {
                    self.wait_for_close(&mut closes).await?;
                }
                Ok(id) => {
                    return Ok(File {
                        id,
                        storage: self.clone(),
                        closed: false,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Open a directory, waiting out contention the same way
    /// [`open_file`](Self::open_file) does.
    pub async fn open_dir(&self, path: &str) -> StorageResult<Dir> {
        let mut closes = self.events.subscribe();
        loop {
            let (reply, rx) = oneshot::channel();
            let result = self
                .call(
                    StorageCommand::DirOpen {
                        path: path.to_string(),
                        reply,
                    },
                    rx,
                )
                .await;
            match result {
                Err(StorageError::AlreadyOpen(_)) => {
                    self.wait_for_close(&mut closes).await?;
                }
                Ok(id) => {
                    return Ok(Dir {
                        id,
                        storage: self.clone(),
                        closed: false,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn wait_for_close(
        &self,
        closes: &mut broadcast::Receiver<StorageEvent>,
    ) -> StorageResult<()> {
        loop {
            match closes.recv().await {
                Ok(StorageEvent::FileClosed | StorageEvent::DirClosed) => return Ok(()),
                Ok(_) => continue,
                // Missed events: something closed, retry anyway.
                Err(broadcast::error::RecvError::Lagged(_)) => return Ok(()),
                Err(broadcast::error::RecvError::Closed) => return Err(engine_gone()),
            }
        }
    }

    // ── Common operations ────────────────────────────────────────────────

    /// Get metadata for a path.
    pub async fn stat(&self, path: &str) -> StorageResult<FileInfo> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StorageCommand::CommonStat {
                path: path.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Remove a file or an empty directory.
    pub async fn remove(&self, path: &str) -> StorageResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StorageCommand::CommonRemove {
                path: path.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Create a directory.
    pub async fn mkdir(&self, path: &str) -> StorageResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StorageCommand::CommonMkdir {
                path: path.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Total and free space of the filesystem holding `path`.
    pub async fn fs_info(&self, path: &str) -> StorageResult<FsInfo> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StorageCommand::CommonFsInfo {
                path: path.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Change marker of the backend holding `path`. Compare two readings to
    /// detect modification in between.
    pub async fn timestamp(&self, path: &str) -> StorageResult<u64> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StorageCommand::CommonTimestamp {
                path: path.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Rewrite application aliases (`/data`, `/assets`) to the per-app
    /// location, creating the data directory chain when asked to.
    pub async fn resolve_path(
        &self,
        path: &str,
        app_id: &str,
        create_folders: bool,
    ) -> StorageResult<String> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StorageCommand::CommonResolvePath {
                path: path.to_string(),
                app_id: app_id.to_string(),
                create_folders,
                reply,
            },
            rx,
        )
        .await
    }

    /// True when the path exists.
    pub async fn exists(&self, path: &str) -> bool {
        self.stat(path).await.is_ok()
    }

    /// True when the path exists and is a regular file.
    pub async fn file_exists(&self, path: &str) -> bool {
        matches!(self.stat(path).await, Ok(info) if info.is_file())
    }

    /// True when the path exists and is a directory.
    pub async fn dir_exists(&self, path: &str) -> bool {
        matches!(self.stat(path).await, Ok(info) if info.is_dir())
    }

    // ── Removable media ──────────────────────────────────────────────────

    /// Mount a present card, e.g. after an explicit unmount.
    pub async fn card_mount(&self) -> StorageResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(StorageCommand::CardMount { reply }, rx).await
    }

    /// Recreate the filesystem on the card.
    pub async fn card_format(&self) -> StorageResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(StorageCommand::CardFormat { reply }, rx).await
    }

    /// Unmount the card until it is reinserted.
    pub async fn card_unmount(&self) -> StorageResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(StorageCommand::CardUnmount { reply }, rx).await
    }

    /// Identity and capacity of the mounted card.
    pub async fn card_info(&self) -> StorageResult<CardInfo> {
        let (reply, rx) = oneshot::channel();
        self.call(StorageCommand::CardInfo { reply }, rx).await
    }

    /// Current card health.
    pub async fn card_status(&self) -> StorageResult<StorageStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StorageCommand::CardStatus { reply })
            .await
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())
    }

    // ── Handle plumbing ──────────────────────────────────────────────────

    async fn close_file(&self, id: HandleId) -> StorageResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(StorageCommand::FileClose { id, reply }, rx).await
    }

    async fn close_dir(&self, id: HandleId) -> StorageResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(StorageCommand::DirClose { id, reply }, rx).await
    }

    fn close_in_background(&self, command: StorageCommand) {
        // Drop cannot block on a full queue; a lost close leaks the handle
        // and keeps its path locked.
        if self.tx.try_send(command).is_err() {
            tracing::warn!("handle leaked: close command could not be queued");
        }
    }
}

/// An open file handle. Explicitly [`close`](File::close) it to observe the
/// close result; dropping enqueues a best-effort close.
pub struct File {
    id: HandleId,
    storage: Storage,
    closed: bool,
}

impl File {
    /// Read up to `max_len` bytes at the cursor. A short (or empty) result
    /// means end of file.
    pub async fn read(&mut self, max_len: usize) -> StorageResult<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.storage
            .call(
                StorageCommand::FileRead {
                    id: self.id,
                    max_len,
                    reply,
                },
                rx,
            )
            .await
    }

    /// Write all of `data` at the cursor. Returns bytes written.
    pub async fn write(&mut self, data: &[u8]) -> StorageResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.storage
            .call(
                StorageCommand::FileWrite {
                    id: self.id,
                    data: data.to_vec(),
                    reply,
                },
                rx,
            )
            .await
    }

    /// Move the cursor; absolute when `from_start`, else forward-relative.
    pub async fn seek(&mut self, offset: u64, from_start: bool) -> StorageResult<u64> {
        let (reply, rx) = oneshot::channel();
        self.storage
            .call(
                StorageCommand::FileSeek {
                    id: self.id,
                    offset,
                    from_start,
                    reply,
                },
                rx,
            )
            .await
    }

    /// Current cursor position.
    pub async fn tell(&mut self) -> StorageResult<u64> {
        let (reply, rx) = oneshot::channel();
        self.storage
            .call(StorageCommand::FileTell { id: self.id, reply }, rx)
            .await
    }

    /// Truncate the file at the cursor position.
    pub async fn truncate(&mut self) -> StorageResult<()> {
        let (reply, rx) = oneshot::channel();
        self.storage
            .call(StorageCommand::FileTruncate { id: self.id, reply }, rx)
            .await
    }

    /// Current file size.
    pub async fn size(&mut self) -> StorageResult<u64> {
        let (reply, rx) = oneshot::channel();
        self.storage
            .call(StorageCommand::FileSize { id: self.id, reply }, rx)
            .await
    }

    /// Flush pending writes.
    pub async fn sync(&mut self) -> StorageResult<()> {
        let (reply, rx) = oneshot::channel();
        self.storage
            .call(StorageCommand::FileSync { id: self.id, reply }, rx)
            .await
    }

    /// True at or past end of file.
    pub async fn eof(&mut self) -> StorageResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.storage
            .call(StorageCommand::FileEof { id: self.id, reply }, rx)
            .await
    }

    /// Close the handle, releasing the path for other openers.
    pub async fn close(mut self) -> StorageResult<()> {
        self.closed = true;
        self.storage.close_file(self.id).await
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if !self.closed {
            let (reply, _) = oneshot::channel();
            self.storage
                .close_in_background(StorageCommand::FileClose { id: self.id, reply });
        }
    }
}

/// An open directory handle.
pub struct Dir {
    id: HandleId,
    storage: Storage,
    closed: bool,
}

impl Dir {
    /// Next entry, or `None` when the directory is exhausted.
    pub async fn read(&mut self) -> StorageResult<Option<DirEntry>> {
        let (reply, rx) = oneshot::channel();
        self.storage
            .call(StorageCommand::DirRead { id: self.id, reply }, rx)
            .await
    }

    /// Restart iteration from the first entry.
    pub async fn rewind(&mut self) -> StorageResult<()> {
        let (reply, rx) = oneshot::channel();
        self.storage
            .call(StorageCommand::DirRewind { id: self.id, reply }, rx)
            .await
    }

    /// Close the handle, releasing the path for other openers.
    pub async fn close(mut self) -> StorageResult<()> {
        self.closed = true;
        self.storage.close_dir(self.id).await
    }
}

impl Drop for Dir {
    fn drop(&mut self) {
        if !self.closed {
            let (reply, _) = oneshot::channel();
            self.storage
                .close_in_background(StorageCommand::DirClose { id: self.id, reply });
        }
    }
}
