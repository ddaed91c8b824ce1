//! Command dispatcher.
//!
//! Exactly one task owns every backend, the open-handle registry and the
//! routing decision. Commands arrive over a bounded channel and are executed
//! end to end, strictly in enqueue order; the per-call oneshot reply releases
//! the waiting gateway caller. When the queue goes idle the dispatcher runs
//! the removable-media lifecycle tick instead.
//!
//! Single ownership is what makes the registry race-free: no other task ever
//! reads or writes it, so there is no lock to take and no window between the
//! exclusivity check and the driver open.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::backend::{
    DirCursor, FileCursor, MediaSlot, MemoryBackend, RemovableBackend, SimulatedSlot,
    StorageBackend,
};
use crate::error::{StorageError, StorageResult};
use crate::events::{EventBus, StorageEvent};
use crate::lifecycle::MediaLifecycle;
use crate::registry::{HandleId, HandleRegistry};
use crate::router::{self, RoutedPath};
use crate::storage::Storage;
use crate::types::{
    AccessMode, BackendKind, CardInfo, Config, DirEntry, FileInfo, FsInfo, OpenMode,
    StorageStatus,
};

/// One storage command with its reply slot. Built by the gateway, consumed
/// by the dispatcher.
pub(crate) enum StorageCommand {
    // File operations
    FileOpen {
        path: String,
        access: AccessMode,
        mode: OpenMode,
        reply: oneshot::Sender<StorageResult<HandleId>>,
    },
    FileClose {
        id: HandleId,
        reply: oneshot::Sender<StorageResult<()>>,
    },
    FileRead {
        id: HandleId,
        max_len: usize,
        reply: oneshot::Sender<StorageResult<Vec<u8>>>,
    },
    FileWrite {
        id: HandleId,
        data: Vec<u8>,
        reply: oneshot::Sender<StorageResult<usize>>,
    },
    FileSeek {
        id: HandleId,
        offset: u64,
        from_start: bool,
        reply: oneshot::Sender<StorageResult<u64>>,
    },
    FileTell {
        id: HandleId,
        reply: oneshot::Sender<StorageResult<u64>>,
    },
    FileTruncate {
        id: HandleId,
        reply: oneshot::Sender<StorageResult<()>>,
    },
    FileSync {
        id: HandleId,
        reply: oneshot::Sender<StorageResult<()>>,
    },
    FileSize {
        id: HandleId,
        reply: oneshot::Sender<StorageResult<u64>>,
    },
    FileEof {
        id: HandleId,
        reply: oneshot::Sender<StorageResult<bool>>,
    },

    // Directory operations
    DirOpen {
        path: String,
        reply: oneshot::Sender<StorageResult<HandleId>>,
    },
    DirClose {
        id: HandleId,
        reply: oneshot::Sender<StorageResult<()>>,
    },
    DirRead {
        id: HandleId,
        reply: oneshot::Sender<StorageResult<Option<DirEntry>>>,
    },
    DirRewind {
        id: HandleId,
        reply: oneshot::Sender<StorageResult<()>>,
    },

    // Common operations
    CommonStat {
        path: String,
        reply: oneshot::Sender<StorageResult<FileInfo>>,
    },
    CommonRemove {
        path: String,
        reply: oneshot::Sender<StorageResult<()>>,
    },
    CommonMkdir {
        path: String,
        reply: oneshot::Sender<StorageResult<()>>,
    },
    CommonFsInfo {
        path: String,
        reply: oneshot::Sender<StorageResult<FsInfo>>,
    },
    CommonTimestamp {
        path: String,
        reply: oneshot::Sender<StorageResult<u64>>,
    },
    CommonResolvePath {
        path: String,
        app_id: String,
        create_folders: bool,
        reply: oneshot::Sender<StorageResult<String>>,
    },

    // Removable media operations
    CardMount {
        reply: oneshot::Sender<StorageResult<()>>,
    },
    CardFormat {
        reply: oneshot::Sender<StorageResult<()>>,
    },
    CardUnmount {
        reply: oneshot::Sender<StorageResult<()>>,
    },
    CardInfo {
        reply: oneshot::Sender<StorageResult<CardInfo>>,
    },
    CardStatus {
        reply: oneshot::Sender<StorageStatus>,
    },
}

enum OpenCursor {
    File {
        cursor: Box<dyn FileCursor>,
        backend: BackendKind,
    },
    Dir {
        cursor: Box<dyn DirCursor>,
    },
}

struct BackendSlot {
    backend: Arc<dyn StorageBackend>,
    /// Monotonic change marker, bumped on every mutating operation and on
    /// mount state changes. Callers compare it to detect modification.
    timestamp: u64,
}

/// The storage engine: all backend state, owned by one dispatcher task.
pub struct StorageEngine {
    config: Config,
    internal: BackendSlot,
    external: BackendSlot,
    lifecycle: MediaLifecycle,
    registry: HandleRegistry,
    cursors: HashMap<HandleId, OpenCursor>,
    next_handle: HandleId,
    events: EventBus,
}

impl StorageEngine {
    /// Build the engine around the two backends and spawn its dispatcher
    /// task. The returned gateway is the only way to reach the engine; the
    /// task exits when every gateway clone is dropped.
    pub fn start(
        config: Config,
        internal: Arc<dyn StorageBackend>,
        slot: Arc<dyn MediaSlot>,
    ) -> Storage {
        let events = EventBus::default();
        let removable = Arc::new(RemovableBackend::new(slot));
        let lifecycle = MediaLifecycle::new(Arc::clone(&removable), events.clone(), &config);

        let (tx, rx) = mpsc::channel(config.queue_depth);
        let storage = Storage::new(tx, events.clone(), config.copy_buffer_len);

        let engine = StorageEngine {
            internal: BackendSlot {
                backend: internal,
                timestamp: 0,
            },
            external: BackendSlot {
                backend: removable,
                timestamp: 0,
            },
            lifecycle,
            registry: HandleRegistry::new(),
            cursors: HashMap::new(),
            next_handle: 1,
            events,
            config,
        };
        tokio::spawn(engine.run(rx));

        storage
    }

    /// Engine over an in-memory flash volume and a simulated card slot.
    /// The slot handle is returned so callers can insert and eject cards.
    pub fn start_simulated(config: Config) -> (Storage, Arc<SimulatedSlot>) {
        let slot = Arc::new(SimulatedSlot::new());
        let storage = Self::start(config, Arc::new(MemoryBackend::new()), slot.clone());
        (storage, slot)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<StorageCommand>) {
        tracing::debug!("storage dispatcher started");
        loop {
            match tokio::time::timeout(self.config.tick_period, rx.recv()).await {
                Ok(Some(command)) => self.process(command).await,
                Ok(None) => break,
                Err(_) => self.idle_tick().await,
            }
        }
        tracing::debug!("storage dispatcher stopped");
    }

    async fn idle_tick(&mut self) {
        let before = self.lifecycle.status();
        self.lifecycle.tick().await;
        if self.lifecycle.status() != before {
            self.external.timestamp += 1;
        }
    }

    async fn process(&mut self, command: StorageCommand) {
        match command {
            StorageCommand::FileOpen {
                path,
                access,
                mode,
                reply,
            } => {
                let _ = reply.send(self.file_open(&path, access, mode).await);
            }
            StorageCommand::FileClose { id, reply } => {
                let _ = reply.send(self.file_close(id).await);
            }
            StorageCommand::FileRead { id, max_len, reply } => {
                let _ = reply.send(self.file_read(id, max_len).await);
            }
            StorageCommand::FileWrite { id, data, reply } => {
                let _ = reply.send(self.file_write(id, &data).await);
            }
            StorageCommand::FileSeek {
                id,
                offset,
                from_start,
                reply,
            } => {
                let _ = reply.send(match self.file_cursor(id) {
                    Ok(cursor) => cursor.seek(offset, from_start).await,
                    Err(e) => Err(e),
                });
            }
            StorageCommand::FileTell { id, reply } => {
                let _ = reply.send(match self.file_cursor(id) {
                    Ok(cursor) => cursor.tell().await,
                    Err(e) => Err(e),
                });
            }
            StorageCommand::FileTruncate { id, reply } => {
                let _ = reply.send(self.file_truncate(id).await);
            }
            StorageCommand::FileSync { id, reply } => {
                let _ = reply.send(match self.file_cursor(id) {
                    Ok(cursor) => cursor.sync().await,
                    Err(e) => Err(e),
                });
            }
            StorageCommand::FileSize { id, reply } => {
                let _ = reply.send(match self.file_cursor(id) {
                    Ok(cursor) => cursor.size().await,
                    Err(e) => Err(e),
                });
            }
            StorageCommand::FileEof { id, reply } => {
                let _ = reply.send(match self.file_cursor(id) {
                    Ok(cursor) => cursor.eof().await,
                    Err(e) => Err(e),
                });
            }

            StorageCommand::DirOpen { path, reply } => {
                let _ = reply.send(self.dir_open(&path).await);
            }
            StorageCommand::DirClose { id, reply } => {
                let _ = reply.send(self.dir_close(id).await);
            }
            StorageCommand::DirRead { id, reply } => {
                let _ = reply.send(match self.dir_cursor(id) {
                    Ok(cursor) => cursor.read_next().await,
                    Err(e) => Err(e),
                });
            }
            StorageCommand::DirRewind { id, reply } => {
                let _ = reply.send(match self.dir_cursor(id) {
                    Ok(cursor) => cursor.rewind().await,
                    Err(e) => Err(e),
                });
            }

            StorageCommand::CommonStat { path, reply } => {
                let _ = reply.send(self.common_stat(&path).await);
            }
            StorageCommand::CommonRemove { path, reply } => {
                let _ = reply.send(self.common_remove(&path).await);
            }
            StorageCommand::CommonMkdir { path, reply } => {
                let _ = reply.send(self.common_mkdir(&path).await);
            }
            StorageCommand::CommonFsInfo { path, reply } => {
                let _ = reply.send(self.common_fs_info(&path).await);
            }
            StorageCommand::CommonTimestamp { path, reply } => {
                let _ = reply.send(self.common_timestamp(&path));
            }
            StorageCommand::CommonResolvePath {
                path,
                app_id,
                create_folders,
                reply,
            } => {
                let _ = reply.send(self.resolve_path(&path, &app_id, create_folders).await);
            }

            StorageCommand::CardMount { reply } => {
                let result = self.lifecycle.mount().await;
                self.external.timestamp += 1;
                let _ = reply.send(result);
            }
            StorageCommand::CardFormat { reply } => {
                let result = self.lifecycle.format().await;
                self.external.timestamp += 1;
                let _ = reply.send(result);
            }
            StorageCommand::CardUnmount { reply } => {
                let result = self.lifecycle.unmount().await;
                self.external.timestamp += 1;
                let _ = reply.send(result);
            }
            StorageCommand::CardInfo { reply } => {
                let _ = reply.send(self.lifecycle.card_info().await);
            }
            StorageCommand::CardStatus { reply } => {
                let _ = reply.send(self.lifecycle.status());
            }
        }
    }

    // ── Routing ──────────────────────────────────────────────────────────

    fn route(&self, path: &str) -> StorageResult<RoutedPath> {
        let external_ok = self.external.backend.status() == StorageStatus::Ok;
        router::route(path, external_ok)
    }

    fn backend(&self, kind: BackendKind) -> Arc<dyn StorageBackend> {
        match kind {
            BackendKind::Internal => Arc::clone(&self.internal.backend),
            BackendKind::External => Arc::clone(&self.external.backend),
        }
    }

    fn bump_timestamp(&mut self, kind: BackendKind) {
        match kind {
            BackendKind::Internal => self.internal.timestamp += 1,
            BackendKind::External => self.external.timestamp += 1,
        }
    }

    fn alloc_handle(&mut self) -> HandleId {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    // ── File operations ──────────────────────────────────────────────────

    async fn file_open(
        &mut self,
        path: &str,
        access: AccessMode,
        mode: OpenMode,
    ) -> StorageResult<HandleId> {
        let routed = self.route(path)?;
        if self.registry.is_open(routed.backend, &routed.vpath) {
            return Err(StorageError::already_open(&routed.vpath));
        }
        if access.write {
            self.bump_timestamp(routed.backend);
        }

        let backend = self.backend(routed.backend);
        let cursor = backend.open_file(&routed.rel, access, mode).await?;

        let id = self.alloc_handle();
        self.cursors.insert(
            id,
            OpenCursor::File {
                cursor,
                backend: routed.backend,
            },
        );
        self.registry.register(id, routed.backend, routed.vpath);
        tracing::trace!(id, path, "file open");
        Ok(id)
    }

    async fn file_close(&mut self, id: HandleId) -> StorageResult<()> {
        match self.cursors.remove(&id) {
            Some(OpenCursor::File { mut cursor, .. }) => {
                let result = cursor.close().await;
                self.registry.unregister(id);
                self.events.publish(StorageEvent::FileClosed);
                tracing::trace!(id, "file closed");
                result
            }
            Some(entry) => {
                self.cursors.insert(id, entry);
                Err(StorageError::InvalidParameter)
            }
            None => Err(StorageError::InvalidParameter),
        }
    }

    fn file_cursor(&mut self, id: HandleId) -> StorageResult<&mut Box<dyn FileCursor>> {
        match self.cursors.get_mut(&id) {
            Some(OpenCursor::File { cursor, .. }) => Ok(cursor),
            _ => Err(StorageError::InvalidParameter),
        }
    }

    fn file_backend(&self, id: HandleId) -> StorageResult<BackendKind> {
        match self.cursors.get(&id) {
            Some(OpenCursor::File { backend, .. }) => Ok(*backend),
            _ => Err(StorageError::InvalidParameter),
        }
    }

    async fn file_read(&mut self, id: HandleId, max_len: usize) -> StorageResult<Vec<u8>> {
        let cursor = self.file_cursor(id)?;
        let mut buf = vec![0u8; max_len];
        let n = cursor.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn file_write(&mut self, id: HandleId, data: &[u8]) -> StorageResult<usize> {
        let backend = self.file_backend(id)?;
        self.bump_timestamp(backend);
        let cursor = self.file_cursor(id)?;
        cursor.write(data).await
    }

    async fn file_truncate(&mut self, id: HandleId) -> StorageResult<()> {
        let backend = self.file_backend(id)?;
        self.bump_timestamp(backend);
        let cursor = self.file_cursor(id)?;
        cursor.truncate().await
    }

    // ── Directory operations ─────────────────────────────────────────────

    async fn dir_open(&mut self, path: &str) -> StorageResult<HandleId> {
        let routed = self.route(path)?;
        if self.registry.is_open(routed.backend, &routed.vpath) {
            return Err(StorageError::already_open(&routed.vpath));
        }

        let backend = self.backend(routed.backend);
        let cursor = backend.open_dir(&routed.rel).await?;

        let id = self.alloc_handle();
        self.cursors.insert(id, OpenCursor::Dir { cursor });
        self.registry.register(id, routed.backend, routed.vpath);
        tracing::trace!(id, path, "dir open");
        Ok(id)
    }

    async fn dir_close(&mut self, id: HandleId) -> StorageResult<()> {
        match self.cursors.remove(&id) {
            Some(OpenCursor::Dir { mut cursor }) => {
                let result = cursor.close().await;
                self.registry.unregister(id);
                self.events.publish(StorageEvent::DirClosed);
                tracing::trace!(id, "dir closed");
                result
            }
            Some(entry) => {
                self.cursors.insert(id, entry);
                Err(StorageError::InvalidParameter)
            }
            None => Err(StorageError::InvalidParameter),
        }
    }

    fn dir_cursor(&mut self, id: HandleId) -> StorageResult<&mut Box<dyn DirCursor>> {
        match self.cursors.get_mut(&id) {
            Some(OpenCursor::Dir { cursor }) => Ok(cursor),
            _ => Err(StorageError::InvalidParameter),
        }
    }

    // ── Common operations ────────────────────────────────────────────────

    async fn common_stat(&mut self, path: &str) -> StorageResult<FileInfo> {
        let routed = self.route(path)?;
        self.backend(routed.backend).stat(&routed.rel).await
    }

    async fn common_remove(&mut self, path: &str) -> StorageResult<()> {
        let routed = self.route(path)?;
        if self.registry.is_open(routed.backend, &routed.vpath) {
            return Err(StorageError::already_open(&routed.vpath));
        }
        self.bump_timestamp(routed.backend);
        self.backend(routed.backend).remove(&routed.rel).await
    }

    async fn common_mkdir(&mut self, path: &str) -> StorageResult<()> {
        let routed = self.route(path)?;
        self.bump_timestamp(routed.backend);
        self.backend(routed.backend).mkdir(&routed.rel).await
    }

    async fn common_fs_info(&mut self, path: &str) -> StorageResult<FsInfo> {
        let routed = self.route(path)?;
        self.backend(routed.backend).fs_info().await
    }

    fn common_timestamp(&mut self, path: &str) -> StorageResult<u64> {
        let routed = self.route(path)?;
        Ok(match routed.backend {
            BackendKind::Internal => self.internal.timestamp,
            BackendKind::External => self.external.timestamp,
        })
    }

    /// Rewrite application aliases to their per-app location, optionally
    /// creating the data directory chain.
    async fn resolve_path(
        &mut self,
        path: &str,
        app_id: &str,
        create_folders: bool,
    ) -> StorageResult<String> {
        if let Some(rest) = router::strip_alias(path, router::APP_DATA_PREFIX) {
            let app_dir = format!("{}/{}", router::APPS_DATA_PATH, app_id);
            if create_folders && self.common_stat(&app_dir).await.is_err() {
                // Tolerate half-created chains.
                let _ = self.common_mkdir(router::APPS_DATA_PATH).await;
                let _ = self.common_mkdir(&app_dir).await;
            }
            return Ok(join_alias(&app_dir, rest));
        }
        if let Some(rest) = router::strip_alias(path, router::APP_ASSETS_PREFIX) {
            let app_dir = format!("{}/{}", router::APPS_ASSETS_PATH, app_id);
            return Ok(join_alias(&app_dir, rest));
        }
        Ok(path.to_string())
    }
}

fn join_alias(base: &str, rest: &str) -> String {
    if rest.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{rest}")
    }
}
