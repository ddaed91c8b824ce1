//! Removable card backend.
//!
//! [`MediaSlot`] is the hardware seam: physical presence, powered init, the
//! filesystem probe and formatting. [`RemovableBackend`] sits on top and
//! gates every filesystem operation on the current mount state, so a pulled
//! card turns open cursors into `NotReady` errors instead of dangling reads.
//!
//! [`SimulatedSlot`] is the in-crate slot used by tests and by host builds
//! without card hardware; it supports fault injection for the mount retry
//! path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::backend::memory::MemoryBackend;
use crate::backend::{DirCursor, FileCursor, StorageBackend};
use crate::error::{StorageError, StorageResult};
use crate::types::{
    AccessMode, CardInfo, DirEntry, FileInfo, FsInfo, FsType, OpenMode, StorageStatus,
};

/// Outcome of one filesystem probe on an initialized card.
pub enum MountAttempt {
    /// A filesystem was found and is serving.
    Mounted(Arc<dyn StorageBackend>),
    /// The card is readable but carries no recognizable filesystem.
    NoFilesystem,
    /// A filesystem was found but its metadata could not be read.
    NotAccessible,
    /// The volume could not be mounted at all.
    NotMounted,
}

/// Hardware interface of the card slot.
#[async_trait]
pub trait MediaSlot: Send + Sync {
    /// Physical card presence, straight from the detect line.
    fn is_present(&self) -> bool;

    /// Initialize the card interface. `power_cycle` resets card power
    /// before initialization.
    async fn init(&self, power_cycle: bool) -> StorageResult<()>;

    /// Probe and mount the filesystem on an initialized card.
    async fn mount(&self) -> MountAttempt;

    /// Release the mounted filesystem.
    async fn unmount(&self);

    /// Create a fresh filesystem on the card and label it.
    async fn format(&self, label: &str) -> StorageResult<()>;

    /// Volume label of the present card.
    fn label(&self) -> StorageResult<String>;

    /// Filesystem flavor of the present card.
    fn fs_type(&self) -> FsType;
}

struct MountState {
    status: StorageStatus,
    volume: Option<Arc<dyn StorageBackend>>,
    /// Shared with every cursor opened during this mount; cleared on
    /// unmount so stale cursors fail instead of touching a new mount.
    session: Arc<AtomicBool>,
}

/// Backend for the removable card.
pub struct RemovableBackend {
    slot: Arc<dyn MediaSlot>,
    state: RwLock<MountState>,
}

impl RemovableBackend {
    /// Create an unmounted backend over a slot.
    pub fn new(slot: Arc<dyn MediaSlot>) -> Self {
        Self {
            slot,
            state: RwLock::new(MountState {
                status: StorageStatus::NotReady,
                volume: None,
                session: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Physical presence, straight from the slot.
    pub fn is_present(&self) -> bool {
        self.slot.is_present()
    }

    pub(crate) fn set_status(&self, status: StorageStatus) {
        self.state.write().status = status;
    }

    /// One mount attempt: init (optionally power-cycling), then probe.
    /// Returns true when the attempt reached an accepted terminal state
    /// (`Ok` or `NoFilesystem`).
    pub(crate) async fn mount_once(&self, power_cycle: bool) -> bool {
        if let Err(e) = self.slot.init(power_cycle).await {
            tracing::warn!(error = %e, power_cycle, "card init failed");
            self.set_status(StorageStatus::InternalError);
            return false;
        }

        match self.slot.mount().await {
            MountAttempt::Mounted(volume) => {
                let mut state = self.state.write();
                state.session = Arc::new(AtomicBool::new(true));
                state.volume = Some(volume);
                state.status = StorageStatus::Ok;
                true
            }
            MountAttempt::NoFilesystem => {
                self.set_status(StorageStatus::NoFilesystem);
                true
            }
            MountAttempt::NotAccessible => {
                self.set_status(StorageStatus::NotAccessible);
                false
            }
            MountAttempt::NotMounted => {
                self.set_status(StorageStatus::NotMounted);
                false
            }
        }
    }

    /// Drop the mounted volume and invalidate open cursors.
    pub(crate) async fn force_unmount(&self) {
        {
            let mut state = self.state.write();
            state.session.store(false, Ordering::SeqCst);
            state.volume = None;
            state.status = StorageStatus::NotReady;
        }
        self.slot.unmount().await;
    }

    /// Recreate the filesystem, label it, and remount. Status records the
    /// last stage that completed.
    pub(crate) async fn format_card(&self, label: &str) -> StorageResult<()> {
        {
            let mut state = self.state.write();
            state.session.store(false, Ordering::SeqCst);
            state.volume = None;
            state.status = StorageStatus::NotAccessible;
        }

        self.slot.format(label).await?;
        self.set_status(StorageStatus::NoFilesystem);
        self.set_status(StorageStatus::NotMounted);

        match self.slot.mount().await {
            MountAttempt::Mounted(volume) => {
                let mut state = self.state.write();
                state.session = Arc::new(AtomicBool::new(true));
                state.volume = Some(volume);
                state.status = StorageStatus::Ok;
                Ok(())
            }
            _ => Err(StorageError::internal("mount after format failed")),
        }
    }

    /// Identity and capacity of the mounted card.
    pub(crate) async fn card_info(&self) -> StorageResult<CardInfo> {
        let volume = {
            let state = self.state.read();
            state.volume.clone()
        };
        let volume = volume.ok_or(StorageError::NotReady)?;
        let fs = volume.fs_info().await?;
        Ok(CardInfo {
            label: self.slot.label()?,
            fs_type: self.slot.fs_type(),
            total_space: fs.total_space,
            free_space: fs.free_space,
        })
    }

    fn serving(&self) -> StorageResult<(Arc<dyn StorageBackend>, Arc<AtomicBool>)> {
        let state = self.state.read();
        match &state.volume {
            Some(volume) => Ok((Arc::clone(volume), Arc::clone(&state.session))),
            None => Err(StorageError::NotReady),
        }
    }
}

#[async_trait]
impl StorageBackend for RemovableBackend {
    async fn open_file(
        &self,
        path: &str,
        access: AccessMode,
        mode: OpenMode,
    ) -> StorageResult<Box<dyn FileCursor>> {
        let (volume, session) = self.serving()?;
        let inner = volume.open_file(path, access, mode).await?;
        Ok(Box::new(CardFileCursor { inner, session }))
    }

    async fn open_dir(&self, path: &str) -> StorageResult<Box<dyn DirCursor>> {
        let (volume, session) = self.serving()?;
        let inner = volume.open_dir(path).await?;
        Ok(Box::new(CardDirCursor { inner, session }))
    }

    async fn stat(&self, path: &str) -> StorageResult<FileInfo> {
        let (volume, _) = self.serving()?;
        volume.stat(path).await
    }

    async fn remove(&self, path: &str) -> StorageResult<()> {
        let (volume, _) = self.serving()?;
        volume.remove(path).await
    }

    async fn mkdir(&self, path: &str) -> StorageResult<()> {
        let (volume, _) = self.serving()?;
        volume.mkdir(path).await
    }

    async fn fs_info(&self) -> StorageResult<FsInfo> {
        let (volume, _) = self.serving()?;
        volume.fs_info().await
    }

    fn status(&self) -> StorageStatus {
        self.state.read().status
    }
}

struct CardFileCursor {
    inner: Box<dyn FileCursor>,
    session: Arc<AtomicBool>,
}

impl CardFileCursor {
    fn check(&self) -> StorageResult<()> {
        if self.session.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::NotReady)
        }
    }
}

#[async_trait]
impl FileCursor for CardFileCursor {
    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        self.check()?;
        self.inner.read(buf).await
    }

    async fn write(&mut self, data: &[u8]) -> StorageResult<usize> {
        self.check()?;
        self.inner.write(data).await
    }

    async fn seek(&mut self, offset: u64, from_start: bool) -> StorageResult<u64> {
        self.check()?;
        self.inner.seek(offset, from_start).await
    }

    async fn tell(&mut self) -> StorageResult<u64> {
        self.check()?;
        self.inner.tell().await
    }

    async fn truncate(&mut self) -> StorageResult<()> {
        self.check()?;
        self.inner.truncate().await
    }

    async fn size(&mut self) -> StorageResult<u64> {
        self.check()?;
        self.inner.size().await
    }

    async fn sync(&mut self) -> StorageResult<()> {
        self.check()?;
        self.inner.sync().await
    }

    async fn eof(&mut self) -> StorageResult<bool> {
        self.check()?;
        self.inner.eof().await
    }

    async fn close(&mut self) -> StorageResult<()> {
        self.check()?;
        self.inner.close().await
    }
}

struct CardDirCursor {
    inner: Box<dyn DirCursor>,
    session: Arc<AtomicBool>,
}

#[async_trait]
impl DirCursor for CardDirCursor {
    async fn read_next(&mut self) -> StorageResult<Option<DirEntry>> {
        if !self.session.load(Ordering::SeqCst) {
            return Err(StorageError::NotReady);
        }
        self.inner.read_next().await
    }

    async fn rewind(&mut self) -> StorageResult<()> {
        if !self.session.load(Ordering::SeqCst) {
            return Err(StorageError::NotReady);
        }
        self.inner.rewind().await
    }

    async fn close(&mut self) -> StorageResult<()> {
        if !self.session.load(Ordering::SeqCst) {
            return Err(StorageError::NotReady);
        }
        self.inner.close().await
    }
}

// ============================================================================
// Simulated slot
// ============================================================================

/// A card that can be inserted into a [`SimulatedSlot`].
pub struct SimCard {
    volume: MemoryBackend,
    label: String,
    formatted: bool,
    init_failures: u32,
    mount_failures: u32,
}

impl SimCard {
    /// A formatted card with the given label.
    pub fn formatted(label: impl Into<String>) -> Self {
        Self {
            volume: MemoryBackend::new(),
            label: label.into(),
            formatted: true,
            init_failures: 0,
            mount_failures: 0,
        }
    }

    /// A card with no filesystem on it.
    pub fn unformatted() -> Self {
        Self {
            volume: MemoryBackend::new(),
            label: String::new(),
            formatted: false,
            init_failures: 0,
            mount_failures: 0,
        }
    }

    /// Fail the first `n` init attempts.
    pub fn with_init_failures(mut self, n: u32) -> Self {
        self.init_failures = n;
        self
    }

    /// Fail the first `n` mount attempts.
    pub fn with_mount_failures(mut self, n: u32) -> Self {
        self.mount_failures = n;
        self
    }
}

struct SimSlotState {
    card: Option<SimCard>,
    init_log: Vec<bool>,
}

/// Software card slot with presence toggling and fault injection.
pub struct SimulatedSlot {
    state: Mutex<SimSlotState>,
}

impl Default for SimulatedSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSlot {
    /// An empty slot.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimSlotState {
                card: None,
                init_log: Vec::new(),
            }),
        }
    }

    /// A slot with a formatted card already inserted.
    pub fn with_card(card: SimCard) -> Self {
        Self {
            state: Mutex::new(SimSlotState {
                card: Some(card),
                init_log: Vec::new(),
            }),
        }
    }

    /// Insert a card.
    pub fn insert(&self, card: SimCard) {
        self.state.lock().card = Some(card);
    }

    /// Eject the card.
    pub fn eject(&self) -> Option<SimCard> {
        self.state.lock().card.take()
    }

    /// Power-cycle flags of every init attempt so far, in order.
    pub fn init_log(&self) -> Vec<bool> {
        self.state.lock().init_log.clone()
    }
}

#[async_trait]
impl MediaSlot for SimulatedSlot {
    fn is_present(&self) -> bool {
        self.state.lock().card.is_some()
    }

    async fn init(&self, power_cycle: bool) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.init_log.push(power_cycle);
        let card = state.card.as_mut().ok_or(StorageError::NotReady)?;
        if card.init_failures > 0 {
            card.init_failures -= 1;
            return Err(StorageError::internal("card init failed"));
        }
        Ok(())
    }

    async fn mount(&self) -> MountAttempt {
        let mut state = self.state.lock();
        let Some(card) = state.card.as_mut() else {
            return MountAttempt::NotMounted;
        };
        if card.mount_failures > 0 {
            card.mount_failures -= 1;
            return MountAttempt::NotMounted;
        }
        if !card.formatted {
            return MountAttempt::NoFilesystem;
        }
        MountAttempt::Mounted(Arc::new(card.volume.clone()))
    }

    async fn unmount(&self) {}

    async fn format(&self, label: &str) -> StorageResult<()> {
        let mut state = self.state.lock();
        let card = state.card.as_mut().ok_or(StorageError::NotReady)?;
        card.volume = MemoryBackend::new();
        card.label = label.to_string();
        card.formatted = true;
        Ok(())
    }

    fn label(&self) -> StorageResult<String> {
        let state = self.state.lock();
        state
            .card
            .as_ref()
            .map(|c| c.label.clone())
            .ok_or(StorageError::NotReady)
    }

    fn fs_type(&self) -> FsType {
        FsType::Fat32
    }
}
