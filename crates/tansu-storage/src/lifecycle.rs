//! Removable media lifecycle.
//!
//! Polls physical presence once per dispatcher idle tick and drives the
//! mount state machine: insertion kicks off a bounded retry loop that
//! power-cycles the card every other attempt, removal force-unmounts.
//! Explicit unmount/format/info requests arrive here as commands, out of
//! band from the tick.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{RemovableBackend, StorageBackend};
use crate::error::{StorageError, StorageResult};
use crate::events::{EventBus, StorageEvent};
use crate::types::{CardInfo, Config, StorageStatus};

pub(crate) struct MediaLifecycle {
    backend: Arc<RemovableBackend>,
    events: EventBus,
    retry_count: u32,
    retry_delay: Duration,
    /// True while no card is mounted and we are watching for insertion.
    awaiting_card: bool,
}

impl MediaLifecycle {
    pub fn new(backend: Arc<RemovableBackend>, events: EventBus, config: &Config) -> Self {
        Self {
            backend,
            events,
            retry_count: config.mount_retry_count,
            retry_delay: config.mount_retry_delay,
            awaiting_card: true,
        }
    }

    pub fn status(&self) -> StorageStatus {
        self.backend.status()
    }

    /// One poll of the presence line, mounting or unmounting as needed.
    pub async fn tick(&mut self) {
        if self.awaiting_card {
            if self.backend.is_present() {
                tracing::info!("card detected");
                let mounted = self.mount_card().await;

                if mounted {
                    tracing::info!(status = %self.backend.status(), "card mounted");
                    self.events.publish(StorageEvent::CardMounted);
                } else {
                    tracing::error!(status = %self.backend.status(), "card mount failed");
                    self.events.publish(StorageEvent::CardMountError);
                }

                self.awaiting_card = false;

                // The card may have been pulled mid-mount; re-check and
                // back out if it vanished.
                if !self.backend.is_present() {
                    tracing::info!("card removed while mounting");
                    self.backend.force_unmount().await;
                    self.awaiting_card = true;
                }
            }
        } else if !self.backend.is_present() {
            tracing::info!("card removed");
            self.awaiting_card = true;
            self.backend.force_unmount().await;
            self.events.publish(StorageEvent::CardUnmounted);
        }
    }

    /// Bounded mount retry loop. Every other attempt power-cycles the card;
    /// an attempt stops early if the card disappears.
    async fn mount_card(&self) -> bool {
        let mut counter = self.retry_count;
        while counter > 0 && self.backend.is_present() {
            if self.backend.mount_once(counter % 2 == 0).await {
                return true;
            }
            tracing::warn!(
                attempt = counter,
                status = %self.backend.status(),
                "mount cycle failed"
            );
            tokio::time::sleep(self.retry_delay).await;
            counter -= 1;
        }
        false
    }

    /// Explicit mount request, e.g. after an explicit unmount. Runs the
    /// same bounded retry loop the insertion tick uses.
    pub async fn mount(&mut self) -> StorageResult<()> {
        if !self.backend.is_present() {
            return Err(StorageError::NotReady);
        }
        if self.mount_card().await {
            self.awaiting_card = false;
            self.events.publish(StorageEvent::CardMounted);
            Ok(())
        } else {
            self.events.publish(StorageEvent::CardMountError);
            Err(StorageError::internal("card mount failed"))
        }
    }

    /// Explicit unmount. The card stays unmounted until it is reinserted.
    pub async fn unmount(&mut self) -> StorageResult<()> {
        if self.backend.status() == StorageStatus::NotReady {
            return Err(StorageError::NotReady);
        }
        self.backend.force_unmount().await;
        Ok(())
    }

    /// Recreate the filesystem on the present card and remount it.
    pub async fn format(&self) -> StorageResult<()> {
        if self.backend.status() == StorageStatus::NotReady {
            return Err(StorageError::NotReady);
        }
        self.backend.format_card(Self::FORMAT_LABEL).await
    }

    /// Identity and capacity of the mounted card.
    pub async fn card_info(&self) -> StorageResult<CardInfo> {
        if self.backend.status() == StorageStatus::NotReady {
            return Err(StorageError::NotReady);
        }
        self.backend.card_info().await
    }

    const FORMAT_LABEL: &'static str = "TANSU SD";
}
