//! Virtualized storage engine.
//!
//! Presents internal flash and a removable card as one path-prefixed
//! namespace (`/int`, `/ext`, and the per-call `/any` alias) and serializes
//! every operation through a single dispatcher task. Key pieces:
//!
//! - [`StorageEngine`] - owns all backend state; one task runs it
//! - [`Storage`] - cloneable gateway giving callers a blocking-call view
//! - [`backend`] - driver traits plus the in-memory and removable backends
//! - [`router`] - virtual path prefix resolution
//! - [`EventBus`] - mount/unmount/handle-close broadcasts
//!
//! ## Design decisions
//!
//! - **Single writer**: only the dispatcher task mutates backend state, the
//!   open-handle registry or routing decisions, so none of them are locked.
//! - **At most one handle per path**: a second open blocks until the first
//!   handle closes, then succeeds; it never errors back to the caller.
//! - **Backpressure, not busy-errors**: the command queue is bounded and
//!   senders block on saturation.

pub mod backend;
mod engine;
mod error;
mod events;
mod lifecycle;
mod ops;
mod registry;
pub mod router;
mod storage;
mod types;

pub use engine::StorageEngine;
pub use error::{StorageError, StorageResult};
pub use events::{EventBus, StorageEvent};
pub use ops::DirWalk;
pub use storage::{Dir, File, Storage};
pub use types::{
    AccessMode, BackendKind, CardInfo, Config, DirEntry, FileInfo, FileType, FsInfo, FsType,
    OpenMode, StorageStatus,
};
