//! Open-handle registry.
//!
//! Tracks which canonical paths currently have a live cursor. At most one
//! open handle may reference a (backend, path) pair at any instant; this is
//! the concurrency-control primitive of the whole layer. Only the dispatcher
//! task touches the registry, so it needs no locking of its own.

use std::collections::HashMap;

use crate::types::BackendKind;

/// Handle identity, allocated by the dispatcher.
pub type HandleId = u64;

#[derive(Default)]
pub(crate) struct HandleRegistry {
    by_path: HashMap<(BackendKind, String), HandleId>,
    by_id: HashMap<HandleId, (BackendKind, String)>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unconditionally. The opener is responsible for having checked
    /// exclusivity via [`is_open`](Self::is_open) first.
    pub fn register(&mut self, id: HandleId, backend: BackendKind, path: impl Into<String>) {
        let path = path.into();
        self.by_path.insert((backend, path.clone()), id);
        self.by_id.insert(id, (backend, path));
    }

    /// True when any live handle references this path on this backend.
    pub fn is_open(&self, backend: BackendKind, path: &str) -> bool {
        self.by_path.contains_key(&(backend, path.to_string()))
    }

    /// Remove a handle's entry, returning what it referenced.
    pub fn unregister(&mut self, id: HandleId) -> Option<(BackendKind, String)> {
        let entry = self.by_id.remove(&id)?;
        self.by_path.remove(&(entry.0, entry.1.clone()));
        Some(entry)
    }

    /// Number of live handles.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}
