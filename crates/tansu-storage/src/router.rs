//! Virtual path router.
//!
//! The leading path segment picks the backend: `/int` is internal flash,
//! `/ext` is the removable card, and `/any` is an alias resolved per call to
//! whichever concrete backend is healthy. Resolution never mutates the
//! caller's path; the concrete form lives in the returned [`RoutedPath`].

use crate::error::{StorageError, StorageResult};
use crate::types::BackendKind;

/// Internal flash prefix.
pub const INT_PREFIX: &str = "/int";
/// Removable card prefix.
pub const EXT_PREFIX: &str = "/ext";
/// Alias prefix, resolved per call.
pub const ANY_PREFIX: &str = "/any";
/// Per-application data alias, rewritten by `resolve_path`.
pub const APP_DATA_PREFIX: &str = "/data";
/// Per-application assets alias, rewritten by `resolve_path`.
pub const APP_ASSETS_PREFIX: &str = "/assets";

/// Where application data aliases land after rewriting.
pub const APPS_DATA_PATH: &str = "/ext/apps_data";
/// Where application asset aliases land after rewriting.
pub const APPS_ASSETS_PATH: &str = "/ext/apps_assets";

/// A virtual path resolved to a concrete backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedPath {
    /// The concrete backend.
    pub backend: BackendKind,
    /// The full virtual path with any alias replaced by its concrete
    /// prefix. This is the canonical form the open-handle registry keys on.
    pub vpath: String,
    /// The backend-relative remainder, without a leading slash.
    pub rel: String,
}

/// Strip `prefix` from `path` at a path-component boundary.
pub(crate) fn strip_alias<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    split_prefix(path, prefix)
}

fn split_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some("")
    } else if let Some(rest) = rest.strip_prefix('/') {
        Some(rest)
    } else {
        None
    }
}

/// Resolve a virtual path to a backend.
///
/// `external_ok` is the External backend's health at the instant of the
/// call; it decides where `/any` lands. Unknown or too-short prefixes fail
/// with `InvalidName` before any backend is touched.
pub fn route(path: &str, external_ok: bool) -> StorageResult<RoutedPath> {
    if let Some(rel) = split_prefix(path, EXT_PREFIX) {
        return Ok(RoutedPath {
            backend: BackendKind::External,
            vpath: path.to_string(),
            rel: rel.to_string(),
        });
    }
    if let Some(rel) = split_prefix(path, INT_PREFIX) {
        return Ok(RoutedPath {
            backend: BackendKind::Internal,
            vpath: path.to_string(),
            rel: rel.to_string(),
        });
    }
    if let Some(rel) = split_prefix(path, ANY_PREFIX) {
        // Per-call decision; card state may change between calls.
        let (backend, prefix) = if external_ok {
            (BackendKind::External, EXT_PREFIX)
        } else {
            (BackendKind::Internal, INT_PREFIX)
        };
        let vpath = if rel.is_empty() {
            prefix.to_string()
        } else {
            format!("{prefix}/{rel}")
        };
        return Ok(RoutedPath {
            backend,
            vpath,
            rel: rel.to_string(),
        });
    }
    Err(StorageError::invalid_name(path))
}
