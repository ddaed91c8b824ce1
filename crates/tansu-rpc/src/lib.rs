//! Session protocol surface of the tansu storage engine.
//!
//! - [`proto`] - request/response records the session layer frames
//! - [`StorageSession`] - per-session handler translating records into
//!   storage gateway calls, chunking large transfers and tracking
//!   continuation state across records

pub mod proto;
mod session;

pub use proto::{
    CommandStatus, FileEntry, Request, RequestPayload, Response, ResponsePayload,
    LIST_PAGE_CAPACITY, READ_CHUNK_CAPACITY,
};
pub use session::StorageSession;
