//! Stateful chunked transfer adapter.
//!
//! Translates one session's request records into storage gateway calls.
//! Reads and listings fan one request out into as many capped response
//! records as needed; writes arrive chunked across consecutive requests
//! sharing a command id. The session tracks at most one in-flight chunked
//! write: any record that is not its continuation aborts it and reports
//! `ErrorContinuousCommandInterrupted` to the original command id, so a
//! client can tell "my own earlier command was cut short" apart from a
//! filesystem rejection.

use tokio::sync::mpsc;

use tansu_storage::{AccessMode, File, FileType, OpenMode, Storage};

use crate::proto::{
    CommandStatus, FileEntry, Request, RequestPayload, Response, ResponsePayload,
    LIST_PAGE_CAPACITY, READ_CHUNK_CAPACITY,
};

enum Transfer {
    Idle,
    Writing { command_id: u32, file: File },
}

/// Storage handler for one host session.
pub struct StorageSession {
    storage: Storage,
    out: mpsc::Sender<Response>,
    transfer: Transfer,
}

impl StorageSession {
    /// Create a handler pushing responses into `out`.
    pub fn new(storage: Storage, out: mpsc::Sender<Response>) -> Self {
        Self {
            storage,
            out,
            transfer: Transfer::Idle,
        }
    }

    /// True when no chunked transfer is in flight.
    pub fn is_idle(&self) -> bool {
        matches!(self.transfer, Transfer::Idle)
    }

    /// Handle one request record, pushing any number of response records.
    pub async fn process(&mut self, request: Request) {
        if self.interrupts_transfer(&request) {
            self.abort_transfer().await;
        }

        if matches!(request.payload, RequestPayload::Empty) {
            // Peer-side failure report or an undecodable record.
            self.send(Response::error(request.command_id, CommandStatus::ErrorDecode))
                .await;
            return;
        }

        let id = request.command_id;
        match request.payload {
            RequestPayload::Ping => {
                self.send(Response::ok(id, ResponsePayload::Ping)).await;
            }
            RequestPayload::Info { path } => self.process_info(id, &path).await,
            RequestPayload::Timestamp { path } => self.process_timestamp(id, &path).await,
            RequestPayload::Stat { path } => self.process_stat(id, &path).await,
            RequestPayload::List { path } => self.process_list(id, &path).await,
            RequestPayload::Read { path } => self.process_read(id, &path).await,
            RequestPayload::Write { path, data } => {
                self.process_write(id, &path, data, request.has_next).await;
            }
            RequestPayload::Delete { path, recursive } => {
                self.process_delete(id, &path, recursive).await;
            }
            RequestPayload::Mkdir { path } => self.process_mkdir(id, &path).await,
            RequestPayload::Rename { old_path, new_path } => {
                self.process_rename(id, &old_path, &new_path).await;
            }
            RequestPayload::Checksum { path } => self.process_checksum(id, &path).await,
            RequestPayload::Empty => unreachable!("handled above"),
        }
    }

    /// Tear down an in-flight transfer (e.g. on session close). The open
    /// file is closed at the bytes written so far; no status is emitted.
    pub async fn shutdown(&mut self) {
        if let Transfer::Writing { file, .. } =
            std::mem::replace(&mut self.transfer, Transfer::Idle)
        {
            let _ = file.close().await;
        }
    }

    fn interrupts_transfer(&self, request: &Request) -> bool {
        match &self.transfer {
            Transfer::Idle => false,
            Transfer::Writing { command_id, .. } => {
                *command_id != request.command_id
                    || !matches!(request.payload, RequestPayload::Write { .. })
            }
        }
    }

    async fn abort_transfer(&mut self) {
        if let Transfer::Writing { command_id, file } =
            std::mem::replace(&mut self.transfer, Transfer::Idle)
        {
            tracing::warn!(command_id, "continuous write interrupted");
            let _ = file.close().await;
            self.send(Response::error(
                command_id,
                CommandStatus::ErrorContinuousCommandInterrupted,
            ))
            .await;
        }
    }

    async fn send(&mut self, response: Response) {
        // A torn-down session just drops the remaining records.
        let _ = self.out.send(response).await;
    }

    // ── Command handlers ─────────────────────────────────────────────────

    async fn process_info(&mut self, id: u32, path: &str) {
        match self.storage.fs_info(path).await {
            Ok(info) => {
                self.send(Response::ok(
                    id,
                    ResponsePayload::Info {
                        total_space: info.total_space,
                        free_space: info.free_space,
                    },
                ))
                .await;
            }
            Err(e) => self.send(Response::error(id, (&e).into())).await,
        }
    }

    async fn process_timestamp(&mut self, id: u32, path: &str) {
        match self.storage.timestamp(path).await {
            Ok(timestamp) => {
                self.send(Response::ok(id, ResponsePayload::Timestamp { timestamp }))
                    .await;
            }
            Err(e) => self.send(Response::error(id, (&e).into())).await,
        }
    }

    async fn process_stat(&mut self, id: u32, path: &str) {
        match self.storage.stat(path).await {
            Ok(info) => {
                let name = path.rsplit('/').next().unwrap_or(path).to_string();
                self.send(Response::ok(
                    id,
                    ResponsePayload::Stat {
                        file: FileEntry {
                            name,
                            kind: info.kind,
                            size: info.size,
                        },
                    },
                ))
                .await;
            }
            Err(e) => self.send(Response::error(id, (&e).into())).await,
        }
    }

    async fn process_list(&mut self, id: u32, path: &str) {
        // The virtual root is synthesized: it is not a directory on any
        // backend.
        if path == "/" {
            let files = ["any", "ext", "int"]
                .into_iter()
                .map(|name| FileEntry {
                    name: name.to_string(),
                    kind: FileType::Directory,
                    size: 0,
                })
                .collect();
            self.send(Response::ok(id, ResponsePayload::List { files }))
                .await;
            return;
        }

        let mut dir = match self.storage.open_dir(path).await {
            Ok(dir) => dir,
            Err(e) => {
                self.send(Response::error(id, (&e).into())).await;
                return;
            }
        };

        let mut entries: Vec<FileEntry> = Vec::new();
        loop {
            match dir.read().await {
                Ok(Some(entry)) => {
                    // Only ASCII names survive the wire encoding.
                    if entry.name.is_ascii() {
                        entries.push(FileEntry {
                            name: entry.name,
                            kind: entry.info.kind,
                            size: entry.info.size,
                        });
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = dir.close().await;
                    self.send(Response::error(id, (&e).into())).await;
                    return;
                }
            }
        }
        let _ = dir.close().await;

        if entries.is_empty() {
            self.send(Response::ok(id, ResponsePayload::List { files: Vec::new() }))
                .await;
            return;
        }

        let total = entries.len();
        let mut sent = 0;
        for page in entries.chunks(LIST_PAGE_CAPACITY) {
            sent += page.len();
            let payload = ResponsePayload::List {
                files: page.to_vec(),
            };
            let response = if sent < total {
                Response::ok_more(id, payload)
            } else {
                Response::ok(id, payload)
            };
            self.send(response).await;
        }
    }

    async fn process_read(&mut self, id: u32, path: &str) {
        let mut file = match self
            .storage
            .open_file(path, AccessMode::read(), OpenMode::open_existing())
            .await
        {
            Ok(file) => file,
            Err(e) => {
                self.send(Response::error(id, (&e).into())).await;
                return;
            }
        };

        let size = match file.size().await {
            Ok(size) => size,
            Err(e) => {
                let _ = file.close().await;
                self.send(Response::error(id, (&e).into())).await;
                return;
            }
        };

        let mut sent: u64 = 0;
        loop {
            let chunk = match file.read(READ_CHUNK_CAPACITY).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = file.close().await;
                    self.send(Response::error(id, (&e).into())).await;
                    return;
                }
            };
            sent += chunk.len() as u64;
            let has_next = sent < size;
            let payload = ResponsePayload::Read { data: chunk };
            let response = if has_next {
                Response::ok_more(id, payload)
            } else {
                Response::ok(id, payload)
            };
            self.send(response).await;
            if !has_next {
                break;
            }
        }
        let _ = file.close().await;
    }

    async fn process_write(&mut self, id: u32, path: &str, data: Vec<u8>, has_next: bool) {
        if matches!(self.transfer, Transfer::Idle) {
            // First chunk of a new transfer.
            match self
                .storage
                .open_file(path, AccessMode::write(), OpenMode::create_always())
                .await
            {
                Ok(file) => {
                    self.transfer = Transfer::Writing {
                        command_id: id,
                        file,
                    };
                }
                Err(e) => {
                    self.send(Response::error(id, (&e).into())).await;
                    return;
                }
            }
        }

        let write_result = match &mut self.transfer {
            Transfer::Writing { file, .. } => file.write(&data).await,
            Transfer::Idle => unreachable!("transfer opened above"),
        };

        match write_result {
            Ok(_) => {
                if !has_next {
                    // Final chunk: close and acknowledge the whole command.
                    if let Transfer::Writing { file, .. } =
                        std::mem::replace(&mut self.transfer, Transfer::Idle)
                    {
                        match file.close().await {
                            Ok(()) => {
                                self.send(Response::ok(id, ResponsePayload::Empty)).await;
                            }
                            Err(e) => self.send(Response::error(id, (&e).into())).await,
                        }
                    }
                }
            }
            Err(e) => {
                // Leave a defined state behind: file closed, transfer reset.
                if let Transfer::Writing { file, .. } =
                    std::mem::replace(&mut self.transfer, Transfer::Idle)
                {
                    let _ = file.close().await;
                }
                self.send(Response::error(id, (&e).into())).await;
            }
        }
    }

    async fn process_delete(&mut self, id: u32, path: &str, recursive: bool) {
        if recursive {
            match self.storage.remove_recursive(path).await {
                Ok(()) => self.send(Response::ok(id, ResponsePayload::Empty)).await,
                Err(e) => self.send(Response::error(id, (&e).into())).await,
            }
            return;
        }

        // Distinguish "non-empty directory" from every other denial before
        // the plain remove.
        if matches!(self.storage.stat(path).await, Ok(info) if info.is_dir())
            && !self.storage.dir_is_empty(path).await.unwrap_or(true)
        {
            self.send(Response::error(id, CommandStatus::ErrorStorageDirNotEmpty))
                .await;
            return;
        }

        match self.storage.remove(path).await {
            Ok(()) => self.send(Response::ok(id, ResponsePayload::Empty)).await,
            Err(e) => self.send(Response::error(id, (&e).into())).await,
        }
    }

    async fn process_mkdir(&mut self, id: u32, path: &str) {
        match self.storage.mkdir(path).await {
            Ok(()) => self.send(Response::ok(id, ResponsePayload::Empty)).await,
            Err(e) => self.send(Response::error(id, (&e).into())).await,
        }
    }

    async fn process_rename(&mut self, id: u32, old_path: &str, new_path: &str) {
        match self.storage.rename(old_path, new_path).await {
            Ok(()) => self.send(Response::ok(id, ResponsePayload::Empty)).await,
            Err(e) => self.send(Response::error(id, (&e).into())).await,
        }
    }

    async fn process_checksum(&mut self, id: u32, path: &str) {
        let mut file = match self
            .storage
            .open_file(path, AccessMode::read(), OpenMode::open_existing())
            .await
        {
            Ok(file) => file,
            Err(e) => {
                self.send(Response::error(id, (&e).into())).await;
                return;
            }
        };

        let mut hasher = blake3::Hasher::new();
        loop {
            let chunk = match file.read(READ_CHUNK_CAPACITY).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = file.close().await;
                    self.send(Response::error(id, (&e).into())).await;
                    return;
                }
            };
            if chunk.is_empty() {
                break;
            }
            hasher.update(&chunk);
        }
        let _ = file.close().await;

        let digest = hex::encode(hasher.finalize().as_bytes());
        self.send(Response::ok(id, ResponsePayload::Checksum { digest }))
            .await;
    }
}
