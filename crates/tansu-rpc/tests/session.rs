//! Session-level tests: chunked transfers, pagination, interruption.

use std::time::Duration;

use tokio::sync::mpsc;

use tansu_rpc::{
    CommandStatus, Request, RequestPayload, Response, ResponsePayload, StorageSession,
    LIST_PAGE_CAPACITY, READ_CHUNK_CAPACITY,
};
use tansu_storage::{AccessMode, Config, OpenMode, Storage, StorageEngine};

fn start_session() -> (StorageSession, mpsc::Receiver<Response>, Storage) {
    let config = Config {
        tick_period: Duration::from_millis(20),
        mount_retry_delay: Duration::from_millis(1),
        ..Config::default()
    };
    let (storage, _slot) = StorageEngine::start_simulated(config);
    let (tx, rx) = mpsc::channel(256);
    (StorageSession::new(storage.clone(), tx), rx, storage)
}

async fn recv(rx: &mut mpsc::Receiver<Response>) -> Response {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a response")
        .expect("session output closed")
}

fn assert_no_response(rx: &mut mpsc::Receiver<Response>) {
    assert!(rx.try_recv().is_err(), "unexpected response");
}

async fn write_via_gateway(storage: &Storage, path: &str, data: &[u8]) {
    let mut f = storage
        .open_file(path, AccessMode::write(), OpenMode::create_always())
        .await
        .unwrap();
    f.write(data).await.unwrap();
    f.close().await.unwrap();
}

fn write_request(id: u32, path: &str, data: Vec<u8>, has_next: bool) -> Request {
    Request::new(
        id,
        RequestPayload::Write {
            path: path.to_string(),
            data,
        },
    )
    .with_next(has_next)
}

#[tokio::test]
async fn test_chunked_write_then_read_round_trip() {
    let (mut session, mut rx, _storage) = start_session();

    // Total size chunk*2 + 1: exactly three chunks each way.
    let chunks = [
        vec![0xA5u8; READ_CHUNK_CAPACITY],
        vec![0x5Au8; READ_CHUNK_CAPACITY],
        vec![0xFFu8; 1],
    ];

    session
        .process(write_request(10, "/int/blob.bin", chunks[0].clone(), true))
        .await;
    assert_no_response(&mut rx);
    session
        .process(write_request(10, "/int/blob.bin", chunks[1].clone(), true))
        .await;
    assert_no_response(&mut rx);
    session
        .process(write_request(10, "/int/blob.bin", chunks[2].clone(), false))
        .await;

    let done = recv(&mut rx).await;
    assert_eq!(done.command_id, 10);
    assert_eq!(done.status, CommandStatus::Ok);
    assert!(!done.has_next);
    assert!(session.is_idle());

    // Read it back: same three chunks, all but the last flagged.
    session
        .process(Request::new(
            11,
            RequestPayload::Read {
                path: "/int/blob.bin".to_string(),
            },
        ))
        .await;

    for (i, expected) in chunks.iter().enumerate() {
        let response = recv(&mut rx).await;
        assert_eq!(response.command_id, 11);
        assert_eq!(response.status, CommandStatus::Ok);
        assert_eq!(response.has_next, i < chunks.len() - 1);
        match response.payload {
            ResponsePayload::Read { data } => assert_eq!(&data, expected),
            other => panic!("expected read payload, got {other:?}"),
        }
    }
    assert_no_response(&mut rx);
}

#[tokio::test]
async fn test_single_chunk_write() {
    let (mut session, mut rx, storage) = start_session();

    session
        .process(write_request(1, "/int/one.txt", b"once".to_vec(), false))
        .await;

    let done = recv(&mut rx).await;
    assert_eq!(done.status, CommandStatus::Ok);
    assert_eq!(storage.stat("/int/one.txt").await.unwrap().size, 4);
}

#[tokio::test]
async fn test_read_of_empty_file_is_one_empty_chunk() {
    let (mut session, mut rx, storage) = start_session();
    write_via_gateway(&storage, "/int/empty.bin", b"").await;

    session
        .process(Request::new(
            2,
            RequestPayload::Read {
                path: "/int/empty.bin".to_string(),
            },
        ))
        .await;

    let response = recv(&mut rx).await;
    assert_eq!(response.status, CommandStatus::Ok);
    assert!(!response.has_next);
    assert_eq!(response.payload, ResponsePayload::Read { data: Vec::new() });
}

#[tokio::test]
async fn test_unrelated_command_interrupts_write() {
    let (mut session, mut rx, storage) = start_session();

    let chunk = vec![0x11u8; READ_CHUNK_CAPACITY];
    session
        .process(write_request(20, "/int/partial.bin", chunk.clone(), true))
        .await;
    assert_no_response(&mut rx);
    assert!(!session.is_idle());

    // Any unrelated command cuts the transfer short.
    session.process(Request::new(21, RequestPayload::Ping)).await;

    let interrupted = recv(&mut rx).await;
    assert_eq!(interrupted.command_id, 20);
    assert_eq!(
        interrupted.status,
        CommandStatus::ErrorContinuousCommandInterrupted
    );

    let pong = recv(&mut rx).await;
    assert_eq!(pong.command_id, 21);
    assert_eq!(pong.status, CommandStatus::Ok);
    assert_eq!(pong.payload, ResponsePayload::Ping);

    // The file was closed at the bytes written so far; the path is free.
    assert!(session.is_idle());
    let info = storage.stat("/int/partial.bin").await.unwrap();
    assert_eq!(info.size, READ_CHUNK_CAPACITY as u64);
    write_via_gateway(&storage, "/int/partial.bin", b"reopenable").await;
}

#[tokio::test]
async fn test_new_write_interrupts_previous_write() {
    let (mut session, mut rx, storage) = start_session();

    session
        .process(write_request(30, "/int/first.bin", vec![1; 8], true))
        .await;
    session
        .process(write_request(31, "/int/second.bin", b"whole".to_vec(), false))
        .await;

    let interrupted = recv(&mut rx).await;
    assert_eq!(interrupted.command_id, 30);
    assert_eq!(
        interrupted.status,
        CommandStatus::ErrorContinuousCommandInterrupted
    );

    let done = recv(&mut rx).await;
    assert_eq!(done.command_id, 31);
    assert_eq!(done.status, CommandStatus::Ok);

    assert_eq!(storage.stat("/int/first.bin").await.unwrap().size, 8);
    assert_eq!(storage.stat("/int/second.bin").await.unwrap().size, 5);
}

#[tokio::test]
async fn test_write_to_invalid_prefix() {
    let (mut session, mut rx, _storage) = start_session();

    session
        .process(write_request(5, "/nowhere/f.bin", vec![0; 4], false))
        .await;

    let response = recv(&mut rx).await;
    assert_eq!(response.status, CommandStatus::ErrorStorageInvalidName);
    assert!(session.is_idle());
}

#[tokio::test]
async fn test_list_pagination_flattens_to_full_content() {
    let (mut session, mut rx, storage) = start_session();

    storage.mkdir("/int/many").await.unwrap();
    let total = 2 * LIST_PAGE_CAPACITY + 20;
    for i in 0..total {
        write_via_gateway(&storage, &format!("/int/many/file{i:03}.txt"), b"x").await;
    }
    // Non-ASCII names are silently skipped.
    write_via_gateway(&storage, "/int/many/файл.txt", b"x").await;

    session
        .process(Request::new(
            40,
            RequestPayload::List {
                path: "/int/many".to_string(),
            },
        ))
        .await;

    let mut collected = Vec::new();
    let mut pages = 0;
    loop {
        let response = recv(&mut rx).await;
        assert_eq!(response.status, CommandStatus::Ok);
        let ResponsePayload::List { files } = response.payload else {
            panic!("expected list payload");
        };
        assert!(files.len() <= LIST_PAGE_CAPACITY);
        collected.extend(files);
        pages += 1;
        if !response.has_next {
            break;
        }
    }

    assert_eq!(pages, 3);
    assert_eq!(collected.len(), total);
    for (i, entry) in collected.iter().enumerate() {
        assert_eq!(entry.name, format!("file{i:03}.txt"));
        assert!(entry.kind.is_file());
    }
}

#[tokio::test]
async fn test_list_empty_directory() {
    let (mut session, mut rx, storage) = start_session();
    storage.mkdir("/int/bare").await.unwrap();

    session
        .process(Request::new(
            41,
            RequestPayload::List {
                path: "/int/bare".to_string(),
            },
        ))
        .await;

    let response = recv(&mut rx).await;
    assert_eq!(response.status, CommandStatus::Ok);
    assert!(!response.has_next);
    assert_eq!(response.payload, ResponsePayload::List { files: Vec::new() });
}

#[tokio::test]
async fn test_root_listing_is_synthesized() {
    let (mut session, mut rx, _storage) = start_session();

    session
        .process(Request::new(
            42,
            RequestPayload::List {
                path: "/".to_string(),
            },
        ))
        .await;

    let response = recv(&mut rx).await;
    let ResponsePayload::List { files } = response.payload else {
        panic!("expected list payload");
    };
    let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["any", "ext", "int"]);
    assert!(files.iter().all(|f| f.kind.is_dir()));
}

#[tokio::test]
async fn test_delete_directory_honors_recursive_flag() {
    let (mut session, mut rx, storage) = start_session();

    storage.mkdir("/int/full").await.unwrap();
    write_via_gateway(&storage, "/int/full/f.txt", b"x").await;

    session
        .process(Request::new(
            50,
            RequestPayload::Delete {
                path: "/int/full".to_string(),
                recursive: false,
            },
        ))
        .await;
    let response = recv(&mut rx).await;
    assert_eq!(response.status, CommandStatus::ErrorStorageDirNotEmpty);
    assert!(storage.dir_exists("/int/full").await);

    session
        .process(Request::new(
            51,
            RequestPayload::Delete {
                path: "/int/full".to_string(),
                recursive: true,
            },
        ))
        .await;
    let response = recv(&mut rx).await;
    assert_eq!(response.status, CommandStatus::Ok);
    assert!(!storage.exists("/int/full").await);
}

#[tokio::test]
async fn test_delete_missing_path() {
    let (mut session, mut rx, _storage) = start_session();

    session
        .process(Request::new(
            52,
            RequestPayload::Delete {
                path: "/int/ghost".to_string(),
                recursive: false,
            },
        ))
        .await;
    let response = recv(&mut rx).await;
    assert_eq!(response.status, CommandStatus::ErrorStorageNotExists);

    // Recursive delete is idempotent: an absent target is a success.
    session
        .process(Request::new(
            53,
            RequestPayload::Delete {
                path: "/int/ghost".to_string(),
                recursive: true,
            },
        ))
        .await;
    let response = recv(&mut rx).await;
    assert_eq!(response.status, CommandStatus::Ok);
}

#[tokio::test]
async fn test_mkdir_fresh_and_existing() {
    let (mut session, mut rx, storage) = start_session();

    session
        .process(Request::new(
            60,
            RequestPayload::Mkdir {
                path: "/int/newdir".to_string(),
            },
        ))
        .await;
    assert_eq!(recv(&mut rx).await.status, CommandStatus::Ok);
    assert!(storage.dir_exists("/int/newdir").await);

    session
        .process(Request::new(
            61,
            RequestPayload::Mkdir {
                path: "/int/newdir".to_string(),
            },
        ))
        .await;
    assert_eq!(recv(&mut rx).await.status, CommandStatus::ErrorStorageExists);
}

#[tokio::test]
async fn test_stat_file_and_missing() {
    let (mut session, mut rx, storage) = start_session();
    write_via_gateway(&storage, "/int/stat_me.txt", b"123456").await;

    session
        .process(Request::new(
            70,
            RequestPayload::Stat {
                path: "/int/stat_me.txt".to_string(),
            },
        ))
        .await;
    let response = recv(&mut rx).await;
    let ResponsePayload::Stat { file } = response.payload else {
        panic!("expected stat payload");
    };
    assert_eq!(file.name, "stat_me.txt");
    assert_eq!(file.size, 6);
    assert!(file.kind.is_file());

    session
        .process(Request::new(
            71,
            RequestPayload::Stat {
                path: "/int/absent.txt".to_string(),
            },
        ))
        .await;
    assert_eq!(
        recv(&mut rx).await.status,
        CommandStatus::ErrorStorageNotExists
    );
}

#[tokio::test]
async fn test_info_reports_capacity() {
    let (mut session, mut rx, _storage) = start_session();

    session
        .process(Request::new(
            80,
            RequestPayload::Info {
                path: "/int/anything".to_string(),
            },
        ))
        .await;
    let response = recv(&mut rx).await;
    let ResponsePayload::Info {
        total_space,
        free_space,
    } = response.payload
    else {
        panic!("expected info payload");
    };
    assert!(total_space > 0);
    assert!(free_space <= total_space);
}

#[tokio::test]
async fn test_rename_through_protocol() {
    let (mut session, mut rx, storage) = start_session();
    write_via_gateway(&storage, "/int/old_name.txt", b"payload").await;

    session
        .process(Request::new(
            90,
            RequestPayload::Rename {
                old_path: "/int/old_name.txt".to_string(),
                new_path: "/int/new_name.txt".to_string(),
            },
        ))
        .await;
    assert_eq!(recv(&mut rx).await.status, CommandStatus::Ok);

    assert!(!storage.exists("/int/old_name.txt").await);
    assert_eq!(storage.stat("/int/new_name.txt").await.unwrap().size, 7);
}

#[tokio::test]
async fn test_checksum_matches_direct_hash() {
    let (mut session, mut rx, storage) = start_session();

    let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    write_via_gateway(&storage, "/int/hash_me.bin", &data).await;

    session
        .process(Request::new(
            100,
            RequestPayload::Checksum {
                path: "/int/hash_me.bin".to_string(),
            },
        ))
        .await;

    let response = recv(&mut rx).await;
    let ResponsePayload::Checksum { digest } = response.payload else {
        panic!("expected checksum payload");
    };
    assert_eq!(digest, hex::encode(blake3::hash(&data).as_bytes()));
}

#[tokio::test]
async fn test_empty_payload_is_a_protocol_failure() {
    let (mut session, mut rx, storage) = start_session();

    // Mid-transfer, a failure report interrupts and is answered with a
    // decode error.
    session
        .process(write_request(110, "/int/cut.bin", vec![7; 16], true))
        .await;
    let mut report = Request::new(110, RequestPayload::Empty);
    report.status = CommandStatus::Error;
    session.process(report).await;

    let interrupted = recv(&mut rx).await;
    assert_eq!(interrupted.command_id, 110);
    assert_eq!(
        interrupted.status,
        CommandStatus::ErrorContinuousCommandInterrupted
    );

    let decode = recv(&mut rx).await;
    assert_eq!(decode.status, CommandStatus::ErrorDecode);

    assert!(session.is_idle());
    assert_eq!(storage.stat("/int/cut.bin").await.unwrap().size, 16);
}
