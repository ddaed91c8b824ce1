//! End-to-end tests of the engine through the public gateway.

use std::time::Duration;

use tokio::sync::broadcast;

use tansu_storage::backend::{DiskBackend, SimCard, SimulatedSlot};
use tansu_storage::{
    AccessMode, Config, OpenMode, Storage, StorageEngine, StorageError, StorageEvent,
    StorageStatus,
};

fn fast_config() -> Config {
    Config {
        tick_period: Duration::from_millis(20),
        mount_retry_count: 4,
        mount_retry_delay: Duration::from_millis(1),
        ..Config::default()
    }
}

fn start() -> (Storage, std::sync::Arc<SimulatedSlot>) {
    StorageEngine::start_simulated(fast_config())
}

async fn wait_event(rx: &mut broadcast::Receiver<StorageEvent>, want: StorageEvent) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if rx.recv().await.unwrap() == want {
                break;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
}

async fn write_file(storage: &Storage, path: &str, data: &[u8]) {
    let mut f = storage
        .open_file(path, AccessMode::write(), OpenMode::create_always())
        .await
        .unwrap();
    f.write(data).await.unwrap();
    f.close().await.unwrap();
}

async fn read_file(storage: &Storage, path: &str) -> Vec<u8> {
    let mut f = storage
        .open_file(path, AccessMode::read(), OpenMode::open_existing())
        .await
        .unwrap();
    let mut out = Vec::new();
    loop {
        let chunk = f.read(64).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    f.close().await.unwrap();
    out
}

#[tokio::test]
async fn test_write_read_roundtrip() {
    let (storage, _slot) = start();

    storage.mkdir("/int/docs").await.unwrap();
    write_file(&storage, "/int/docs/note.txt", b"hello tansu").await;

    let info = storage.stat("/int/docs/note.txt").await.unwrap();
    assert!(info.is_file());
    assert_eq!(info.size, 11);

    assert_eq!(read_file(&storage, "/int/docs/note.txt").await, b"hello tansu");
}

#[tokio::test]
async fn test_invalid_prefix_is_rejected_without_backend() {
    let (storage, _slot) = start();

    for path in ["/sd/file", "relative/path", "/internal/x"] {
        let err = storage.stat(path).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidName(_)), "{path}");
    }
}

#[tokio::test]
async fn test_any_alias_follows_card_health() {
    let (storage, slot) = start();
    let mut events = storage.subscribe();

    // No card: /any lands on internal flash.
    write_file(&storage, "/any/a.txt", b"flash").await;
    assert!(storage.file_exists("/int/a.txt").await);

    slot.insert(SimCard::formatted("CARD"));
    wait_event(&mut events, StorageEvent::CardMounted).await;

    // Card healthy: /any lands on it.
    write_file(&storage, "/any/b.txt", b"card").await;
    assert!(storage.file_exists("/ext/b.txt").await);
    assert!(!storage.file_exists("/int/b.txt").await);
}

#[tokio::test]
async fn test_second_open_blocks_until_close() {
    let (storage, _slot) = start();
    write_file(&storage, "/int/contended.txt", b"x").await;

    let first = storage
        .open_file("/int/contended.txt", AccessMode::read(), OpenMode::open_existing())
        .await
        .unwrap();

    let contender = {
        let storage = storage.clone();
        tokio::spawn(async move {
            storage
                .open_file("/int/contended.txt", AccessMode::read(), OpenMode::open_existing())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!contender.is_finished(), "second open must wait, not fail");

    first.close().await.unwrap();

    let second = tokio::time::timeout(Duration::from_secs(5), contender)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_remove_of_open_path_reports_already_open() {
    let (storage, _slot) = start();
    write_file(&storage, "/int/busy.txt", b"x").await;

    let f = storage
        .open_file("/int/busy.txt", AccessMode::read(), OpenMode::open_existing())
        .await
        .unwrap();

    let err = storage.remove("/int/busy.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::AlreadyOpen(_)));

    f.close().await.unwrap();
    storage.remove("/int/busy.txt").await.unwrap();
}

#[tokio::test]
async fn test_dropped_handle_releases_path() {
    let (storage, _slot) = start();
    write_file(&storage, "/int/dropme.txt", b"x").await;

    {
        let _f = storage
            .open_file("/int/dropme.txt", AccessMode::read(), OpenMode::open_existing())
            .await
            .unwrap();
        // Dropped without close().
    }

    // The background close lands; a fresh open must succeed.
    let f = tokio::time::timeout(
        Duration::from_secs(5),
        storage.open_file("/int/dropme.txt", AccessMode::read(), OpenMode::open_existing()),
    )
    .await
    .unwrap()
    .unwrap();
    f.close().await.unwrap();
}

#[tokio::test]
async fn test_card_removal_with_open_file() {
    let (storage, slot) = start();
    let mut events = storage.subscribe();

    slot.insert(SimCard::formatted("CARD"));
    wait_event(&mut events, StorageEvent::CardMounted).await;

    let mut f = storage
        .open_file("/ext/live.txt", AccessMode::read_write(), OpenMode::create_always())
        .await
        .unwrap();
    f.write(b"before").await.unwrap();

    slot.eject();
    wait_event(&mut events, StorageEvent::CardUnmounted).await;

    // The stale handle surfaces a backend error.
    let err = f.write(b"after").await.unwrap_err();
    assert!(matches!(err, StorageError::NotReady));

    assert_eq!(storage.card_status().await.unwrap(), StorageStatus::NotReady);

    // Exactly one unmount event for one removal.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let mut extra_unmounts = 0;
    while let Ok(event) = events.try_recv() {
        if event == StorageEvent::CardUnmounted {
            extra_unmounts += 1;
        }
    }
    assert_eq!(extra_unmounts, 0);
}

#[tokio::test]
async fn test_unformatted_card_then_format() {
    let (storage, slot) = start();
    let mut events = storage.subscribe();

    slot.insert(SimCard::unformatted());
    wait_event(&mut events, StorageEvent::CardMounted).await;
    assert_eq!(
        storage.card_status().await.unwrap(),
        StorageStatus::NoFilesystem
    );

    let err = storage.stat("/ext/x").await.unwrap_err();
    assert!(matches!(err, StorageError::NotReady));

    storage.card_format().await.unwrap();
    assert_eq!(storage.card_status().await.unwrap(), StorageStatus::Ok);

    write_file(&storage, "/ext/x", b"works now").await;
    let info = storage.card_info().await.unwrap();
    assert_eq!(info.label, "TANSU SD");
}

#[tokio::test]
async fn test_explicit_unmount_then_mount() {
    let (storage, slot) = start();
    let mut events = storage.subscribe();

    slot.insert(SimCard::formatted("CARD"));
    wait_event(&mut events, StorageEvent::CardMounted).await;

    storage.card_unmount().await.unwrap();
    assert_eq!(storage.card_status().await.unwrap(), StorageStatus::NotReady);

    // The tick leaves an explicitly unmounted card alone; an explicit
    // mount brings it back.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(storage.card_status().await.unwrap(), StorageStatus::NotReady);

    storage.card_mount().await.unwrap();
    assert_eq!(storage.card_status().await.unwrap(), StorageStatus::Ok);
    wait_event(&mut events, StorageEvent::CardMounted).await;
}

#[tokio::test]
async fn test_timestamp_marks_mutation() {
    let (storage, _slot) = start();

    let before = storage.timestamp("/int/anything").await.unwrap();
    write_file(&storage, "/int/stamped.txt", b"x").await;
    let after = storage.timestamp("/int/anything").await.unwrap();
    assert!(after > before);

    // Reads do not move the marker.
    let _ = read_file(&storage, "/int/stamped.txt").await;
    assert_eq!(storage.timestamp("/int/anything").await.unwrap(), after);
}

#[tokio::test]
async fn test_resolve_path_aliases() {
    let (storage, slot) = start();
    let mut events = storage.subscribe();
    slot.insert(SimCard::formatted("CARD"));
    wait_event(&mut events, StorageEvent::CardMounted).await;

    let resolved = storage
        .resolve_path("/data/config.txt", "sampleapp", true)
        .await
        .unwrap();
    assert_eq!(resolved, "/ext/apps_data/sampleapp/config.txt");
    assert!(storage.dir_exists("/ext/apps_data/sampleapp").await);

    let resolved = storage
        .resolve_path("/assets/sprites.bin", "sampleapp", false)
        .await
        .unwrap();
    assert_eq!(resolved, "/ext/apps_assets/sampleapp/sprites.bin");

    // Non-alias paths pass through untouched.
    let resolved = storage.resolve_path("/int/raw.txt", "app", true).await.unwrap();
    assert_eq!(resolved, "/int/raw.txt");
}

// ── Recursive operation library ─────────────────────────────────────────

async fn build_tree(storage: &Storage) {
    storage.mkdir("/int/tree").await.unwrap();
    storage.mkdir("/int/tree/sub").await.unwrap();
    storage.mkdir("/int/tree/sub/deep").await.unwrap();
    write_file(storage, "/int/tree/a.txt", b"aaa").await;
    write_file(storage, "/int/tree/sub/b.txt", b"bbb").await;
    write_file(storage, "/int/tree/sub/deep/c.txt", b"ccc").await;
}

#[tokio::test]
async fn test_copy_directory_tree() {
    let (storage, _slot) = start();
    build_tree(&storage).await;

    storage.copy("/int/tree", "/int/copy").await.unwrap();

    assert_eq!(read_file(&storage, "/int/copy/a.txt").await, b"aaa");
    assert_eq!(read_file(&storage, "/int/copy/sub/b.txt").await, b"bbb");
    assert_eq!(read_file(&storage, "/int/copy/sub/deep/c.txt").await, b"ccc");
    // Source intact.
    assert!(storage.file_exists("/int/tree/a.txt").await);
}

#[tokio::test]
async fn test_copy_over_existing_file_fails() {
    let (storage, _slot) = start();
    write_file(&storage, "/int/src.txt", b"src").await;
    write_file(&storage, "/int/dst.txt", b"dst").await;

    let err = storage.copy("/int/src.txt", "/int/dst.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::Exists(_)));
    assert_eq!(read_file(&storage, "/int/dst.txt").await, b"dst");
}

#[tokio::test]
async fn test_merge_picks_free_sibling_name() {
    let (storage, _slot) = start();
    write_file(&storage, "/int/report.txt", b"new").await;
    storage.mkdir("/int/out").await.unwrap();
    write_file(&storage, "/int/out/report.txt", b"old").await;

    storage
        .merge("/int/report.txt", "/int/out/report.txt")
        .await
        .unwrap();

    assert_eq!(read_file(&storage, "/int/out/report.txt").await, b"old");
    assert_eq!(read_file(&storage, "/int/out/report1.txt").await, b"new");
}

#[tokio::test]
async fn test_merge_directories_unions_content() {
    let (storage, _slot) = start();
    storage.mkdir("/int/a").await.unwrap();
    storage.mkdir("/int/b").await.unwrap();
    write_file(&storage, "/int/a/only_a.txt", b"a").await;
    write_file(&storage, "/int/b/only_b.txt", b"b").await;

    storage.merge("/int/a", "/int/b").await.unwrap();

    assert!(storage.file_exists("/int/b/only_a.txt").await);
    assert!(storage.file_exists("/int/b/only_b.txt").await);
}

#[tokio::test]
async fn test_rename_moves_tree() {
    let (storage, _slot) = start();
    build_tree(&storage).await;

    storage.rename("/int/tree", "/int/renamed").await.unwrap();

    assert!(!storage.exists("/int/tree").await);
    assert_eq!(
        read_file(&storage, "/int/renamed/sub/deep/c.txt").await,
        b"ccc"
    );
}

#[tokio::test]
async fn test_remove_recursive_and_idempotency() {
    let (storage, _slot) = start();
    build_tree(&storage).await;

    // Plain remove refuses a non-empty directory.
    let err = storage.remove("/int/tree").await.unwrap_err();
    assert!(matches!(err, StorageError::Denied(_)));

    storage.remove_recursive("/int/tree").await.unwrap();
    assert!(!storage.exists("/int/tree").await);

    // Removing an absent path reports success.
    storage.remove_recursive("/int/tree").await.unwrap();
    storage.remove_recursive("/int/never_existed").await.unwrap();
}

#[tokio::test]
async fn test_dir_is_empty() {
    let (storage, _slot) = start();
    storage.mkdir("/int/empty").await.unwrap();
    storage.mkdir("/int/full").await.unwrap();
    write_file(&storage, "/int/full/f.txt", b"x").await;

    assert!(storage.dir_is_empty("/int/empty").await.unwrap());
    assert!(!storage.dir_is_empty("/int/full").await.unwrap());
}

#[tokio::test]
async fn test_next_file_name_counts_up() {
    let (storage, _slot) = start();
    storage.mkdir("/int/shots").await.unwrap();

    let name = storage
        .next_file_name("/int/shots", "shot", ".bmp")
        .await
        .unwrap();
    assert_eq!(name, "shot");

    write_file(&storage, "/int/shots/shot.bmp", b"0").await;
    write_file(&storage, "/int/shots/shot1.bmp", b"1").await;

    let name = storage
        .next_file_name("/int/shots", "shot", ".bmp")
        .await
        .unwrap();
    assert_eq!(name, "shot2");
}

#[tokio::test]
async fn test_mkdir_scenarios() {
    let (storage, _slot) = start();

    storage.mkdir("/int/fresh").await.unwrap();
    assert!(storage.dir_exists("/int/fresh").await);

    let err = storage.mkdir("/int/fresh").await.unwrap_err();
    assert!(matches!(err, StorageError::Exists(_)));

    storage.ensure_dir("/int/fresh").await.unwrap();
}

#[tokio::test]
async fn test_engine_over_disk_backend() {
    let dir = tempfile::tempdir().unwrap();
    let slot = std::sync::Arc::new(SimulatedSlot::new());
    let storage = StorageEngine::start(
        fast_config(),
        std::sync::Arc::new(DiskBackend::new(dir.path())),
        slot,
    );

    storage.mkdir("/int/docs").await.unwrap();
    write_file(&storage, "/int/docs/on_disk.txt", b"persisted").await;
    assert_eq!(
        read_file(&storage, "/int/docs/on_disk.txt").await,
        b"persisted"
    );
    assert!(dir.path().join("docs/on_disk.txt").exists());

    // Free-space queries are unsupported on disk-backed volumes.
    let err = storage.fs_info("/int/docs").await.unwrap_err();
    assert!(matches!(err, StorageError::NotImplemented));
}

#[tokio::test]
async fn test_fs_info_reports_space() {
    let (storage, _slot) = start();
    write_file(&storage, "/int/blob.bin", &[0u8; 4096]).await;

    let info = storage.fs_info("/int/blob.bin").await.unwrap();
    assert!(info.total_space > 0);
    assert!(info.free_space <= info.total_space - 4096);
}
