//! Scene store tests: slot enumeration, device/disk merge, sandboxing,
//! save/delete/load/backup against the emulator.

use std::time::Duration;

use tempfile::TempDir;

use stagehand::bus::EventBus;
use stagehand::store::{SceneOrigin, SceneStore, StoreError};
use x32osc::mock::{self, MockConsole, MockHandle};
use x32osc::{Broadcast, SessionConfig, X32Session};

async fn fixture(console: MockConsole) -> (MockHandle, EventBus, TempDir, SceneStore) {
    let mock = mock::spawn(console).await.unwrap();
    let bus = EventBus::new();
    let config = SessionConfig::new("store-test", "127.0.0.1").with_port(mock.addr.port());
    let session = X32Session::connect(config, bus.sender()).await.unwrap();
    // One round trip so list() sees a live session.
    session
        .identity_query(Duration::from_secs(1))
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    let store = SceneStore::open(
        dir.path(),
        stagehand::shared_session(session),
        bus.clone(),
    )
    .unwrap();
    (mock, bus, dir, store)
}

#[tokio::test]
async fn list_skips_empty_device_slots() {
    let mut console = MockConsole::new();
    console.seed_scene_slot(0, "Opener", "");
    // Slot 1 stays unnamed; the emulator answers its header queries with
    // empty strings like a real console.
    console.seed_scene_slot(2, "Encore", "");
    let (_mock, _bus, _dir, store) = fixture(console).await;

    let scenes = store.list().await.unwrap();
    assert_eq!(scenes.len(), 2);
    assert_eq!(scenes[0].id, "device-0");
    assert_eq!(scenes[0].name, "Opener");
    assert_eq!(scenes[0].slot, Some(0));
    assert_eq!(scenes[0].origin, SceneOrigin::Device);
    assert_eq!(scenes[1].id, "device-2");
    assert_eq!(scenes[1].name, "Encore");
}

#[tokio::test]
async fn device_slot_and_backup_file_merge_by_name() {
    let mut console = MockConsole::new();
    console.seed_scene_slot(3, "FOH", "front of house");
    let (_mock, _bus, dir, store) = fixture(console).await;

    let header = showfile::SceneHeader::new("4.08", "foh", "");
    std::fs::write(dir.path().join("foh.scn"), showfile::write(&header, &[])).unwrap();

    let scenes = store.list().await.unwrap();
    assert_eq!(scenes.len(), 1, "device slot and file did not merge");
    let merged = &scenes[0];
    assert_eq!(merged.id, "device-3");
    assert_eq!(merged.name, "FOH");
    assert_eq!(merged.origin, SceneOrigin::Both);
    assert!(merged.has_backup);
    assert!(merged.modified.is_some());
    assert_eq!(merged.file.as_deref(), Some("foh.scn"));
}

#[tokio::test]
async fn save_creates_template_and_delete_removes_it() {
    let (_mock, _bus, dir, store) = fixture(MockConsole::new()).await;

    let entry = store.save("Mix A", "rehearsal starting point").await.unwrap();
    assert_eq!(entry.id, "local-Mix A");
    assert_eq!(entry.origin, SceneOrigin::Local);
    assert_eq!(entry.notes, "rehearsal starting point");

    let path = dir.path().join("Mix A.scn");
    let (header, records) = showfile::read(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(header.name, "Mix A");
    assert_eq!(header.notes, "rehearsal starting point");
    assert!(records.is_empty());

    store.delete("local-Mix A").await.unwrap();
    assert!(!path.exists());
    assert!(matches!(
        store.get("local-Mix A").await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn sandbox_rejects_traversal_and_leaves_disk_untouched() {
    let (_mock, _bus, dir, store) = fixture(MockConsole::new()).await;

    let err = store.save("../etc/passwd", "").await.unwrap_err();
    assert!(matches!(err, StoreError::PathEscape));

    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "sandbox gained files: {:?}", leftovers);
}

#[tokio::test]
async fn deleting_device_slots_is_unsupported() {
    let mut console = MockConsole::new();
    console.seed_scene_slot(5, "Keeper", "");
    let (_mock, _bus, _dir, store) = fixture(console).await;

    let err = store.delete("device-5").await.unwrap_err();
    assert!(matches!(err, StoreError::Unsupported(_)));
}

#[tokio::test]
async fn loading_a_device_slot_recalls_it() {
    let mut console = MockConsole::new();
    console.seed_scene_slot(9, "Encore", "");
    let (mock, bus, _dir, store) = fixture(console).await;
    let mut events = bus.subscribe();

    let report = store.load("device-9").await.unwrap();
    assert!(report.is_none(), "device recall produced an import report");
    assert_eq!(mock.current_scene().await, 9);

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no scene_loaded event")
            .unwrap();
        if let Broadcast::SceneLoaded { slot, .. } = event {
            assert_eq!(slot, Some(9));
            break;
        }
    }
}

#[tokio::test]
async fn backup_writes_the_slot_into_the_sandbox() {
    let mut console = MockConsole::new();
    console.seed_scene_slot(1, "Opener", "walk-in music");
    let (_mock, _bus, dir, store) = fixture(console).await;

    let entry = store.backup("device-1").await.unwrap();
    assert_eq!(entry.origin, SceneOrigin::Both);
    assert!(entry.has_backup);

    let text = std::fs::read_to_string(dir.path().join("Opener.scn")).unwrap();
    let (header, records) = showfile::read(&text).unwrap();
    assert_eq!(header.name, "Opener");
    assert_eq!(header.notes, "walk-in music");
    assert_eq!(records.len(), showfile::Manifest::scene().len());
}

#[tokio::test]
async fn mutation_refreshes_the_cached_list() {
    let (_mock, _bus, _dir, store) = fixture(MockConsole::new()).await;

    assert!(store.list().await.unwrap().is_empty());
    store.save("Soundcheck", "").await.unwrap();
    // The save invalidated the (sub-second-old) cached empty list.
    let scenes = store.list().await.unwrap();
    assert_eq!(scenes.len(), 1);
    assert_eq!(scenes[0].name, "Soundcheck");
}
