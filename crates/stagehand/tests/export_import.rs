//! End-to-end export/import against the emulator: full backup under packet
//! loss, capture-equality on re-import, and cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use stagehand::bus::EventBus;
use stagehand::export::{self, ExportError, ExportMeta};
use stagehand::import::{self, ImportOptions};
use x32osc::mock::{self, MockConsole, MockHandle};
use x32osc::{Broadcast, SessionConfig, SweepPolicy, X32Session};

async fn start(console: MockConsole) -> (MockHandle, Arc<X32Session>, EventBus) {
    let mock = mock::spawn(console).await.unwrap();
    let bus = EventBus::new();
    let config = SessionConfig::new("export-test", "127.0.0.1").with_port(mock.addr.port());
    let session = X32Session::connect(config, bus.sender()).await.unwrap();
    session
        .identity_query(Duration::from_secs(1))
        .await
        .unwrap();
    (mock, session, bus)
}

fn fast_policy() -> SweepPolicy {
    SweepPolicy::default()
        .with_timeout(Duration::from_millis(120))
        .with_attempts(3)
        .with_window(8)
        .with_gap(Duration::ZERO)
        .with_progress_every(100)
}

#[tokio::test]
async fn full_backup_survives_reply_loss() {
    // Roughly 3% uniform reply loss.
    let (_mock, session, bus) = start(MockConsole::new().with_drop_modulus(33)).await;
    let mut events = bus.subscribe();

    let outcome = export::export_console_backup(
        &session,
        &bus,
        ExportMeta::new("Saturday Night", "main rig"),
        fast_policy(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let manifest_len = showfile::Manifest::full_backup().len();
    assert_eq!(outcome.summary.parameter_count, manifest_len);
    // Three attempts against 3% loss leaves at most a few parts per
    // thousand unanswered.
    assert!(
        outcome.summary.error_count <= manifest_len / 200,
        "error_count {} too high",
        outcome.summary.error_count
    );

    let (header, records) = showfile::read(&outcome.text).unwrap();
    assert_eq!(header.firmware, "4.08");
    assert_eq!(header.name, "Saturday Night");
    assert_eq!(records.len(), manifest_len);

    // Progress events flowed with section labels.
    let mut saw_progress = false;
    while let Ok(event) = events.try_recv() {
        if let Broadcast::ExportProgress { total, section, .. } = event {
            assert_eq!(total, manifest_len);
            assert!(!section.is_empty());
            saw_progress = true;
        }
    }
    assert!(saw_progress, "no export progress events were published");
}

#[tokio::test]
async fn reimport_replays_exported_values_verbatim() {
    let (_mock, session, bus) = start(MockConsole::new()).await;

    let outcome = export::export_scene(
        &session,
        &bus,
        ExportMeta::new("Transfer", ""),
        fast_policy(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(outcome.summary.error_count, 0);
    let (_, records) = showfile::read(&outcome.text).unwrap();

    // Push the file into a second, fresh console and capture the writes.
    let (target_mock, target_session, target_bus) = start(MockConsole::new()).await;
    let options = ImportOptions {
        send_gap: Duration::ZERO,
        ..ImportOptions::default()
    };
    let report = import::import_scene(
        &target_session,
        &target_bus,
        &outcome.text,
        &options,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.parameter_count, records.len());
    assert_eq!(report.error_count, 0);
    assert!(!report.uncertain);

    let captured = target_mock.captured().await;
    assert_eq!(captured.len(), records.len());
    for (sent, record) in captured.iter().zip(&records) {
        assert_eq!(sent.address, record.address);
        assert_eq!(sent.args, record.values);
    }
}

#[tokio::test]
async fn canceling_an_export_returns_partial_progress() {
    let (mock, session, bus) = start(MockConsole::new()).await;
    mock.set_reply_delay(Duration::from_millis(10)).await;

    let policy = SweepPolicy::default()
        .with_timeout(Duration::from_millis(500))
        .with_gap(Duration::ZERO);
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let err = export::export_scene(
        &session,
        &bus,
        ExportMeta::new("Aborted", ""),
        policy,
        &cancel,
    )
    .await
    .unwrap_err();

    match err {
        ExportError::Canceled { completed, total } => {
            assert_eq!(total, showfile::Manifest::scene().len());
            // ~10 ms per serial request and a 200 ms budget: around 20
            // entries, generously bounded.
            assert!(completed >= 5 && completed <= 80, "completed {}", completed);
        }
        other => panic!("expected Canceled, got {:?}", other),
    }
}

#[tokio::test]
async fn firmware_mismatch_warns_but_proceeds() {
    let (_mock, session, bus) = start(MockConsole::new()).await;
    let mut events = bus.subscribe();

    let header = showfile::SceneHeader::new("3.11", "Old Desk", "");
    let records = vec![showfile::SceneRecord::new(
        "/ch/01/mix/on",
        vec![x32osc::OscValue::Int(1)],
    )];
    let text = showfile::write(&header, &records);

    let options = ImportOptions {
        send_gap: Duration::ZERO,
        ..ImportOptions::default()
    };
    let report = import::import_scene(
        &session,
        &bus,
        &text,
        &options,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(report.parameter_count, 1);

    let mut warned = false;
    while let Ok(event) = events.try_recv() {
        if let Broadcast::Error { message, warning } = event {
            if message.contains("firmware") {
                assert!(warning);
                warned = true;
            }
        }
    }
    assert!(warned, "no firmware warning was published");
}
