//! Sweep engine tests: input-order results under wide windows, retry and
//! sentinel behavior under loss, cancellation with partial results.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use x32osc::mock::{self, MockConsole, MockHandle};
use x32osc::{sweep, OscValue, SessionConfig, SweepError, SweepPolicy, X32Session};

async fn start(console: MockConsole) -> (MockHandle, Arc<X32Session>) {
    let handle = mock::spawn(console).await.unwrap();
    let (events_tx, _events_rx) = broadcast::channel(256);
    let config = SessionConfig::new("sweep-test", "127.0.0.1").with_port(handle.addr.port());
    let session = X32Session::connect(config, events_tx).await.unwrap();
    (handle, session)
}

fn fader_addresses(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("/ch/{:02}/mix/{:02}/level", i / 16 + 1, i % 16 + 1))
        .collect()
}

#[tokio::test]
async fn results_align_with_input_under_wide_window() {
    let (handle, session) = start(MockConsole::new()).await;
    let addresses = fader_addresses(50);
    // Force retries on every fifth address so completion order inside the
    // window scrambles.
    for address in addresses.iter().step_by(5) {
        handle.drop_first_replies(address, 1).await;
    }

    let policy = SweepPolicy::default()
        .with_timeout(Duration::from_millis(100))
        .with_attempts(3)
        .with_window(8)
        .with_gap(Duration::ZERO);
    let cancel = CancellationToken::new();
    let results = sweep(&session, &addresses, &policy, |_, _| {}, &cancel)
        .await
        .unwrap();

    assert_eq!(results.len(), addresses.len());
    for (item, address) in results.iter().zip(&addresses) {
        assert_eq!(&item.address, address);
        assert_eq!(item.values, Some(vec![OscValue::Float(0.0)]));
    }
}

#[tokio::test]
async fn drops_below_attempt_budget_still_resolve() {
    let (handle, session) = start(MockConsole::new()).await;
    handle.seed("/bus/01/mix/fader", vec![OscValue::Float(0.8)]).await;
    handle.drop_first_replies("/bus/01/mix/fader", 2).await;

    let addresses = vec!["/bus/01/mix/fader".to_string()];
    let policy = SweepPolicy::default()
        .with_timeout(Duration::from_millis(80))
        .with_attempts(3)
        .with_gap(Duration::ZERO);
    let cancel = CancellationToken::new();
    let results = sweep(&session, &addresses, &policy, |_, _| {}, &cancel)
        .await
        .unwrap();

    assert_eq!(results[0].values, Some(vec![OscValue::Float(0.8)]));
}

#[tokio::test]
async fn exhausted_retries_record_sentinel_and_continue() {
    let (handle, session) = start(MockConsole::new()).await;
    handle.drop_first_replies("/bus/02/mix/fader", 10).await;

    let addresses = vec![
        "/bus/01/mix/fader".to_string(),
        "/bus/02/mix/fader".to_string(),
        "/bus/03/mix/fader".to_string(),
    ];
    let policy = SweepPolicy::default()
        .with_timeout(Duration::from_millis(60))
        .with_attempts(3)
        .with_gap(Duration::ZERO);
    let cancel = CancellationToken::new();
    let results = sweep(&session, &addresses, &policy, |_, _| {}, &cancel)
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert!(!results[0].is_missing());
    assert!(results[1].is_missing());
    assert!(!results[2].is_missing());
}

#[tokio::test]
async fn progress_fires_at_cadence() {
    let (_handle, session) = start(MockConsole::new()).await;
    let addresses = fader_addresses(30);

    let policy = SweepPolicy::default()
        .with_gap(Duration::ZERO)
        .with_progress_every(10);
    let cancel = CancellationToken::new();
    let mut reports = Vec::new();
    sweep(
        &session,
        &addresses,
        &policy,
        |completed, total| reports.push((completed, total)),
        &cancel,
    )
    .await
    .unwrap();

    assert_eq!(reports, vec![(10, 30), (20, 30), (30, 30)]);
}

#[tokio::test]
async fn cancel_returns_partial_prefix() {
    let (handle, session) = start(MockConsole::new()).await;
    handle.set_reply_delay(Duration::from_millis(10)).await;
    let addresses = fader_addresses(200);

    let policy = SweepPolicy::default()
        .with_timeout(Duration::from_millis(500))
        .with_gap(Duration::ZERO);
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let err = sweep(&session, &addresses, &policy, |_, _| {}, &cancel)
        .await
        .unwrap_err();
    match err {
        SweepError::Canceled { partial, total } => {
            assert_eq!(total, 200);
            assert!(!partial.is_empty(), "nothing completed before cancel");
            assert!(partial.len() < 200, "sweep ran to completion");
            for (item, address) in partial.iter().zip(&addresses) {
                assert_eq!(&item.address, address);
            }
        }
        other => panic!("expected Canceled, got {:?}", other),
    }
}

#[tokio::test]
async fn closed_session_surfaces_session_lost() {
    let (handle, session) = start(MockConsole::new()).await;
    handle.set_reply_delay(Duration::from_millis(20)).await;
    let addresses = fader_addresses(100);

    let policy = SweepPolicy::default().with_gap(Duration::ZERO);
    let cancel = CancellationToken::new();

    let sweeper = {
        let session = session.clone();
        let addresses = addresses.clone();
        let policy = policy.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { sweep(&session, &addresses, &policy, |_, _| {}, &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    session.close().await;

    match sweeper.await.unwrap() {
        Err(SweepError::SessionLost { total, .. }) => assert_eq!(total, 100),
        other => panic!("expected SessionLost, got {:?}", other.map(|r| r.len())),
    }
}
