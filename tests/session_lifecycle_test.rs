//! Integration tests for disconnect, stop and teardown through the controller.

use gpib_daq::hardware::mock::MockInstrument;
use gpib_daq::{
    ChannelSink, DaqError, RunOutcome, Session, SessionController, SessionEvent, SessionStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn controller(instrument: &MockInstrument) -> (SessionController, UnboundedReceiver<SessionEvent>) {
    let session = Arc::new(Session::new("GPIB0::1::INSTR", instrument.factory()));
    let (sink, events) = ChannelSink::new();
    (SessionController::new(session, Arc::new(sink)), events)
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_twice_is_idempotent() {
    let instrument = MockInstrument::new();
    let (controller, _events) = controller(&instrument);
    controller.connect().await.unwrap();

    controller.disconnect().await.unwrap();
    controller.disconnect().await.unwrap();

    assert_eq!(instrument.opened(), 1);
    assert_eq!(instrument.closed(), 1);
    assert!(!controller.is_connected());
    assert_eq!(controller.status(), SessionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_before_connect_is_noop() {
    let instrument = MockInstrument::new();
    let (controller, _events) = controller(&instrument);

    assert_eq!(controller.disconnect().await.unwrap(), None);
    assert_eq!(instrument.closed(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_only_affects_measuring() {
    let instrument = MockInstrument::new();
    let (controller, _events) = controller(&instrument);
    controller.connect().await.unwrap();

    controller.start_unbounded().unwrap();
    assert!(controller.is_measuring());
    controller.stop().unwrap();

    assert!(controller.is_connected());
    assert!(!controller.is_measuring());
    let summary = controller.wait().await.unwrap().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert!(controller.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_disconnected_fails_without_side_effects() {
    let instrument = MockInstrument::new();
    let (controller, _events) = controller(&instrument);

    assert!(matches!(controller.stop(), Err(DaqError::NotConnected)));
    assert!(!controller.is_measuring());
    assert!(!controller.is_connected());
    assert_eq!(controller.status(), SessionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_start_while_disconnected_fails() {
    let instrument = MockInstrument::new();
    let (controller, _events) = controller(&instrument);

    assert!(matches!(
        controller.start_unbounded(),
        Err(DaqError::NotConnected)
    ));
    assert!(matches!(
        controller.start_for_duration(Duration::from_secs(5)),
        Err(DaqError::NotConnected)
    ));
    assert!(!controller.is_measuring());
    assert_eq!(controller.status(), SessionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_duration_run_returns_to_connected() {
    let instrument = MockInstrument::new().with_latency(Duration::from_millis(10));
    let (controller, mut events) = controller(&instrument);
    let mut status = controller.subscribe();
    controller.connect().await.unwrap();

    controller
        .start_for_duration(Duration::from_millis(500))
        .unwrap();
    assert_eq!(*status.borrow_and_update(), SessionStatus::Reading);

    let summary = controller.wait().await.unwrap().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Elapsed);
    assert!(summary.measurements > 0);
    assert_eq!(*status.borrow_and_update(), SessionStatus::Connected);
    assert!(!controller.is_measuring());

    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        assert!(matches!(event, SessionEvent::Measurement(_)));
        count += 1;
    }
    assert_eq!(count, summary.measurements);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_run_publishes_failure() {
    let instrument = MockInstrument::new();
    let (controller, _events) = controller(&instrument);
    controller.connect().await.unwrap();
    let _instrument = instrument.fail_writes(5);

    controller.start_unbounded().unwrap();
    let summary = controller.wait().await.unwrap().unwrap();

    assert_eq!(summary.outcome, RunOutcome::Aborted);
    match controller.status() {
        SessionStatus::Failed(message) => assert!(message.contains("consecutive errors")),
        other => panic!("unexpected status {other:?}"),
    }
    assert!(controller.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_every_handle() {
    let instrument = MockInstrument::new()
        .with_latency(Duration::from_millis(5))
        .queue_reads([gpib_daq::hardware::mock::MockReply::Fail(
            gpib_daq::TransportError::Closed,
        )]);
    let (controller, _events) = controller(&instrument);
    controller.connect().await.unwrap();
    controller.start_unbounded().unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let summary = controller.shutdown().await.unwrap().unwrap();

    assert_eq!(summary.outcome, RunOutcome::Stopped);
    // one reconnect happened during the run
    assert_eq!(instrument.opened(), 2);
    assert_eq!(instrument.open_handles(), 0);
    assert!(!controller.is_connected());
    assert!(!controller.is_measuring());
}

#[tokio::test(start_paused = true)]
async fn test_dropping_controller_releases_handle() {
    let instrument = MockInstrument::new();
    let (controller, _events) = controller(&instrument);
    controller.connect().await.unwrap();
    controller.start_unbounded().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    drop(controller);
    // the aborted worker drops its session reference on its next poll
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(instrument.open_handles(), 0);
}
