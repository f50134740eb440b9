//! Integration tests for the measurement loop: duration runs, stop, error budget and
//! reconnect behaviour.

use gpib_daq::hardware::mock::{MockInstrument, MockReply};
use gpib_daq::policy::{SessionPolicy, READ_QUERY};
use gpib_daq::{
    ChannelSink, FailureKind, ReadLoop, RunOutcome, Session, SessionEvent, TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

async fn connected(instrument: &MockInstrument, policy: SessionPolicy) -> Arc<Session> {
    let session = Arc::new(Session::new("GPIB0::1::INSTR", instrument.factory()).with_policy(policy));
    session.connect().await.unwrap();
    session
}

fn no_reconnect() -> SessionPolicy {
    SessionPolicy {
        max_reconnects: 0,
        ..SessionPolicy::default()
    }
}

fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn readings(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Measurement(m) => Some(m.reading.clone()),
            SessionEvent::Failure(_) => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_duration_run_emits_prefix_of_responses() {
    let responses: Vec<String> = (0..100).map(|i| format!("+{i}.000000E-09")).collect();
    let instrument = MockInstrument::new()
        .with_latency(Duration::from_millis(45))
        .queue_readings(responses.clone());
    let session = connected(&instrument, SessionPolicy::default()).await;
    let (sink, mut events) = ChannelSink::new();

    let summary = ReadLoop::run_for_duration(Arc::clone(&session), Arc::new(sink), Duration::from_secs(2))
        .await
        .unwrap();

    let got = readings(&drain(&mut events));
    assert_eq!(summary.outcome, RunOutcome::Elapsed);
    assert_eq!(summary.failures, 0);
    assert_eq!(got.len() as u64, summary.measurements);
    assert!(!got.is_empty() && got.len() < responses.len());
    assert_eq!(got[..], responses[..got.len()]);
    assert!(!session.is_measuring());
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_stop_ends_run_and_keeps_connection() {
    let instrument = MockInstrument::new().with_latency(Duration::from_millis(20));
    let session = connected(&instrument, SessionPolicy::default()).await;
    let (sink, mut events) = ChannelSink::new();

    let run = ReadLoop::begin(Arc::clone(&session), Arc::new(sink)).unwrap();
    let worker = tokio::spawn(run.run_for_duration(Duration::from_secs(3600)));

    for _ in 0..3 {
        assert!(matches!(events.recv().await, Some(SessionEvent::Measurement(_))));
    }
    session.request_stop().unwrap();
    let summary = worker.await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert!(summary.measurements >= 3);
    assert!(!session.is_measuring());
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_worker_starts_is_observed() {
    let instrument = MockInstrument::new();
    let session = connected(&instrument, SessionPolicy::default()).await;
    let (sink, _events) = ChannelSink::new();

    let run = ReadLoop::begin(Arc::clone(&session), Arc::new(sink)).unwrap();
    session.request_stop().unwrap();
    let summary = run.run_unbounded().await;

    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(summary.measurements, 0);
    assert_eq!(instrument.writes_of(READ_QUERY), 0);
}

#[tokio::test(start_paused = true)]
async fn test_four_failures_do_not_abort_and_counter_resets() {
    let fail = || MockReply::Fail(TransportError::Io("EOI not asserted".into()));
    let instrument = MockInstrument::new().queue_reads([
        fail(),
        fail(),
        fail(),
        fail(),
        MockReply::line("first"),
        fail(),
        MockReply::line("second"),
    ]);
    let session = connected(&instrument, no_reconnect()).await;
    let (sink, mut events) = ChannelSink::new();

    let run = ReadLoop::begin(Arc::clone(&session), Arc::new(sink)).unwrap();
    let worker = tokio::spawn(run.run_unbounded());

    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let done = matches!(&event, SessionEvent::Measurement(m) if m.reading == "second");
        seen.push(event);
        if done {
            break;
        }
    }
    session.request_stop().unwrap();
    let summary = worker.await.unwrap();

    let counters: Vec<u32> = seen
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Failure(f) => Some(f.consecutive_errors),
            SessionEvent::Measurement(_) => None,
        })
        .collect();
    assert_eq!(counters, [1, 2, 3, 4, 1]);
    assert!(seen.iter().all(|event| match event {
        SessionEvent::Failure(f) => f.kind == FailureKind::Read && !f.terminal,
        SessionEvent::Measurement(_) => true,
    }));
    assert_eq!(readings(&seen), ["first", "second"]);
    assert_eq!(summary.outcome, RunOutcome::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_five_failures_abort_with_one_terminal_event() {
    let instrument = MockInstrument::new();
    let session = connected(&instrument, SessionPolicy::default()).await;
    let instrument = instrument.fail_writes(5);
    let (sink, mut events) = ChannelSink::new();

    let summary = ReadLoop::run_unbounded(Arc::clone(&session), Arc::new(sink))
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Aborted);
    assert!(!session.is_measuring());
    assert!(session.is_connected());

    let events = drain(&mut events);
    assert_eq!(events.len(), 6);
    let terminal: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Failure(f) if f.terminal => Some(f),
            _ => None,
        })
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].kind, FailureKind::LoopAbort);
    assert!(terminal[0].message.contains("5 consecutive errors"));
    assert!(matches!(events.last(), Some(SessionEvent::Failure(f)) if f.terminal));

    // Write failures never reconnect
    assert_eq!(instrument.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_read_backoff_grows_between_failed_cycles() {
    let instrument = MockInstrument::new();
    let session = connected(&instrument, no_reconnect()).await;
    let instrument = instrument.fail_writes(4);
    let (sink, mut events) = ChannelSink::new();

    let run = ReadLoop::begin(Arc::clone(&session), Arc::new(sink)).unwrap();
    let started = tokio::time::Instant::now();
    let worker = tokio::spawn(run.run_unbounded());

    // 4 failures: 200 + 400 + 800 + 1600 ms of backoff plus the iteration delays
    loop {
        if let Some(SessionEvent::Measurement(_)) = events.recv().await {
            break;
        }
    }
    let elapsed = started.elapsed();
    session.request_stop().unwrap();
    worker.await.unwrap();

    assert!(elapsed >= Duration::from_millis(3000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(3100), "{elapsed:?}");
    assert!(instrument.writes_of(READ_QUERY) >= 5);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_recovers_transparently() {
    let instrument = MockInstrument::new().queue_reads([
        MockReply::line("before"),
        MockReply::Fail(TransportError::Closed),
        MockReply::line("after"),
    ]);
    let session = connected(&instrument, SessionPolicy::default()).await;
    let (sink, mut events) = ChannelSink::new();

    let run = ReadLoop::begin(Arc::clone(&session), Arc::new(sink)).unwrap();
    let worker = tokio::spawn(run.run_unbounded());

    let mut got = Vec::new();
    while got.len() < 2 {
        match events.recv().await {
            Some(SessionEvent::Measurement(m)) => got.push(m.reading),
            other => panic!("unexpected event {other:?}"),
        }
    }
    session.request_stop().unwrap();
    let summary = worker.await.unwrap();

    assert_eq!(got, ["before", "after"]);
    assert_eq!(summary.failures, 0);
    assert_eq!(instrument.opened(), 2);
    assert_eq!(instrument.open_handles(), 1);
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_reconnects_still_count_toward_budget() {
    let instrument = MockInstrument::new();
    let session = connected(&instrument, SessionPolicy::default()).await;
    let instrument = instrument.read_fallback(MockReply::Hang);
    let (sink, mut events) = ChannelSink::new();

    let summary = ReadLoop::run_unbounded(Arc::clone(&session), Arc::new(sink))
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Aborted);
    assert_eq!(summary.failures, 5);
    // one initial handle plus three reconnects per failed cycle
    assert_eq!(instrument.opened(), 1 + 5 * 3);
    assert_eq!(instrument.open_handles(), 1);

    let kinds: Vec<FailureKind> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::Failure(f) => Some(f.kind),
            SessionEvent::Measurement(_) => None,
        })
        .collect();
    assert_eq!(
        kinds,
        [
            FailureKind::Timeout,
            FailureKind::Timeout,
            FailureKind::Timeout,
            FailureKind::Timeout,
            FailureKind::Timeout,
            FailureKind::LoopAbort,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_read_failing_after_stop_is_still_reported() {
    let instrument = MockInstrument::new();
    let session = connected(&instrument, SessionPolicy::default()).await;
    let instrument = instrument.read_fallback(MockReply::Hang);
    let (sink, mut events) = ChannelSink::new();

    let run = ReadLoop::begin(Arc::clone(&session), Arc::new(sink)).unwrap();
    let worker = tokio::spawn(run.run_unbounded());

    // stop lands while the first read is in flight; it times out on its own at 1000 ms
    tokio::time::sleep(Duration::from_millis(500)).await;
    session.request_stop().unwrap();
    let summary = worker.await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(summary.failures, 1);
    let events = drain(&mut events);
    assert_eq!(events.len(), 1);
    match &events[0] {
        SessionEvent::Failure(f) => {
            assert_eq!(f.kind, FailureKind::Timeout);
            assert_eq!(f.consecutive_errors, 1);
            assert!(!f.terminal);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // the timed-out handle is replaced instead of carrying a late response
    assert_eq!(instrument.opened(), 2);
    assert_eq!(instrument.open_handles(), 1);
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_reconnect_reports_the_cycle_once() {
    let instrument = MockInstrument::new();
    let session = connected(&instrument, SessionPolicy::default()).await;
    let instrument = instrument.read_fallback(MockReply::Hang);
    let (sink, mut events) = ChannelSink::new();

    let run = ReadLoop::begin(Arc::clone(&session), Arc::new(sink)).unwrap();
    let worker = tokio::spawn(run.run_unbounded());

    // first read times out at 1000 ms; stop while the first reconnect is in progress
    tokio::time::sleep(Duration::from_millis(1500)).await;
    session.request_stop().unwrap();
    let summary = worker.await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(summary.failures, 1);
    let failures: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, SessionEvent::Failure(_)))
        .collect();
    assert_eq!(failures.len(), 1);
    // initial handle, one reconnect, one replacement after the stop
    assert_eq!(instrument.opened(), 3);
    assert_eq!(instrument.open_handles(), 1);
}
