//! Log output of the connect and measurement paths.

use gpib_daq::hardware::mock::MockInstrument;
use gpib_daq::{ChannelSink, ReadLoop, Session};
use std::sync::Arc;
use tracing_test::traced_test;

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_connect_logs_failed_attempts_and_identity() {
    let instrument = MockInstrument::new().fail_validation(1);
    let session = Session::new("GPIB0::1::INSTR", instrument.factory());

    session.connect().await.unwrap();

    assert!(logs_contain("Connect attempt failed"));
    assert!(logs_contain("Instrument validated"));
    assert!(logs_contain("KEITHLEY"));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_abort_is_logged_at_error() {
    let instrument = MockInstrument::new();
    let session = Arc::new(Session::new("GPIB0::1::INSTR", instrument.factory()));
    session.connect().await.unwrap();
    let _instrument = instrument.fail_writes(5);
    let (sink, _events) = ChannelSink::new();

    ReadLoop::run_unbounded(Arc::clone(&session), Arc::new(sink))
        .await
        .unwrap();

    assert!(logs_contain("ERROR"));
    assert!(logs_contain("Measurement stopped after 5 consecutive errors"));
    assert!(logs_contain("Measurement finished"));
}
