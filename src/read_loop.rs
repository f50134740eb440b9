//! Read Loop Controller.
//!
//! Drives the `:READ?` request/response cycle on a connected [`Session`] and reports
//! every result through a [`NotificationSink`].
//!
//! ## Per-Iteration Protocol
//!
//! 1. Exit if `measuring` was cleared or the deadline passed.
//! 2. Write `:READ?` and read one line under the per-read timeout.
//! 3. A failed read reconnects up to [`SessionPolicy::max_reconnects`] times, re-issuing
//!    the query on each fresh handle.
//! 4. Success emits a measurement and resets the consecutive-error counter. Failure always
//!    emits a failure event, then aborts once the budget is spent, ends the run if a stop
//!    arrived meanwhile, or backs off.
//! 5. Pause for the fixed inter-iteration delay.
//!
//! `measuring` is set by [`ReadLoop::begin`] before any worker is spawned and cleared by
//! a guard on every exit path, including cancellation of the worker task.

use crate::error::{AppResult, DaqError, TransportError};
use crate::events::{FailureInfo, FailureKind, MeasurementEvent, NotificationSink};
use crate::hardware::transport::{bounded, TimeoutOverride};
use crate::policy::{SessionPolicy, READ_QUERY};
use crate::session::{Session, TransportSlot};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// `measuring` was cleared by Stop or Disconnect.
    Stopped,
    /// The duration limit was reached.
    Elapsed,
    /// The consecutive-error budget ran out.
    Aborted,
    /// The transport was gone at the top of an iteration.
    Disconnected,
}

/// Totals for one finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Successful reads.
    pub measurements: u64,
    /// Failure events emitted, terminal ones included.
    pub failures: u64,
    /// Why the run ended.
    pub outcome: RunOutcome,
    /// Message of the last failure, if any cycle failed.
    pub last_error: Option<String>,
}

/// Entry point of the read loop.
pub struct ReadLoop;

impl ReadLoop {
    /// Claim the session for a run.
    ///
    /// Sets `measuring` immediately, so a Stop issued before the worker is scheduled is
    /// still observed.
    ///
    /// # Errors
    /// `NotConnected` or `AlreadyMeasuring`; `measuring` is left untouched.
    pub fn begin(session: Arc<Session>, sink: Arc<dyn NotificationSink>) -> AppResult<ActiveRun> {
        session.begin_measuring()?;
        Ok(ActiveRun {
            guard: MeasuringGuard {
                session: Arc::clone(&session),
            },
            session,
            sink,
        })
    }

    /// Run until stopped.
    pub async fn run_unbounded(
        session: Arc<Session>,
        sink: Arc<dyn NotificationSink>,
    ) -> AppResult<RunSummary> {
        Ok(Self::begin(session, sink)?.run_unbounded().await)
    }

    /// Run until stopped or `duration` has elapsed.
    pub async fn run_for_duration(
        session: Arc<Session>,
        sink: Arc<dyn NotificationSink>,
        duration: Duration,
    ) -> AppResult<RunSummary> {
        Ok(Self::begin(session, sink)?.run_for_duration(duration).await)
    }
}

/// Clears `measuring` when dropped.
struct MeasuringGuard {
    session: Arc<Session>,
}

impl Drop for MeasuringGuard {
    fn drop(&mut self) {
        self.session.end_measuring();
    }
}

enum Cycle {
    Reading(String),
    Failed(FailureKind, String),
    Missing,
}

/// A claimed run that has not been driven yet.
pub struct ActiveRun {
    session: Arc<Session>,
    sink: Arc<dyn NotificationSink>,
    guard: MeasuringGuard,
}

impl ActiveRun {
    /// Drive the run until stopped.
    pub async fn run_unbounded(self) -> RunSummary {
        self.run(None).await
    }

    /// Drive the run until stopped or `duration` has elapsed.
    pub async fn run_for_duration(self, duration: Duration) -> RunSummary {
        self.run(Some(duration)).await
    }

    #[instrument(skip(self), fields(resource = %self.session.resource()))]
    async fn run(self, limit: Option<Duration>) -> RunSummary {
        let policy = self.session.policy().clone();
        let deadline = limit.map(|limit| Instant::now() + limit);
        info!(limit_ms = limit.map(|l| l.as_millis() as u64), "Measurement started");

        let mut measurements = 0u64;
        let mut failures = 0u64;
        let mut consecutive_errors = 0u32;
        let mut last_error = None;

        let outcome = loop {
            if !self.session.is_measuring() {
                break RunOutcome::Stopped;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break RunOutcome::Elapsed;
            }

            match self.cycle(&policy).await {
                Cycle::Reading(reading) => {
                    consecutive_errors = 0;
                    measurements += 1;
                    self.sink.on_measurement(&MeasurementEvent {
                        reading,
                        sequence: measurements,
                    });
                }
                Cycle::Missing => {
                    warn!("Transport lost, ending run");
                    self.session.mark_disconnected();
                    let message = DaqError::NotConnected.to_string();
                    failures += 1;
                    self.sink.on_error(&FailureInfo::terminal(
                        FailureKind::Disconnected,
                        &message,
                        consecutive_errors,
                    ));
                    last_error = Some(message);
                    break RunOutcome::Disconnected;
                }
                Cycle::Failed(kind, message) => {
                    consecutive_errors += 1;
                    failures += 1;
                    warn!(consecutive_errors, kind = %kind, error = %message, "Read cycle failed");
                    self.sink
                        .on_error(&FailureInfo::cycle(kind, &message, consecutive_errors));

                    if consecutive_errors >= policy.max_consecutive_errors {
                        let abort = DaqError::LoopAborted {
                            consecutive_errors,
                            last_error: message,
                        }
                        .to_string();
                        error!(consecutive_errors, "{abort}");
                        self.sink.on_error(&FailureInfo::terminal(
                            FailureKind::LoopAbort,
                            &abort,
                            consecutive_errors,
                        ));
                        last_error = Some(abort);
                        break RunOutcome::Aborted;
                    }
                    last_error = Some(message);
                    if !self.session.is_measuring() {
                        debug!("Stop requested after failed cycle");
                        break RunOutcome::Stopped;
                    }

                    pause(policy.read_backoff(consecutive_errors), deadline).await;
                }
            }

            pause(policy.iteration_delay, deadline).await;
        };

        drop(self.guard);
        info!(?outcome, measurements, failures, "Measurement finished");
        RunSummary {
            measurements,
            failures,
            outcome,
            last_error,
        }
    }

    /// One write-query/read-response exchange. Holds the transport for its duration.
    async fn cycle(&self, policy: &SessionPolicy) -> Cycle {
        let mut slot = self.session.lock_transport().await;
        let Some(handle) = slot.as_mut() else {
            return Cycle::Missing;
        };

        {
            let mut io = TimeoutOverride::new(handle.as_mut(), policy.read_timeout);
            if let Err(err) = bounded(policy.read_timeout, io.write_line(READ_QUERY)).await {
                return Cycle::Failed(FailureKind::Write, DaqError::Write(err).to_string());
            }
        }

        match self.read_with_reconnect(&mut slot, policy).await {
            Ok(reading) => Cycle::Reading(reading),
            Err(err) => Cycle::Failed(failure_kind(&err), err.to_string()),
        }
    }

    /// Read the pending response, reconnecting on timeout or I/O failure.
    ///
    /// Gives up early if `measuring` is cleared between reconnects. The handle is still
    /// replaced once, so a late response cannot reach the next run.
    async fn read_with_reconnect(
        &self,
        slot: &mut TransportSlot,
        policy: &SessionPolicy,
    ) -> AppResult<String> {
        let mut last = match read_pending(slot, policy.read_timeout).await {
            Ok(reading) => return Ok(reading),
            Err(err) => err,
        };

        for attempt in 1..=policy.max_reconnects {
            if !self.session.is_measuring() {
                debug!(error = %last, "Stop requested, replacing handle without retrying");
                if let Err(err) = self.session.reopen(slot).await {
                    warn!(error = %err, "Could not replace handle after stop");
                }
                return Err(DaqError::Read(last));
            }
            warn!(attempt, error = %last, "Read failed, reconnecting");

            if let Err(err) = self.session.reopen(slot).await {
                warn!(attempt, error = %err, "Reconnect failed");
                last = err;
                continue;
            }

            match query(slot, policy.read_timeout).await {
                Ok(reading) => {
                    info!(attempt, "Read recovered after reconnect");
                    return Ok(reading);
                }
                Err(err) => last = err,
            }
        }

        if policy.max_reconnects == 0 {
            return Err(DaqError::Read(last));
        }
        Err(DaqError::ReadTimeout {
            attempts: policy.max_reconnects,
            last_error: last.to_string(),
        })
    }
}

/// Read one line from the handle in `slot` under `timeout`.
async fn read_pending(slot: &mut TransportSlot, timeout: Duration) -> Result<String, TransportError> {
    let handle = slot.as_mut().ok_or(TransportError::Closed)?;
    let mut io = TimeoutOverride::new(handle.as_mut(), timeout);
    bounded(timeout, io.read_line()).await
}

/// Write `:READ?` and read the response.
async fn query(slot: &mut TransportSlot, timeout: Duration) -> Result<String, TransportError> {
    let handle = slot.as_mut().ok_or(TransportError::Closed)?;
    let mut io = TimeoutOverride::new(handle.as_mut(), timeout);
    bounded(timeout, io.write_line(READ_QUERY)).await?;
    bounded(timeout, io.read_line()).await
}

fn failure_kind(err: &DaqError) -> FailureKind {
    match err {
        DaqError::ReadTimeout { .. } => FailureKind::Timeout,
        DaqError::Read(cause) if cause.is_timeout() => FailureKind::Timeout,
        DaqError::Write(_) => FailureKind::Write,
        _ => FailureKind::Read,
    }
}

/// Sleep for `delay`, but never past `deadline`.
async fn pause(delay: Duration, deadline: Option<Instant>) {
    let wake = Instant::now() + delay;
    sleep_until(deadline.map_or(wake, |deadline| wake.min(deadline))).await;
}
