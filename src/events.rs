//! Notification surface for measurement runs.
//!
//! The read loop reports every successful cycle as a [`MeasurementEvent`] and every
//! failed cycle (or terminal abort) as a [`FailureInfo`] through an injected
//! [`NotificationSink`]. Sinks are called inline from the worker and must not block;
//! [`ChannelSink`] forwards events to an unbounded mpsc channel so a separate observer
//! task can render them.
//!
//! # Event Flow
//!
//! ```text
//! Read loop (worker)                  Observer task
//! ------------------                  -------------
//! cycle ok   -> on_measurement  ----> SessionEvent::Measurement
//! cycle err  -> on_error        ----> SessionEvent::Failure
//! abort      -> on_error (terminal)
//! ```

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Raw response of one successful `:READ?` cycle.
///
/// The core does not timestamp readings; elapsed time belongs to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeasurementEvent {
    /// Response line exactly as returned by the instrument.
    pub reading: String,
    /// 1-based position of this measurement within the run.
    pub sequence: u64,
}

/// What went wrong in a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Writing the read query failed.
    Write,
    /// Reading the response failed with an I/O error.
    Read,
    /// Reading the response timed out, including after exhausting reconnects.
    Timeout,
    /// The transport disappeared underneath the loop.
    Disconnected,
    /// The consecutive-error budget ran out.
    LoopAbort,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Write => "write",
            FailureKind::Read => "read",
            FailureKind::Timeout => "timeout",
            FailureKind::Disconnected => "disconnected",
            FailureKind::LoopAbort => "loop abort",
        };
        f.write_str(name)
    }
}

/// One failed cycle, or the terminal abort of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureInfo {
    /// What failed.
    pub kind: FailureKind,
    /// Human-readable cause.
    pub message: String,
    /// Consecutive failures including this one.
    pub consecutive_errors: u32,
    /// Whether the run ended with this failure.
    pub terminal: bool,
}

impl FailureInfo {
    pub(crate) fn cycle(kind: FailureKind, message: impl Into<String>, consecutive_errors: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            consecutive_errors,
            terminal: false,
        }
    }

    pub(crate) fn terminal(kind: FailureKind, message: impl Into<String>, consecutive_errors: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            consecutive_errors,
            terminal: true,
        }
    }
}

impl fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failure ({} consecutive): {}",
            self.kind, self.consecutive_errors, self.message
        )
    }
}

/// Event as delivered through [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A successful read.
    Measurement(MeasurementEvent),
    /// A failed cycle or the end of a run.
    Failure(FailureInfo),
}

/// Receiver of read-loop notifications.
///
/// Called from the measurement worker, once per cycle and in loop order. Implementations
/// must return promptly; the loop does not wait for downstream processing.
pub trait NotificationSink: Send + Sync {
    /// Called once per successful read.
    fn on_measurement(&self, event: &MeasurementEvent);

    /// Called once per failed cycle, and once more for a terminal failure.
    fn on_error(&self, failure: &FailureInfo);
}

impl<T: NotificationSink + ?Sized> NotificationSink for Arc<T> {
    fn on_measurement(&self, event: &MeasurementEvent) {
        (**self).on_measurement(event);
    }

    fn on_error(&self, failure: &FailureInfo) {
        (**self).on_error(failure);
    }
}

/// Sink that forwards every event to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its events arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SessionEvent) {
        // A dropped observer only means nobody is listening anymore.
        if self.tx.send(event).is_err() {
            tracing::trace!("event observer gone, dropping notification");
        }
    }
}

impl NotificationSink for ChannelSink {
    fn on_measurement(&self, event: &MeasurementEvent) {
        self.forward(SessionEvent::Measurement(event.clone()));
    }

    fn on_error(&self, failure: &FailureInfo) {
        self.forward(SessionEvent::Failure(failure.clone()));
    }
}
