//! Mock instrument for testing without physical hardware.
//!
//! [`MockInstrument`] is a scripted SCPI device shared by every handle its
//! [`MockTransportFactory`] opens, so the script survives reconnects. It provides:
//! - queued identification and measurement replies, with fallbacks once a queue drains
//! - injectable open failures, write failures and hangs
//! - call logging, open/close counters and open timestamps for test verification
//!
//! All waits use `tokio::time::sleep`, so tests can run on a paused clock.
//!
//! # Example
//!
//! ```rust,ignore
//! let instrument = MockInstrument::new()
//!     .fail_validation(2)
//!     .queue_readings(["+1.0E-9", "+1.1E-9"]);
//! let session = Session::new("GPIB0::1::INSTR", instrument.factory());
//! session.connect().await?;
//! assert_eq!(instrument.open_attempts(), 3);
//! ```

use crate::error::TransportError;
use crate::hardware::transport::{Transport, TransportFactory};
use crate::policy::{IDN_QUERY, READ_QUERY};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Identification string returned by default.
pub const DEFAULT_IDENTITY: &str = "KEITHLEY INSTRUMENTS INC.,MODEL 6485,1234567,B04   Jun 24 2004 10:00:00/A02  /E";

/// Reading returned once the measurement queue is empty.
pub const DEFAULT_READING: &str = "+1.234560E-09A,+1.000000E+00,+0.000000E+00";

/// One scripted reply to a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Respond with this line.
    Line(String),
    /// Fail the read with this error.
    Fail(TransportError),
    /// Never answer; the read times out after the handle timeout.
    Hang,
}

impl MockReply {
    /// Shorthand for [`MockReply::Line`].
    pub fn line(text: impl Into<String>) -> Self {
        MockReply::Line(text.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Identify,
    Measure,
    Other,
}

#[derive(Debug)]
struct Script {
    idn: VecDeque<MockReply>,
    idn_fallback: MockReply,
    reads: VecDeque<MockReply>,
    read_fallback: MockReply,
    open_failures: u32,
    write_failures: u32,
    latency: Duration,
    default_timeout: Duration,
    open_attempts: u32,
    opened: u32,
    closed: u32,
    open_times: Vec<Instant>,
    call_log: Vec<String>,
}

/// Scripted instrument shared by all handles opened from its factory.
#[derive(Debug, Clone)]
pub struct MockInstrument {
    script: Arc<Mutex<Script>>,
}

impl MockInstrument {
    /// Instrument that identifies as a picoammeter and always returns [`DEFAULT_READING`].
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                idn: VecDeque::new(),
                idn_fallback: MockReply::line(DEFAULT_IDENTITY),
                reads: VecDeque::new(),
                read_fallback: MockReply::line(DEFAULT_READING),
                open_failures: 0,
                write_failures: 0,
                latency: Duration::ZERO,
                default_timeout: Duration::from_millis(5000),
                open_attempts: 0,
                opened: 0,
                closed: 0,
                open_times: Vec::new(),
                call_log: Vec::new(),
            })),
        }
    }

    /// Factory opening handles onto this instrument.
    pub fn factory(&self) -> Arc<MockTransportFactory> {
        Arc::new(MockTransportFactory {
            instrument: self.clone(),
        })
    }

    /// Identification string for every probe not otherwise scripted.
    pub fn with_identity(self, identity: impl Into<String>) -> Self {
        self.lock().idn_fallback = MockReply::line(identity);
        self
    }

    /// Answer the next `count` identification probes with an empty line.
    pub fn fail_validation(self, count: usize) -> Self {
        self.queue_idn(std::iter::repeat(MockReply::line("")).take(count))
    }

    /// Leave the next `count` identification probes unanswered.
    pub fn hang_validation(self, count: usize) -> Self {
        self.queue_idn(std::iter::repeat(MockReply::Hang).take(count))
    }

    /// Answer every identification probe with an empty line.
    pub fn never_validate(self) -> Self {
        self.lock().idn_fallback = MockReply::line("");
        self
    }

    /// Queue explicit identification replies.
    pub fn queue_idn(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        self.lock().idn.extend(replies);
        self
    }

    /// Queue successful measurement replies.
    pub fn queue_readings<I, S>(self, readings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queue_reads(readings.into_iter().map(MockReply::line))
    }

    /// Queue explicit measurement replies.
    pub fn queue_reads(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        self.lock().reads.extend(replies);
        self
    }

    /// Reply used once the measurement queue is empty.
    pub fn read_fallback(self, reply: MockReply) -> Self {
        self.lock().read_fallback = reply;
        self
    }

    /// Make the next `count` opens fail.
    pub fn fail_opens(self, count: u32) -> Self {
        self.lock().open_failures = count;
        self
    }

    /// Make the next `count` writes fail.
    pub fn fail_writes(self, count: u32) -> Self {
        self.lock().write_failures = count;
        self
    }

    /// Simulated per-operation latency.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    /// Queue more measurement replies on a running instrument.
    pub fn push_reads(&self, replies: impl IntoIterator<Item = MockReply>) {
        self.lock().reads.extend(replies);
    }

    /// Number of open calls, successful or not.
    pub fn open_attempts(&self) -> u32 {
        self.lock().open_attempts
    }

    /// Number of handles successfully opened.
    pub fn opened(&self) -> u32 {
        self.lock().opened
    }

    /// Number of handles released, by `close` or by drop.
    pub fn closed(&self) -> u32 {
        self.lock().closed
    }

    /// Handles opened and not yet released.
    pub fn open_handles(&self) -> u32 {
        let script = self.lock();
        script.opened - script.closed
    }

    /// Instants of every open call.
    pub fn open_times(&self) -> Vec<Instant> {
        self.lock().open_times.clone()
    }

    /// Copy of the call log.
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    /// Number of `write:<command>` entries in the call log.
    pub fn writes_of(&self, command: &str) -> usize {
        let needle = format!("write:{command}");
        self.lock()
            .call_log
            .iter()
            .filter(|entry| **entry == needle)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MockInstrument {
    fn default() -> Self {
        Self::new()
    }
}

/// [`TransportFactory`] for a [`MockInstrument`].
#[derive(Debug)]
pub struct MockTransportFactory {
    instrument: MockInstrument,
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn open(&self, resource: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (id, latency, timeout) = {
            let mut script = self.instrument.lock();
            script.open_attempts += 1;
            script.open_times.push(Instant::now());
            script.call_log.push(format!("open:{resource}"));
            if script.open_failures > 0 {
                script.open_failures -= 1;
                return Err(TransportError::Open {
                    resource: resource.to_string(),
                    reason: "mock open failure".into(),
                });
            }
            script.opened += 1;
            (script.opened, script.latency, script.default_timeout)
        };

        sleep(latency).await;
        Ok(Box::new(MockTransport {
            instrument: self.instrument.clone(),
            id,
            timeout,
            pending: None,
            closed: false,
        }))
    }
}

/// Handle onto a [`MockInstrument`].
#[derive(Debug)]
pub struct MockTransport {
    instrument: MockInstrument,
    id: u32,
    timeout: Duration,
    pending: Option<Pending>,
    closed: bool,
}

impl MockTransport {
    fn release(&mut self, how: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut script = self.instrument.lock();
        script.closed += 1;
        script.call_log.push(format!("{how}:{}", self.id));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write_line(&mut self, text: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let latency = {
            let mut script = self.instrument.lock();
            script.call_log.push(format!("write:{text}"));
            if script.write_failures > 0 {
                script.write_failures -= 1;
                return Err(TransportError::Io("mock write failure".into()));
            }
            script.latency
        };
        self.pending = Some(match text {
            IDN_QUERY => Pending::Identify,
            READ_QUERY => Pending::Measure,
            _ => Pending::Other,
        });
        sleep(latency).await;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let (reply, latency) = {
            let mut script = self.instrument.lock();
            script.call_log.push("read".into());
            let reply = match self.pending.take() {
                Some(Pending::Identify) => script
                    .idn
                    .pop_front()
                    .unwrap_or_else(|| script.idn_fallback.clone()),
                Some(Pending::Measure) => script
                    .reads
                    .pop_front()
                    .unwrap_or_else(|| script.read_fallback.clone()),
                Some(Pending::Other) | None => MockReply::Hang,
            };
            (reply, script.latency)
        };

        match reply {
            MockReply::Line(line) => {
                sleep(latency).await;
                Ok(line)
            }
            MockReply::Fail(err) => {
                sleep(latency).await;
                Err(err)
            }
            MockReply::Hang => {
                sleep(self.timeout).await;
                Err(TransportError::Timeout(self.timeout))
            }
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.release("close");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("MockTransport #{} ({}ms timeout)", self.id, self.timeout.as_millis())
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.release("drop");
    }
}
