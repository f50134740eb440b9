//! Transport Handle capability.
//!
//! The session core only needs a narrow line-oriented channel to the instrument:
//! write a line, read a line, and a per-call timeout that can be changed. Concrete
//! drivers (VISA-style GPIB controllers, serial ports, raw sockets, the mock
//! instrument) implement [`Transport`]; [`TransportFactory`] opens them by resource
//! string.
//!
//! # Contract
//! - `read_line` returns one response without its line terminator
//! - every call gives up after [`Transport::timeout`] with [`TransportError::Timeout`]
//! - `close` is idempotent; dropping an unclosed handle releases the OS resource

use crate::error::TransportError;
use async_trait::async_trait;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Open bidirectional text channel to one instrument.
#[async_trait]
pub trait Transport: Send {
    /// Write `text` followed by the line terminator.
    async fn write_line(&mut self, text: &str) -> Result<(), TransportError>;

    /// Read one response line.
    async fn read_line(&mut self) -> Result<String, TransportError>;

    /// Current per-call I/O timeout.
    fn timeout(&self) -> Duration;

    /// Replace the per-call I/O timeout.
    fn set_timeout(&mut self, timeout: Duration);

    /// Release the channel. Calling this on a closed handle is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Opens [`Transport`] handles by resource string.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a fresh handle to `resource`.
    async fn open(&self, resource: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// Temporarily substitutes the I/O timeout of a handle.
///
/// The original timeout is restored when the guard is dropped, on every exit path.
///
/// ```rust,ignore
/// let mut probe = TimeoutOverride::new(handle.as_mut(), Duration::from_secs(2));
/// probe.write_line("*IDN?").await?;
/// let idn = probe.read_line().await?;
/// // original timeout restored here
/// ```
pub struct TimeoutOverride<'a> {
    transport: &'a mut dyn Transport,
    original: Duration,
}

impl<'a> TimeoutOverride<'a> {
    /// Install `timeout` on `transport` until the guard is dropped.
    pub fn new(transport: &'a mut dyn Transport, timeout: Duration) -> Self {
        let original = transport.timeout();
        transport.set_timeout(timeout);
        Self {
            transport,
            original,
        }
    }

    /// Timeout that will be restored.
    pub fn original(&self) -> Duration {
        self.original
    }
}

impl<'a> Deref for TimeoutOverride<'a> {
    type Target = dyn Transport + 'a;

    fn deref(&self) -> &Self::Target {
        self.transport
    }
}

impl<'a> DerefMut for TimeoutOverride<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.transport
    }
}

impl Drop for TimeoutOverride<'_> {
    fn drop(&mut self) {
        self.transport.set_timeout(self.original);
    }
}

/// Run a transport operation under a hard deadline.
///
/// Elapsing maps to [`TransportError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, operation: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::time::timeout(limit, operation)
        .await
        .unwrap_or(Err(TransportError::Timeout(limit)))
}
