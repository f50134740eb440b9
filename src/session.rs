//! Session Manager for one instrument endpoint.
//!
//! A [`Session`] owns at most one open [`Transport`] for its resource string and the two
//! status flags the rest of the crate coordinates on:
//!
//! - **`connected`**: set only after a successful connect-and-validate cycle, cleared on
//!   disconnect and whenever the transport is lost.
//! - **`measuring`**: the cooperative stop flag of the read loop. Cleared by
//!   [`Session::request_stop`] and [`Session::disconnect`]; the loop polls it.
//!
//! ## Connect Cycle
//!
//! Each attempt closes any stale handle, opens a fresh one, waits the settle delay and
//! probes the instrument with `*IDN?` under a shortened I/O timeout. Failed attempts
//! back off exponentially; the whole cycle gives up after
//! [`SessionPolicy::max_connect_attempts`].
//!
//! ## Handle Ownership
//!
//! The transport lives behind an async mutex. The read loop holds it for one cycle at a
//! time, so disconnect never closes a handle in the middle of a read and the controlling
//! context never interleaves I/O with the worker.

use crate::error::{AppResult, DaqError, TransportError};
use crate::hardware::transport::{bounded, TimeoutOverride, Transport, TransportFactory};
use crate::policy::{SessionPolicy, IDN_QUERY};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

pub(crate) type TransportSlot = Option<Box<dyn Transport>>;

/// Relationship between this process and one instrument endpoint.
pub struct Session {
    resource: String,
    factory: Arc<dyn TransportFactory>,
    policy: SessionPolicy,
    transport: Mutex<TransportSlot>,
    connected: AtomicBool,
    measuring: AtomicBool,
}

impl Session {
    /// Create a disconnected session for `resource` with the default policy.
    pub fn new(resource: impl Into<String>, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            resource: resource.into(),
            factory,
            policy: SessionPolicy::default(),
            transport: Mutex::new(None),
            connected: AtomicBool::new(false),
            measuring: AtomicBool::new(false),
        }
    }

    /// Replace the retry/timeout policy.
    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resource string this session opens.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Retry and timeout policy in effect.
    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// True while a validated transport is held.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// True while a read loop run is active and no stop was requested.
    pub fn is_measuring(&self) -> bool {
        self.measuring.load(Ordering::SeqCst)
    }

    /// Open and validate a transport, retrying with exponential backoff.
    ///
    /// Returns the instrument's identification string. On failure the session stays
    /// disconnected and no handle remains open.
    ///
    /// # Errors
    /// - `AlreadyMeasuring` if a run is active
    /// - `ConnectFailed` once every attempt has failed
    #[instrument(skip(self), fields(resource = %self.resource))]
    pub async fn connect(&self) -> AppResult<String> {
        if self.is_measuring() {
            return Err(DaqError::AlreadyMeasuring);
        }

        let mut slot = self.transport.lock().await;
        self.connected.store(false, Ordering::SeqCst);

        let max_attempts = self.policy.max_connect_attempts;
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            if let Some(stale) = slot.take() {
                debug!("closing stale handle before reconnecting");
                release(stale).await;
            }

            match self.attempt().await {
                Ok((handle, identity)) => {
                    info!(attempt, identity = %identity, "Instrument validated");
                    *slot = Some(handle);
                    self.connected.store(true, Ordering::SeqCst);
                    return Ok(identity);
                }
                Err(err) => {
                    warn!(attempt, max_attempts, error = %err, "Connect attempt failed");
                    last_error = match err {
                        DaqError::Read(cause) => cause.to_string(),
                        other => other.to_string(),
                    };
                }
            }

            if attempt < max_attempts {
                let delay = self.policy.connect_backoff(attempt);
                debug!(delay_ms = delay.as_millis() as u64, "Backing off before next attempt");
                sleep(delay).await;
            }
        }

        Err(DaqError::ConnectFailed {
            resource: self.resource.clone(),
            attempts: max_attempts,
            last_error,
        })
    }

    /// One open-settle-validate attempt. Closes the handle itself if validation fails.
    ///
    /// Open failures come back as `DaqError::Read`.
    async fn attempt(&self) -> AppResult<(Box<dyn Transport>, String)> {
        let mut handle = self.factory.open(&self.resource).await?;
        sleep(self.policy.settle_delay).await;

        match self.validate(handle.as_mut()).await {
            Ok(identity) => Ok((handle, identity)),
            Err(err) => {
                release(handle).await;
                Err(err)
            }
        }
    }

    /// Liveness probe: `*IDN?` must produce a non-empty line within the budget.
    async fn validate(&self, handle: &mut dyn Transport) -> AppResult<String> {
        let mut probe = TimeoutOverride::new(handle, self.policy.validation_io_timeout);
        let reply = bounded(self.policy.validation_budget, async {
            probe.write_line(IDN_QUERY).await?;
            probe.read_line().await
        })
        .await;
        drop(probe);

        match reply {
            Ok(identity) if !identity.trim().is_empty() => Ok(identity.trim().to_string()),
            Ok(_) => Err(DaqError::Validation("empty identification response".into())),
            Err(err) => Err(DaqError::Validation(err.to_string())),
        }
    }

    /// Clear `measuring`, close the handle if present and clear `connected`.
    ///
    /// Waits for an in-flight read cycle to finish before closing. Calling this on a
    /// disconnected session does nothing.
    #[instrument(skip(self), fields(resource = %self.resource))]
    pub async fn disconnect(&self) {
        self.measuring.store(false, Ordering::SeqCst);

        let mut slot = self.transport.lock().await;
        if let Some(handle) = slot.take() {
            release(handle).await;
            info!("Disconnected from instrument");
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Ask the read loop to exit at its next checkpoint. Does not disconnect.
    ///
    /// # Errors
    /// `NotConnected` if the session is disconnected; nothing is changed.
    pub fn request_stop(&self) -> AppResult<()> {
        if !self.is_connected() {
            return Err(DaqError::NotConnected);
        }
        if self.measuring.swap(false, Ordering::SeqCst) {
            debug!(resource = %self.resource, "Stop requested");
        }
        Ok(())
    }

    /// Enter the measuring state.
    pub(crate) fn begin_measuring(&self) -> AppResult<()> {
        if !self.is_connected() {
            return Err(DaqError::NotConnected);
        }
        self.measuring
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| DaqError::AlreadyMeasuring)
    }

    pub(crate) fn end_measuring(&self) {
        self.measuring.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn lock_transport(&self) -> MutexGuard<'_, TransportSlot> {
        self.transport.lock().await
    }

    /// Replace the handle in `slot` with a freshly opened one.
    ///
    /// Closes the stale handle, waits the reconnect delay, reopens the same resource and
    /// waits the reconnect settle time. No identification probe is run. `connected`
    /// follows whether a handle ended up in the slot.
    pub(crate) async fn reopen(&self, slot: &mut TransportSlot) -> Result<(), TransportError> {
        if let Some(stale) = slot.take() {
            release(stale).await;
        }
        sleep(self.policy.reconnect_delay).await;

        match self.factory.open(&self.resource).await {
            Ok(handle) => {
                sleep(self.policy.reconnect_settle).await;
                *slot = Some(handle);
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Record that the transport is gone.
    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("resource", &self.resource)
            .field("connected", &self.is_connected())
            .field("measuring", &self.is_measuring())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Dropping the handle releases it; close() would need the runtime.
        if self.transport.get_mut().take().is_some() {
            debug!(resource = %self.resource, "Released transport on session drop");
        }
    }
}

/// Close a handle, logging instead of propagating failures.
///
/// Bounded by the handle's own timeout; the handle is dropped either way.
pub(crate) async fn release(mut handle: Box<dyn Transport>) {
    let limit = handle.timeout();
    if let Err(err) = bounded(limit, handle.close()).await {
        warn!(transport = %handle.describe(), error = %err, "Error closing transport");
    }
}
