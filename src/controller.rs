//! Caller-facing session controller.
//!
//! [`SessionController`] is what a UI (or the CLI) drives: it connects and disconnects
//! the [`Session`], runs the read loop on a background tokio task, and publishes a
//! [`SessionStatus`] on a `watch` channel so the front-end can render
//! "Connecting…", "Connected", "Reading…", "Disconnected" and terminal errors.
//!
//! Start/Stop return immediately. Connect and Disconnect are async and never wait on a
//! whole run; Disconnect waits only for the in-flight read cycle to finish.
//!
//! # Example
//!
//! ```rust,ignore
//! let (sink, mut events) = ChannelSink::new();
//! let controller = SessionController::new(session, Arc::new(sink));
//! controller.connect().await?;
//! controller.start_for_duration(Duration::from_secs(10))?;
//! while let Some(event) = events.recv().await { /* render */ }
//! let summary = controller.wait().await?;
//! controller.disconnect().await?;
//! ```

use crate::error::{AppResult, DaqError};
use crate::events::NotificationSink;
use crate::read_loop::{ReadLoop, RunOutcome, RunSummary};
use crate::session::Session;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// User-visible state of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// No transport is open.
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// Connected and idle.
    Connected,
    /// A measurement run is active.
    Reading,
    /// Terminal error of the last connect or run.
    Failed(String),
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Disconnected => f.write_str("Disconnected"),
            SessionStatus::Connecting => f.write_str("Connecting…"),
            SessionStatus::Connected => f.write_str("Connected"),
            SessionStatus::Reading => f.write_str("Reading…"),
            SessionStatus::Failed(message) => write!(f, "Error: {message}"),
        }
    }
}

/// Status channel plus an epoch so a finishing worker cannot overwrite a newer state.
struct StatusBoard {
    tx: watch::Sender<SessionStatus>,
    epoch: AtomicU64,
}

impl StatusBoard {
    /// Publish `status` and invalidate every older publisher.
    fn advance(&self, status: SessionStatus) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx.send_replace(status);
        epoch
    }

    /// Publish `status` only if nothing newer was published since `epoch`.
    fn publish_if_current(&self, epoch: u64, status: SessionStatus) {
        self.tx.send_if_modified(|current| {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            *current = status;
            true
        });
    }
}

/// Drives one [`Session`] on behalf of a front-end.
pub struct SessionController {
    session: Arc<Session>,
    sink: Arc<dyn NotificationSink>,
    status: Arc<StatusBoard>,
    worker: Mutex<Option<JoinHandle<RunSummary>>>,
}

impl SessionController {
    /// Wrap `session`; every run reports to `sink`.
    pub fn new(session: Arc<Session>, sink: Arc<dyn NotificationSink>) -> Self {
        let (tx, _rx) = watch::channel(SessionStatus::Disconnected);
        Self {
            session,
            sink,
            status: Arc::new(StatusBoard {
                tx,
                epoch: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// The underlying session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Receiver for status changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.tx.subscribe()
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.status.tx.borrow().clone()
    }

    /// See [`Session::is_connected`].
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// See [`Session::is_measuring`].
    pub fn is_measuring(&self) -> bool {
        self.session.is_measuring()
    }

    /// Connect with retry; returns the instrument identification.
    pub async fn connect(&self) -> AppResult<String> {
        if self.session.is_measuring() {
            return Err(DaqError::AlreadyMeasuring);
        }

        self.status.advance(SessionStatus::Connecting);
        match self.session.connect().await {
            Ok(identity) => {
                self.status.advance(SessionStatus::Connected);
                Ok(identity)
            }
            Err(err) => {
                self.status.advance(SessionStatus::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    /// Stop any run, close the transport and wait for the worker to exit.
    ///
    /// Idempotent. Returns the summary of the run that was active, if any.
    pub async fn disconnect(&self) -> AppResult<Option<RunSummary>> {
        let was_connected = self.session.is_connected();
        self.session.disconnect().await;
        let summary = self.wait().await?;

        if was_connected || summary.is_some() {
            info!(resource = %self.session.resource(), "Session closed");
        }
        self.status.advance(SessionStatus::Disconnected);
        Ok(summary)
    }

    /// Start a run that continues until stopped.
    pub fn start_unbounded(&self) -> AppResult<()> {
        self.start(None)
    }

    /// Start a run that ends after `duration` unless stopped earlier.
    pub fn start_for_duration(&self, duration: Duration) -> AppResult<()> {
        self.start(Some(duration))
    }

    fn start(&self, limit: Option<Duration>) -> AppResult<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let run = ReadLoop::begin(Arc::clone(&self.session), Arc::clone(&self.sink))?;
        if let Some(previous) = worker.take() {
            debug!(finished = previous.is_finished(), "Replacing previous worker handle");
        }

        let epoch = self.status.advance(SessionStatus::Reading);
        let status = Arc::clone(&self.status);
        let session = Arc::clone(&self.session);

        *worker = Some(tokio::spawn(async move {
            let summary = match limit {
                Some(duration) => run.run_for_duration(duration).await,
                None => run.run_unbounded().await,
            };
            status.publish_if_current(epoch, status_after(&summary, &session));
            summary
        }));
        Ok(())
    }

    /// Ask the running loop to exit. Does not wait and does not disconnect.
    ///
    /// # Errors
    /// `NotConnected` if the session is disconnected.
    pub fn stop(&self) -> AppResult<()> {
        self.session.request_stop()
    }

    /// Wait for the current worker to finish, returning its summary.
    pub async fn wait(&self) -> AppResult<Option<RunSummary>> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle
                .await
                .map(Some)
                .map_err(|err| DaqError::Worker(err.to_string())),
            None => Ok(None),
        }
    }

    /// Stop, wait for the worker, then disconnect.
    pub async fn shutdown(&self) -> AppResult<Option<RunSummary>> {
        if self.session.is_connected() {
            self.stop()?;
        }
        let summary = self.wait().await?;
        let late = self.disconnect().await?;
        Ok(summary.or(late))
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.session.end_measuring();
        if let Some(handle) = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

fn status_after(summary: &RunSummary, session: &Session) -> SessionStatus {
    match (&summary.outcome, &summary.last_error) {
        (RunOutcome::Aborted | RunOutcome::Disconnected, Some(message)) => {
            SessionStatus::Failed(message.clone())
        }
        _ if session.is_connected() => SessionStatus::Connected,
        _ => SessionStatus::Disconnected,
    }
}
