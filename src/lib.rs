//! # GPIB DAQ Core Library
//!
//! Resilient session management for request/response instruments on a GPIB-style bus.
//! The library opens a connection to one instrument, proves it is alive with `*IDN?`,
//! and then polls it with `:READ?` on a background task, surviving timeouts and dropped
//! links without operator intervention. Front-ends (the `gpib-daq` CLI, or a GUI) drive
//! it through [`controller::SessionController`].
//!
//! ## Crate Structure
//!
//! - **`config`**: `Settings` loaded with figment from a TOML file and `GPIB_DAQ_`
//!   environment variables, with explicit save.
//! - **`controller`**: The caller-facing facade. Connect/Disconnect, Start/Stop, and a
//!   `watch` channel of `SessionStatus` for the UI.
//! - **`error`**: `DaqError` and `TransportError`, the crate's error taxonomy.
//! - **`events`**: Measurement and failure notifications and the `NotificationSink` trait.
//! - **`hardware`**: The `Transport` capability, VISA-style resource parsing, concrete
//!   socket/serial/GPIB-controller transports, and a scripted mock instrument.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`policy`**: Retry counts, timeouts and backoff formulas.
//! - **`read_loop`**: The measurement loop with reconnect and consecutive-error budget.
//! - **`session`**: Connect-with-retry, validation, disconnect and status flags.

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod hardware;
pub mod logging;
pub mod policy;
pub mod read_loop;
pub mod session;

pub use controller::{SessionController, SessionStatus};
pub use error::{AppResult, DaqError, TransportError};
pub use events::{ChannelSink, FailureInfo, FailureKind, MeasurementEvent, NotificationSink, SessionEvent};
pub use read_loop::{ReadLoop, RunOutcome, RunSummary};
pub use session::Session;
