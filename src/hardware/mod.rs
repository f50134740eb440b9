//! Hardware Transports
//!
//! Low-level instrument communication (VISA resource strings, GPIB controller,
//! serial, raw socket) behind the [`Transport`] capability, plus a scripted mock.

pub mod mock;
pub mod resource;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod stream;
pub mod tcp;
pub mod transport;
pub mod visa;

pub use resource::ResourceAddress;
pub use transport::{bounded, TimeoutOverride, Transport, TransportFactory};
pub use visa::VisaTransportFactory;
