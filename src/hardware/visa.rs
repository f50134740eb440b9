//! VISA-style transport factory for GPIB/serial/Ethernet instruments
//!
//! Resolves a resource string to a concrete transport:
//! - "GPIB0::1::INSTR" through a GPIB-USB controller on the configured serial port
//! - "ASRL/dev/ttyUSB0::INSTR" directly on the named serial port
//! - "TCPIP0::192.168.1.100::5025::SOCKET" over a raw socket

use crate::config::Settings;
use crate::error::TransportError;
use crate::hardware::resource::ResourceAddress;
use crate::hardware::tcp;
use crate::hardware::transport::{Transport, TransportFactory};
use async_trait::async_trait;
use std::time::Duration;

/// Opens transports for VISA resource strings.
#[derive(Debug, Clone)]
pub struct VisaTransportFactory {
    /// Serial port of the GPIB controller
    pub(crate) controller_port: String,

    /// Baud rate for serial resources and the controller
    pub(crate) baud_rate: u32,

    /// Default per-call I/O timeout of opened handles
    pub(crate) timeout: Duration,
}

impl VisaTransportFactory {
    /// Create a factory with default settings
    ///
    /// # Arguments
    /// * `controller_port` - Serial port of the GPIB-USB controller (e.g., "/dev/ttyUSB0")
    pub fn new(controller_port: impl Into<String>) -> Self {
        Self {
            controller_port: controller_port.into(),
            baud_rate: 115_200,
            timeout: Duration::from_secs(5),
        }
    }

    /// Build from application settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.serial_port.clone())
            .with_baud_rate(settings.baud_rate)
            .with_timeout(settings.io_timeout())
    }

    /// Set default I/O timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

#[async_trait]
impl TransportFactory for VisaTransportFactory {
    async fn open(&self, resource: &str) -> Result<Box<dyn Transport>, TransportError> {
        let address: ResourceAddress = resource.parse().map_err(|_| TransportError::Open {
            resource: resource.to_string(),
            reason: "unsupported resource string".into(),
        })?;

        match address {
            ResourceAddress::TcpSocket { host, port } => {
                let transport = tcp::open_socket(&host, port, self.timeout).await?;
                Ok(Box::new(transport))
            }
            #[cfg(feature = "instrument_serial")]
            ResourceAddress::Serial { port } => {
                let transport =
                    crate::hardware::serial::open_serial(&port, self.baud_rate, self.timeout)?;
                Ok(Box::new(transport))
            }
            #[cfg(feature = "instrument_serial")]
            ResourceAddress::Gpib {
                primary, secondary, ..
            } => {
                let transport = crate::hardware::serial::PrologixTransport::open(
                    &self.controller_port,
                    self.baud_rate,
                    primary,
                    secondary,
                    self.timeout,
                )
                .await?;
                Ok(Box::new(transport))
            }
            #[cfg(not(feature = "instrument_serial"))]
            ResourceAddress::Serial { .. } | ResourceAddress::Gpib { .. } => {
                Err(TransportError::Open {
                    resource: resource.to_string(),
                    reason: "Serial support not enabled. Rebuild with --features instrument_serial"
                        .into(),
                })
            }
        }
    }
}
