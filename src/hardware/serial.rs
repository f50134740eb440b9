//! Serial transports
//!
//! - Plain serial instruments (`ASRL/dev/ttyUSB0::INSTR`)
//! - GPIB instruments behind a Prologix-style GPIB-USB controller, which shows up as a
//!   serial port and is driven with `++` commands (`GPIB0::1::INSTR`)
//!
//! Baud: configurable (115200 default for the controller, which ignores it), 8N1, no
//! flow control.

use crate::error::TransportError;
use crate::hardware::stream::StreamTransport;
use crate::hardware::transport::Transport;
use async_trait::async_trait;
use std::time::Duration;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

const ESC: char = '\u{1b}';

/// Open a serial port as a line transport.
pub fn open_serial(
    port: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<StreamTransport<SerialStream>, TransportError> {
    let stream = tokio_serial::new(port, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(timeout)
        .open_native_async()
        .map_err(|e| TransportError::Open {
            resource: port.to_string(),
            reason: e.to_string(),
        })?;

    tracing::info!(port, baud_rate, "Opened serial port");
    Ok(StreamTransport::new(stream, format!("ASRL{port}::INSTR"), timeout))
}

/// GPIB device addressed through a Prologix-compatible controller.
pub struct PrologixTransport {
    inner: StreamTransport<SerialStream>,
    address: String,
}

impl PrologixTransport {
    /// Open the controller on `port` and address the device at `primary`/`secondary`.
    ///
    /// The controller is put in controller mode with auto-read disabled, so every
    /// response is fetched explicitly with `++read eoi`.
    pub async fn open(
        port: &str,
        baud_rate: u32,
        primary: u8,
        secondary: Option<u8>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut inner = open_serial(port, baud_rate, timeout)?;
        for command in setup_commands(primary, secondary, timeout) {
            inner.write_line(&command).await?;
        }

        let address = match secondary {
            Some(secondary) => format!("{primary}::{secondary}"),
            None => primary.to_string(),
        };
        tracing::info!(port, address = %address, "GPIB controller configured");
        Ok(Self { inner, address })
    }
}

#[async_trait]
impl Transport for PrologixTransport {
    async fn write_line(&mut self, text: &str) -> Result<(), TransportError> {
        self.inner.write_line(&escape_payload(text)).await
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        self.inner.write_line("++read eoi").await?;
        self.inner.read_line().await
    }

    fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.inner.set_timeout(timeout);
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    fn describe(&self) -> String {
        format!("GPIB {} via {}", self.address, self.inner.describe())
    }
}

/// Controller configuration sent once after the port opens.
fn setup_commands(primary: u8, secondary: Option<u8>, timeout: Duration) -> Vec<String> {
    let read_tmo = timeout.as_millis().clamp(1, 3000);
    let addr = match secondary {
        Some(secondary) => format!("++addr {primary} {secondary}"),
        None => format!("++addr {primary}"),
    };
    vec![
        "++mode 1".to_string(),
        "++auto 0".to_string(),
        "++eoi 1".to_string(),
        "++eos 2".to_string(),
        addr,
        format!("++read_tmo_ms {read_tmo}"),
    ]
}

/// Escape characters the controller would otherwise interpret.
fn escape_payload(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\r' | '\n' | '+') || c == ESC {
            escaped.push(ESC);
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_commands_primary_only() {
        let commands = setup_commands(1, None, Duration::from_millis(5000));
        assert_eq!(commands[0], "++mode 1");
        assert!(commands.contains(&"++auto 0".to_string()));
        assert!(commands.contains(&"++addr 1".to_string()));
        assert_eq!(commands.last().unwrap(), "++read_tmo_ms 3000");
    }

    #[test]
    fn test_setup_commands_secondary() {
        let commands = setup_commands(22, Some(96), Duration::from_millis(500));
        assert!(commands.contains(&"++addr 22 96".to_string()));
        assert_eq!(commands.last().unwrap(), "++read_tmo_ms 500");
    }

    #[test]
    fn test_plain_commands_are_not_escaped() {
        assert_eq!(escape_payload(":READ?"), ":READ?");
        assert_eq!(escape_payload("*IDN?"), "*IDN?");
    }

    #[test]
    fn test_special_characters_are_escaped() {
        assert_eq!(escape_payload("A+B"), "A\u{1b}+B");
        assert_eq!(escape_payload("x\ny"), "x\u{1b}\ny");
    }

    #[tokio::test]
    async fn test_missing_port_is_open_error() {
        let result = open_serial("/dev/does-not-exist-gpib", 9600, Duration::from_millis(100));
        assert!(matches!(result, Err(TransportError::Open { .. })));
    }
}
