//! VISA resource string parsing.
//!
//! Supported forms:
//! - `GPIB0::1::INSTR`, `GPIB0::1::0::INSTR` (board, primary, optional secondary)
//! - `ASRL/dev/ttyUSB0::INSTR`, `ASRLCOM3::INSTR` (serial port by name)
//! - `TCPIP0::192.168.1.100::5025::SOCKET` (raw SCPI socket)

use crate::error::DaqError;
use std::fmt;
use std::str::FromStr;

/// Parsed instrument endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAddress {
    /// Device on a GPIB bus.
    Gpib {
        /// Interface board number.
        board: u8,
        /// Primary address (0-30).
        primary: u8,
        /// Optional secondary address (96-126 on the wire, stored as given).
        secondary: Option<u8>,
    },
    /// Serial instrument.
    Serial {
        /// OS port name, e.g. `/dev/ttyUSB0` or `COM3`.
        port: String,
    },
    /// Raw TCP socket.
    TcpSocket {
        /// Host name or IP address.
        host: String,
        /// TCP port.
        port: u16,
    },
}

impl FromStr for ResourceAddress {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DaqError::InvalidResource(s.to_string());
        let parts: Vec<&str> = s.trim().split("::").collect();
        let head = parts.first().copied().unwrap_or_default();
        let upper = head.to_ascii_uppercase();

        if let Some(board) = upper.strip_prefix("GPIB") {
            let board = parse_board(board).ok_or_else(invalid)?;
            return match parts.as_slice() {
                [_, primary, class] if class.eq_ignore_ascii_case("INSTR") => {
                    Ok(ResourceAddress::Gpib {
                        board,
                        primary: parse_primary(primary).ok_or_else(invalid)?,
                        secondary: None,
                    })
                }
                [_, primary, secondary, class] if class.eq_ignore_ascii_case("INSTR") => {
                    Ok(ResourceAddress::Gpib {
                        board,
                        primary: parse_primary(primary).ok_or_else(invalid)?,
                        secondary: Some(secondary.parse().map_err(|_| invalid())?),
                    })
                }
                _ => Err(invalid()),
            };
        }

        if upper.starts_with("ASRL") {
            return match parts.as_slice() {
                [_, class] if class.eq_ignore_ascii_case("INSTR") => {
                    let port = &head[4..];
                    if port.is_empty() {
                        return Err(invalid());
                    }
                    Ok(ResourceAddress::Serial {
                        port: port.to_string(),
                    })
                }
                _ => Err(invalid()),
            };
        }

        if let Some(board) = upper.strip_prefix("TCPIP") {
            parse_board(board).ok_or_else(invalid)?;
            return match parts.as_slice() {
                [_, host, port, class] if class.eq_ignore_ascii_case("SOCKET") => {
                    if host.is_empty() {
                        return Err(invalid());
                    }
                    Ok(ResourceAddress::TcpSocket {
                        host: host.to_string(),
                        port: port.parse().map_err(|_| invalid())?,
                    })
                }
                _ => Err(invalid()),
            };
        }

        Err(invalid())
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAddress::Gpib {
                board,
                primary,
                secondary: None,
            } => write!(f, "GPIB{board}::{primary}::INSTR"),
            ResourceAddress::Gpib {
                board,
                primary,
                secondary: Some(secondary),
            } => write!(f, "GPIB{board}::{primary}::{secondary}::INSTR"),
            ResourceAddress::Serial { port } => write!(f, "ASRL{port}::INSTR"),
            ResourceAddress::TcpSocket { host, port } => write!(f, "TCPIP0::{host}::{port}::SOCKET"),
        }
    }
}

fn parse_board(digits: &str) -> Option<u8> {
    if digits.is_empty() {
        return Some(0);
    }
    digits.parse().ok()
}

fn parse_primary(text: &str) -> Option<u8> {
    text.parse().ok().filter(|addr| *addr <= 30)
}
