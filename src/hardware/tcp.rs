//! Raw SCPI socket transport (`TCPIP0::host::port::SOCKET`).

use crate::error::TransportError;
use crate::hardware::stream::StreamTransport;
use crate::hardware::transport::bounded;
use std::time::Duration;
use tokio::net::TcpStream;

/// Conventional raw-socket SCPI port.
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// Open a socket to `host:port`, giving up after `timeout`.
pub async fn open_socket(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<StreamTransport<TcpStream>, TransportError> {
    let open_error = |reason: String| TransportError::Open {
        resource: format!("{host}:{port}"),
        reason,
    };

    let stream = bounded(timeout, async {
        TcpStream::connect((host, port))
            .await
            .map_err(|e| open_error(e.to_string()))
    })
    .await
    .map_err(|e| match e {
        TransportError::Timeout(_) => open_error(format!("connect timeout after {}ms", timeout.as_millis())),
        other => other,
    })?;

    // Disable Nagle's algorithm for low latency
    stream
        .set_nodelay(true)
        .map_err(|e| open_error(e.to_string()))?;

    tracing::info!(host, port, "Connected to instrument socket");
    Ok(StreamTransport::new(
        stream,
        format!("TCPIP0::{host}::{port}::SOCKET"),
        timeout,
    ))
}
